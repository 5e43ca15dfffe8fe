//! Context switching between OS threads.
//!
//! Every logical kernel thread (a CPU's scheduler loop, or one process's
//! kernel side) is backed by its own OS thread with a `Strand`: a one-slot
//! mailbox the thread parks on. Switching stores the caller's strand in
//! `old`, hands the CPU binding to whatever `new` names, and parks until
//! somebody hands a binding back.
//!
//! A process that has never run has no strand yet, only an entry function;
//! the first switch into it spawns its thread. An exiting process leaves
//! through `switch_final`, which hands the CPU on and then unwinds its
//! thread back to `first_run`, where it ends.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use super::{BINDING, Binding, binding, set_binding};
use crate::memory::address::VirtAddr;

struct Strand {
    baton: Mutex<Option<Binding>>,
    ready: Condvar,
}

impl Strand {
    fn new() -> Self {
        Self { baton: Mutex::new(None), ready: Condvar::new() }
    }

    fn resume(&self, binding: Binding) {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        *baton = Some(binding);
        self.ready.notify_one();
    }

    fn park(&self) -> Binding {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(binding) = baton.take() {
                return binding;
            }
            baton = self.ready.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

thread_local! {
    static STRAND: RefCell<Option<Arc<Strand>>> = const { RefCell::new(None) };
}

fn current_strand() -> Arc<Strand> {
    STRAND.with(|slot| slot.borrow_mut().get_or_insert_with(|| Arc::new(Strand::new())).clone())
}

/// Saved state of a suspended kernel thread.
#[derive(Default)]
pub struct Context {
    strand: Option<Arc<Strand>>,
    entry: Option<fn() -> !>,
}

impl Context {
    pub const fn new() -> Self {
        Self { strand: None, entry: None }
    }

    /// A context that starts running `entry` the first time it is switched
    /// to. The kernel stack is only used on bare metal.
    pub fn new_entry(entry: fn() -> !, _stack_page: *mut u8, _stack_top: VirtAddr) -> Self {
        Self { strand: None, entry: Some(entry) }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("suspended", &self.strand.is_some())
            .field("fresh", &self.entry.is_some())
            .finish()
    }
}

/// Unwind payload of a thread leaving through `switch_final`.
struct Retired;

fn first_run(binding: Binding, entry: fn() -> !) {
    set_binding(binding);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        entry();
    }));
    if let Err(payload) = outcome
        && !payload.is::<Retired>()
    {
        panic::resume_unwind(payload);
    }
}

/// Gives this CPU's binding to `new`, waking or spawning its thread.
///
/// # Safety
/// `new` must be valid and exclusively ours until the switch completes.
unsafe fn hand_off(binding: Binding, new: *const Context) {
    // SAFETY: the caller guarantees exclusive access.
    let (next, entry) = unsafe { ((*new).strand.clone(), (*new).entry) };
    match (next, entry) {
        (Some(next), _) => next.resume(binding),
        (None, Some(entry)) => {
            thread::spawn(move || first_run(binding, entry));
        }
        (None, None) => panic!("switch: context has nothing to run"),
    }
}

/// Suspends the current kernel thread into `old` and runs `new` on this CPU.
///
/// Returns when some later switch names `old` again, possibly carrying a
/// different CPU's binding.
///
/// # Safety
/// Both pointers must be valid, and no other CPU may touch either context
/// until this switch has completed (the scheduler's process lock
/// guarantees that).
pub unsafe fn switch(old: *mut Context, new: *const Context) {
    let binding = binding();
    let me = current_strand();

    // SAFETY: the caller guarantees exclusive access to both contexts.
    unsafe {
        (*old).strand = Some(me.clone());
        (*old).entry = None;
        hand_off(binding, new);
    }

    let binding = me.park();
    set_binding(binding);
}

/// Like `switch`, but the current kernel thread never runs again: `old` is
/// left empty and the thread ends once the CPU has been handed on.
///
/// # Safety
/// As for `switch`. Nothing on this thread's stack may be needed after the
/// hand-off, since it is unwound without a CPU.
pub unsafe fn switch_final(old: *mut Context, new: *const Context) -> ! {
    let binding = binding();

    // SAFETY: the caller guarantees exclusive access to both contexts.
    unsafe {
        (*old).strand = None;
        (*old).entry = None;
        hand_off(binding, new);
    }

    // The binding now belongs to `new`'s thread.
    BINDING.with(|slot| slot.set(None));
    retire()
}

#[cfg(panic = "unwind")]
fn retire() -> ! {
    panic::resume_unwind(Box::new(Retired))
}

#[cfg(not(panic = "unwind"))]
fn retire() -> ! {
    loop {
        thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::boot_kernel;
    use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
    use std::time::{Duration, Instant};

    static SCHED: AtomicPtr<Context> = AtomicPtr::new(std::ptr::null_mut());
    static PROC: AtomicPtr<Context> = AtomicPtr::new(std::ptr::null_mut());
    static UNWOUND: AtomicBool = AtomicBool::new(false);
    static ENDED: AtomicBool = AtomicBool::new(false);

    struct Unwound;
    impl Drop for Unwound {
        fn drop(&mut self) {
            UNWOUND.store(true, Ordering::SeqCst);
        }
    }

    struct Ended;
    impl Drop for Ended {
        fn drop(&mut self) {
            ENDED.store(true, Ordering::SeqCst);
        }
    }

    thread_local! {
        static THREAD_END: Ended = const { Ended };
    }

    fn retiring_entry() -> ! {
        THREAD_END.with(|_| {});
        let _unwound = Unwound;
        // SAFETY: both contexts outlive the switch; the test thread waits.
        unsafe { switch_final(PROC.load(Ordering::SeqCst), SCHED.load(Ordering::SeqCst)) }
    }

    #[test]
    fn test_final_switch_ends_the_thread() {
        let kernel = boot_kernel(&[0], 2);
        crate::arch::bind_current_thread(kernel, 0);

        let sched: *mut Context = Box::into_raw(Box::new(Context::new()));
        let proc: *mut Context =
            Box::into_raw(Box::new(Context::new_entry(retiring_entry, std::ptr::null_mut(), VirtAddr::new(0))));
        SCHED.store(sched, Ordering::SeqCst);
        PROC.store(proc, Ordering::SeqCst);

        // SAFETY: only this test and the thread it starts touch the contexts.
        unsafe { switch(sched, proc) };
        assert_eq!(crate::arch::apic_id(), 0);
        assert!(unsafe { (*proc).strand.is_none() && (*proc).entry.is_none() });

        let deadline = Instant::now() + Duration::from_secs(10);
        while !(UNWOUND.load(Ordering::SeqCst) && ENDED.load(Ordering::SeqCst)) {
            assert!(Instant::now() < deadline, "retired thread is still alive");
            thread::sleep(Duration::from_millis(1));
        }
        // SAFETY: the retired thread is gone and nothing else holds these.
        unsafe {
            drop(Box::from_raw(proc));
            drop(Box::from_raw(sched));
        }
    }
}
