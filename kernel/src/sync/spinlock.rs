// =============================================================================
// xv64 — Spinlock
// =============================================================================
//
// A test-and-set spinlock that knows which CPU holds it.
//
// HOW IT WORKS:
//   - `locked` is claimed with an Acquire compare-exchange and released
//     with a Release store.
//   - `cpu` records the holder's CPU-table index. Re-acquiring a lock the
//     current CPU already holds can never succeed (nobody else will release
//     it), so it is reported as a fatal bug instead of hanging.
//   - Waiters are not ordered. Critical sections here are a handful of
//     field updates, so fairness buys nothing.
//
// IRQ SAFETY:
//   Interrupts are disabled on the current CPU *before* spinning, through
//   `push_off`, and restored on release through `pop_off`. The two calls
//   nest: the CPU record counts how deep we are and remembers whether
//   interrupts were on before the outermost `push_off`. Only when the count
//   returns to zero are interrupts re-enabled, and only if they were on to
//   begin with.
//
//   The nesting state belongs to the CPU, not to the guard. A guard taken
//   by the scheduler may be released by the process it switched to; both
//   run on the same CPU, so the count stays balanced.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::task::cpu::{pop_off, push_off, this_cpu_index};

const NO_CPU: usize = usize::MAX;

/// A busy-wait lock that disables interrupts while held.
pub struct SpinLock<T> {
    locked: AtomicBool,

    /// CPU-table index of the holder, `NO_CPU` when free.
    cpu: AtomicUsize,

    /// Shown in diagnostics.
    name: &'static str,

    data: UnsafeCell<T>,
}

// SAFETY: the lock hands out access to T to one CPU at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
            name,
            data: UnsafeCell::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, disabling interrupts on the current CPU.
    ///
    /// # Panics
    /// If the current CPU already holds this lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        let me = this_cpu_index();
        if self.held_by(me) {
            klog::error!("acquire: {} already held by cpu {}", self.name, me);
            panic!("acquire: {} already held", self.name);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                arch::relax();
            }
        }

        self.cpu.store(me, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Whether the current CPU holds this lock.
    pub fn holding(&self) -> bool {
        push_off();
        let held = self.held_by(this_cpu_index());
        pop_off();
        held
    }

    fn held_by(&self, cpu: usize) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpu
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    /// The current CPU must hold the lock, and the guard that took it must
    /// never be dropped (it lives on a stack that was switched away from).
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    fn release(&self) {
        if !self.holding() {
            panic!("release: {} not held by this cpu", self.name);
        }
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// `&mut self` guarantees exclusive access, so no locking happens.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock.
///
/// Dropping the guard releases the lock and undoes one level of interrupt
/// disabling.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Releases the guard and returns the lock it came from, so it can be
    /// re-acquired later (the shape `sleep` needs).
    pub fn unlock(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
