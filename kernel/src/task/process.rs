// =============================================================================
// xv64 — Process Table and Lifecycle
// =============================================================================
//
// A fixed array of process slots, sized at boot. A slot cycles through
//
//   Unused → Embryo → Runnable ⇄ Running ⇄ Sleeping
//                                  ↓
//                               Zombie → Unused (reaped by the parent)
//
// LOCKING:
//   - `inner` (state, pid, channel, killed, exit status) is guarded by the
//     slot's spinlock.
//   - `parent` is an atomic that is only *written* while holding the
//     child's lock. A reader that needs a stable answer takes the child's
//     lock and reads it again.
//   - `live_pid` mirrors `inner.pid` for lock-free scans. Pid allocation
//     reads it to skip pids still in use once the counter wraps.
//   - `data` has no lock. The running process owns it; anybody else
//     touches it only while holding `inner` and the process cannot run
//     (Embryo during setup, Zombie during reaping).
//   - Lock order is parent before child. `exit` therefore locks its
//     parent first, then itself, and retries if it was reparented in
//     between.
//
// WAIT/EXIT HANDSHAKE:
//   A parent in `wait` holds its own lock from the scan until `sched` has
//   switched away, and a child marks itself Zombie and wakes the parent
//   while holding the parent's lock. So the wakeup cannot fall between the
//   parent's scan and its sleep.
// =============================================================================

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::fmt;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::Kernel;
use crate::arch::{self, Context, UserImage};
use crate::config::PROC_NAME_LEN;
use crate::error::{KernelError, Result};
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::layout::{PAGE_SIZE, kstack};
use crate::memory::space::AddressSpace;
use crate::memory::vmm::PageTableFlags;
use crate::sync::{SpinLock, SpinLockGuard};
use crate::task::cpu::{pop_off, push_off};
use crate::task::files::{FileRef, FileTable};

const PAGE: u64 = PAGE_SIZE as u64;

/// `parent` value of a slot with no parent (unused slots and init).
pub const NO_PARENT: usize = usize::MAX;

/// RFLAGS interrupt-enable bit.
pub const RFLAGS_IF: u64 = 1 << 9;

// ── Identity ──────────────────────────────────────────────────────────

/// Process identifier. Never zero; never reused while the counter lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(NonZeroU32);

impl Pid {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    /// Fixed-width label for `procdump`.
    pub fn label(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// What a sleeping process waits for. Compared by value only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Exit of any child of the process in this slot.
    Proc(usize),
    /// The next clock tick.
    Ticks,
    /// Any other kernel object, named by address or id.
    Token(usize),
}

/// Process name, truncated to `PROC_NAME_LEN` bytes.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcName([u8; PROC_NAME_LEN]);

impl ProcName {
    pub fn new(name: &str) -> Self {
        let mut bytes = [0; PROC_NAME_LEN];
        let mut len = name.len().min(PROC_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(bytes)
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_LEN);
        core::str::from_utf8(&self.0[..len]).unwrap_or("?")
    }
}

impl fmt::Debug for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Slot contents ─────────────────────────────────────────────────────

/// Saved user registers.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

/// Lock-guarded part of a slot.
#[derive(Debug)]
pub struct ProcInner {
    pub state: ProcState,
    pub pid: Option<Pid>,
    pub(crate) channel: Option<Channel>,
    pub killed: bool,
    pub exit_status: i32,
}

impl ProcInner {
    const fn new() -> Self {
        Self { state: ProcState::Unused, pid: None, channel: None, killed: false, exit_status: 0 }
    }
}

/// Process-private part of a slot.
#[derive(Default)]
pub struct ProcData {
    kstack: VirtAddr,
    kstack_page: Option<PhysAddr>,
    size: u64,
    space: Option<AddressSpace>,
    trapframe: TrapFrame,
    context: Context,
    files: FileTable,
    cwd: Option<FileRef>,
    name: ProcName,
    image: UserImage,
}

impl ProcData {
    fn space(&mut self) -> &mut AddressSpace {
        match self.space.as_mut() {
            Some(space) => space,
            None => panic!("process has no address space"),
        }
    }

    pub(crate) fn space_root(&self) -> Option<PhysAddr> {
        self.space.as_ref().map(AddressSpace::root)
    }

    pub fn files(&mut self) -> &mut FileTable {
        &mut self.files
    }

    pub fn set_cwd(&mut self, cwd: Option<FileRef>) {
        self.cwd = cwd;
    }
}

pub struct Proc {
    slot: usize,
    pub(crate) inner: SpinLock<ProcInner>,
    parent: AtomicUsize,
    live_pid: AtomicU32,
    data: UnsafeCell<ProcData>,
}

// SAFETY: `inner` is lock-protected, `parent` is atomic, and `data` follows
// the ownership rule in the header.
unsafe impl Sync for Proc {}

impl Proc {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            inner: SpinLock::new(ProcInner::new(), "proc"),
            parent: AtomicUsize::new(NO_PARENT),
            live_pid: AtomicU32::new(0),
            data: UnsafeCell::new(ProcData::default()),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn parent(&self) -> Option<usize> {
        match self.parent.load(Ordering::Acquire) {
            NO_PARENT => None,
            slot => Some(slot),
        }
    }

    /// # Safety
    /// See the ownership rule for `data` in the module header.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        // SAFETY: only the address is taken.
        unsafe { &raw mut (*self.data.get()).context }
    }
}

/// Every process slot, fixed at boot.
pub struct ProcTable {
    slots: Box<[Proc]>,
}

impl ProcTable {
    pub fn new(size: usize) -> Self {
        Self { slots: (0..size).map(Proc::new).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> &Proc {
        &self.slots[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        self.slots.iter()
    }
}

/// Point-in-time view of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub state: ProcState,
    pub killed: bool,
    pub size: u64,
    pub name: ProcName,
}

/// First code every new process runs in kernel mode.
pub(crate) fn fork_return_entry() -> ! {
    arch::kernel().fork_return()
}

// =============================================================================
// Lifecycle
// =============================================================================

impl Kernel {
    /// Slot of the process running on this CPU.
    pub fn current_proc(&self) -> Option<usize> {
        push_off();
        let slot = self.cpus.current().proc();
        pop_off();
        slot
    }

    pub fn current_pid(&self) -> Option<Pid> {
        let slot = self.current_proc()?;
        self.procs.get(slot).inner.lock().pid
    }

    pub(crate) fn my_proc(&self) -> &Proc {
        match self.current_proc() {
            Some(slot) => self.procs.get(slot),
            None => panic!("no process running on this cpu"),
        }
    }

    fn init_slot(&self) -> usize {
        match self.init.get() {
            Some(&slot) => slot,
            None => panic!("init process not created"),
        }
    }

    /// Next pid from the counter, skipping zero and any pid a slot still
    /// holds after the counter wraps.
    fn alloc_pid(&self) -> Pid {
        loop {
            let raw = self.next_pid.fetch_add(1, Ordering::Relaxed);
            let Some(pid) = Pid::new(raw) else { continue };
            if self.procs.iter().any(|p| p.live_pid.load(Ordering::Acquire) == raw) {
                continue;
            }
            return pid;
        }
    }

    /// Claims an unused slot and gives it an address space, a kernel stack
    /// and a context that starts in `fork_return`.
    ///
    /// The slot comes back Embryo with its lock held.
    pub(crate) fn allocate(&self) -> Result<(Pid, &Proc, SpinLockGuard<'_, ProcInner>)> {
        for p in self.procs.iter() {
            let mut inner = p.inner.lock();
            if inner.state != ProcState::Unused {
                continue;
            }
            let pid = self.alloc_pid();
            inner.pid = Some(pid);
            p.live_pid.store(pid.as_u32(), Ordering::Release);
            inner.state = ProcState::Embryo;

            return match self.setup_slot(p) {
                Ok(()) => {
                    klog::debug!("proc: allocated pid {} in slot {}", pid, p.slot);
                    Ok((pid, p, inner))
                }
                Err(e) => {
                    self.free_proc(p, &mut inner);
                    Err(e)
                }
            };
        }
        Err(KernelError::NoFreeSlot)
    }

    fn setup_slot(&self, p: &Proc) -> Result<()> {
        // SAFETY: the slot is Embryo and we hold its lock.
        let data = unsafe { p.data_mut() };
        let mut kernel_space = self.kernel_space.lock();
        data.space = Some(AddressSpace::new_user(&kernel_space)?);

        let page = self.pages.alloc_page().ok_or(KernelError::OutOfMemory)?;
        let va = kstack(p.slot);
        if let Err(e) = kernel_space.map(va, page, PAGE, PageTableFlags::KERNEL_DATA) {
            self.pages.free_page(page);
            return Err(e);
        }
        drop(kernel_space);

        data.kstack = va;
        data.kstack_page = Some(page);
        data.context = Context::new_entry(fork_return_entry, self.pages.page_ptr(page), va + PAGE);
        Ok(())
    }

    /// Returns a slot and everything it owns. The caller holds its lock and
    /// the process is not running.
    fn free_proc(&self, p: &Proc, inner: &mut ProcInner) {
        // SAFETY: the slot cannot run and we hold its lock.
        let data = unsafe { p.data_mut() };
        if let Some(space) = data.space.take() {
            space.teardown();
        }
        if let Some(page) = data.kstack_page.take() {
            self.kernel_space.lock().unmap(data.kstack, PAGE, false);
            self.pages.free_page(page);
        }
        *data = ProcData::default();

        p.parent.store(NO_PARENT, Ordering::Release);
        p.live_pid.store(0, Ordering::Release);
        inner.pid = None;
        inner.channel = None;
        inner.killed = false;
        inner.exit_status = 0;
        inner.state = ProcState::Unused;
    }

    /// Creates the first user process: one page at address 0 holding
    /// `initcode`, with the stack at the top of that page.
    pub fn user_init(&self, image: UserImage, initcode: &[u8]) -> Result<Pid> {
        if self.init.is_completed() {
            panic!("user_init: init already exists");
        }
        assert!(initcode.len() <= PAGE_SIZE, "user_init: initcode larger than a page");

        let (pid, p, mut inner) = self.allocate()?;
        // SAFETY: Embryo, lock held.
        let data = unsafe { p.data_mut() };
        let space = data.space();
        let loaded = space.grow(0, PAGE).and_then(|_| space.copy_out(VirtAddr::new(0), initcode));
        if let Err(e) = loaded {
            self.free_proc(p, &mut inner);
            return Err(e);
        }

        data.size = PAGE;
        data.trapframe.rip = 0;
        data.trapframe.rsp = PAGE;
        data.trapframe.rflags = RFLAGS_IF;
        data.name = ProcName::new("initcode");
        data.image = image;

        self.init.call_once(|| p.slot);
        inner.state = ProcState::Runnable;
        klog::info!("proc: init is pid {}", pid);
        Ok(pid)
    }

    /// Entered on the first switch to a new process.
    fn fork_return(&'static self) -> ! {
        let p = self.my_proc();
        // SAFETY: the scheduler locked p before switching here; its guard
        // only releases after the next switch back, by which time this
        // process has locked p again.
        unsafe { p.inner.force_unlock() };
        arch::enter_user(self)
    }

    /// Duplicates the calling process. The child gets a copy of memory,
    /// registers (with a zero return value), open files, cwd and name.
    pub fn fork(&self) -> Result<Pid> {
        let parent = self.my_proc();
        let (pid, child, mut inner) = self.allocate()?;

        // SAFETY: the parent is the caller; the child is Embryo and locked.
        let (pdata, cdata) = unsafe { (parent.data_mut(), child.data_mut()) };
        let copied = match pdata.space.as_ref() {
            Some(space) => space.copy_user_into(cdata.space()),
            None => panic!("fork: parent has no address space"),
        };
        if let Err(e) = copied {
            self.free_proc(child, &mut inner);
            return Err(e);
        }

        cdata.size = pdata.size;
        cdata.trapframe = pdata.trapframe;
        cdata.trapframe.rax = 0;
        cdata.files = pdata.files.clone();
        cdata.cwd = pdata.cwd.clone();
        cdata.name = pdata.name;
        cdata.image = pdata.image.clone();

        child.parent.store(parent.slot, Ordering::Release);
        inner.state = ProcState::Runnable;
        klog::debug!("proc: fork slot {} -> pid {}", parent.slot, pid);
        Ok(pid)
    }

    /// Hands every child of `slot` to init.
    fn reparent(&self, slot: usize, init: usize) {
        for q in self.procs.iter() {
            if q.parent.load(Ordering::Acquire) != slot {
                continue;
            }
            let _guard = q.inner.lock();
            if q.parent.load(Ordering::Acquire) == slot {
                q.parent.store(init, Ordering::Release);
            }
        }
    }

    /// Terminates the calling process. It stays a Zombie until its parent
    /// reaps it.
    pub fn exit(&self, status: i32) -> ! {
        let p = self.my_proc();
        let init = self.init_slot();
        if p.slot == init {
            klog::error!("exit: init exiting with status {}", status);
            panic!("init exiting");
        }

        // SAFETY: we are the running process.
        let data = unsafe { p.data_mut() };
        data.files.close_all();
        data.cwd = None;

        self.reparent(p.slot, init);
        // Init may have just inherited zombies.
        {
            let mut init_inner = self.procs.get(init).inner.lock();
            Self::wake_if_sleeping(&mut init_inner, Channel::Proc(init));
        }

        loop {
            let parent_slot = p.parent.load(Ordering::Acquire);
            if parent_slot == NO_PARENT {
                panic!("exit: process in slot {} has no parent", p.slot);
            }
            let parent = self.procs.get(parent_slot);
            let mut parent_inner = parent.inner.lock();
            let mut inner = p.inner.lock();
            if p.parent.load(Ordering::Acquire) != parent_slot {
                // Reparented between the read and the locks.
                continue;
            }

            inner.exit_status = status;
            inner.state = ProcState::Zombie;
            Self::wake_if_sleeping(&mut parent_inner, Channel::Proc(parent_slot));
            drop(parent_inner);

            klog::debug!("proc: pid {:?} exited with {}", inner.pid, status);
            self.sched_final(inner)
        }
    }

    /// Waits for a child to exit and reaps it.
    ///
    /// The exit status is stored as a little-endian `i32` at `status_addr`
    /// when given; a bad address fails with `BadAddress` and leaves the
    /// zombie for a later wait.
    pub fn wait(&self, status_addr: Option<VirtAddr>) -> Result<Pid> {
        let p = self.my_proc();
        let mut inner = p.inner.lock();
        loop {
            let mut have_kids = false;
            for q in self.procs.iter() {
                if q.slot == p.slot || q.parent.load(Ordering::Acquire) != p.slot {
                    continue;
                }
                let mut child = q.inner.lock();
                if q.parent.load(Ordering::Acquire) != p.slot {
                    continue;
                }
                have_kids = true;
                if child.state != ProcState::Zombie {
                    continue;
                }

                let Some(pid) = child.pid else {
                    panic!("wait: zombie in slot {} without pid", q.slot);
                };
                if let Some(addr) = status_addr {
                    self.copy_to_user(addr, &child.exit_status.to_le_bytes())?;
                }
                self.free_proc(q, &mut child);
                klog::debug!("proc: reaped pid {}", pid);
                return Ok(pid);
            }

            if !have_kids {
                return Err(KernelError::NoChildren);
            }
            if inner.killed {
                return Err(KernelError::Killed);
            }
            inner = self.sleep_locked(Channel::Proc(p.slot), inner);
        }
    }

    /// Marks the process with `pid` killed. It exits the next time it
    /// reaches the kill check; a sleeper is woken so that happens soon.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        for p in self.procs.iter() {
            let mut inner = p.inner.lock();
            if inner.pid == Some(pid) {
                inner.killed = true;
                if inner.state == ProcState::Sleeping {
                    inner.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(KernelError::NoSuchProcess)
    }

    pub fn killed(&self) -> bool {
        self.my_proc().inner.lock().killed
    }

    /// Exits with -1 if the caller has been killed.
    pub fn check_killed(&self) {
        if self.killed() {
            self.exit(-1);
        }
    }

    /// Grows or shrinks the caller's memory by `delta` bytes and returns
    /// the previous size. The recorded size only changes on success.
    pub fn grow_process(&self, delta: i64) -> Result<u64> {
        // SAFETY: we are the running process.
        let data = unsafe { self.my_proc().data_mut() };
        let old = data.size;
        let new = old.checked_add_signed(delta).ok_or(KernelError::OutOfRange)?;
        let space = data.space();
        let size = if new > old {
            space.grow(old, new)?
        } else {
            space.shrink(old, new)
        };
        data.size = size;
        Ok(old)
    }

    /// Size in bytes of the caller's user memory.
    pub fn process_size(&self) -> u64 {
        // SAFETY: we are the running process.
        unsafe { self.my_proc().data_mut() }.size
    }

    // ── Access to the caller's own state ─────────────────────────────

    pub fn with_trapframe<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> R {
        // SAFETY: only the running process touches its trapframe.
        f(&mut unsafe { self.my_proc().data_mut() }.trapframe)
    }

    pub fn with_proc_data<R>(&self, f: impl FnOnce(&mut ProcData) -> R) -> R {
        // SAFETY: as above.
        f(unsafe { self.my_proc().data_mut() })
    }

    pub(crate) fn current_image(&self) -> UserImage {
        // SAFETY: as above.
        unsafe { self.my_proc().data_mut() }.image.clone()
    }

    pub fn copy_to_user(&self, dst: VirtAddr, src: &[u8]) -> Result<()> {
        // SAFETY: as above.
        unsafe { self.my_proc().data_mut() }.space().copy_out(dst, src)
    }

    pub fn copy_from_user(&self, dst: &mut [u8], src: VirtAddr) -> Result<()> {
        // SAFETY: as above.
        unsafe { self.my_proc().data_mut() }.space().copy_in(dst, src)
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn process_info(&self, pid: Pid) -> Option<ProcInfo> {
        let (p, info) = self.procs.iter().find_map(|p| {
            let inner = p.inner.lock();
            if inner.pid != Some(pid) {
                return None;
            }
            // SAFETY: size and name only change before the slot is
            // Runnable or under the owner's own control; this is a snapshot.
            let data = unsafe { p.data_mut() };
            let info = ProcInfo {
                pid,
                parent: None,
                state: inner.state,
                killed: inner.killed,
                size: data.size,
                name: data.name,
            };
            Some((p, info))
        })?;
        let parent = p.parent().and_then(|slot| self.procs.get(slot).inner.lock().pid);
        Some(ProcInfo { parent, ..info })
    }

    /// Logs one line per live slot. Takes each slot's lock in turn.
    pub fn procdump(&self) {
        klog::println!();
        for p in self.procs.iter() {
            let inner = p.inner.lock();
            if inner.state == ProcState::Unused {
                continue;
            }
            // SAFETY: read-only snapshot of the name.
            let name = unsafe { p.data_mut() }.name;
            klog::println!("{} {} {}", inner.pid.map_or(0, Pid::as_u32), inner.state.label(), name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame::PageAllocator;
    use crate::testing::{boot_kernel, boot_with_arena, install_running};

    #[test]
    fn test_proc_name_truncates() {
        assert_eq!(ProcName::new("initcode").as_str(), "initcode");
        assert_eq!(ProcName::new("a-very-long-process-name").as_str().len(), PROC_NAME_LEN);
        assert_eq!(ProcName::default().as_str(), "");
    }

    #[test]
    fn test_allocate_until_table_full() {
        let kernel = boot_kernel(&[0], 3);
        arch::bind_current_thread(kernel, 0);

        let mut pids = alloc::vec::Vec::new();
        for _ in 0..3 {
            let (pid, p, inner) = kernel.allocate().unwrap();
            assert_eq!(inner.state, ProcState::Embryo);
            assert!(unsafe { p.data_mut() }.space.is_some());
            pids.push(pid);
        }
        assert!(matches!(kernel.allocate(), Err(KernelError::NoFreeSlot)));

        pids.sort();
        pids.dedup();
        assert_eq!(pids.len(), 3);
    }

    #[test]
    fn test_pid_counter_wrap_skips_live_pids() {
        let kernel = boot_kernel(&[0], 3);
        arch::bind_current_thread(kernel, 0);

        let (first, _, inner) = kernel.allocate().unwrap();
        drop(inner);
        assert_eq!(first.as_u32(), 1);

        kernel.next_pid.store(u32::MAX, Ordering::Relaxed);
        let (last, _, inner) = kernel.allocate().unwrap();
        drop(inner);
        assert_eq!(last.as_u32(), u32::MAX);

        // Zero is never a pid and 1 is still held by the first slot.
        let (wrapped, _, inner) = kernel.allocate().unwrap();
        drop(inner);
        assert_eq!(wrapped.as_u32(), 2);
    }

    #[test]
    fn test_allocate_fails_cleanly_without_memory() {
        let (kernel, arena) = boot_with_arena(&[0], 2, 64);
        arch::bind_current_thread(kernel, 0);

        let mut hoard = alloc::vec::Vec::new();
        while let Some(page) = arena.alloc_page() {
            hoard.push(page);
        }
        assert!(matches!(kernel.allocate(), Err(KernelError::OutOfMemory)));
        for page in hoard {
            arena.free_page(page);
        }

        let free = arena.free_pages();
        let (_, p, mut inner) = kernel.allocate().unwrap();
        kernel.free_proc(p, &mut inner);
        drop(inner);
        // The kernel stack's page-table pages stay behind in the kernel space.
        assert!(free - arena.free_pages() <= 2);
        assert_eq!(p.inner.lock().state, ProcState::Unused);
    }

    #[test]
    fn test_kill_marks_and_wakes_sleeper() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);

        let (pid, _, mut inner) = kernel.allocate().unwrap();
        inner.state = ProcState::Sleeping;
        inner.channel = Some(Channel::Token(1));
        drop(inner);

        assert_eq!(kernel.kill(pid), Ok(()));
        let info = kernel.process_info(pid).unwrap();
        assert!(info.killed);
        assert_eq!(info.state, ProcState::Runnable);

        assert_eq!(kernel.kill(Pid::new(999).unwrap()), Err(KernelError::NoSuchProcess));
    }

    #[test]
    fn test_user_init_loads_initcode() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);

        let pid = kernel.user_init(UserImage::default(), &[0xf4, 0x90]).unwrap();
        let info = kernel.process_info(pid).unwrap();
        assert_eq!(info.state, ProcState::Runnable);
        assert_eq!(info.size, PAGE);
        assert_eq!(info.name.as_str(), "initcode");
        assert_eq!(info.parent, None);

        let p = kernel.procs.get(kernel.init_slot());
        let data = unsafe { p.data_mut() };
        assert_eq!(data.trapframe.rsp, PAGE);
        let mut code = [0u8; 2];
        data.space().copy_in(&mut code, VirtAddr::new(0)).unwrap();
        assert_eq!(code, [0xf4, 0x90]);
    }

    #[test]
    #[should_panic(expected = "init already exists")]
    fn test_user_init_runs_once() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        kernel.user_init(UserImage::default(), &[]).unwrap();
        let _ = kernel.user_init(UserImage::default(), &[]);
    }

    #[test]
    fn test_fork_copies_memory_and_zeroes_return() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        kernel.user_init(UserImage::default(), b"hello").unwrap();
        install_running(kernel, kernel.init_slot());

        kernel.with_trapframe(|tf| tf.rax = 77);
        kernel.with_proc_data(|data| data.name = ProcName::new("parent"));
        let pid = kernel.fork().unwrap();

        let info = kernel.process_info(pid).unwrap();
        assert_eq!(info.state, ProcState::Runnable);
        assert_eq!(info.size, PAGE);
        assert_eq!(info.name.as_str(), "parent");
        assert_eq!(info.parent, kernel.current_pid());

        let child = kernel.procs.iter().find(|p| p.inner.lock().pid == Some(pid)).unwrap();
        let data = unsafe { child.data_mut() };
        assert_eq!(data.trapframe.rax, 0);
        let mut bytes = [0u8; 5];
        data.space().copy_in(&mut bytes, VirtAddr::new(0)).unwrap();
        assert_eq!(&bytes, b"hello");
    }

    #[test]
    fn test_wait_without_children() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        kernel.user_init(UserImage::default(), &[]).unwrap();
        install_running(kernel, kernel.init_slot());
        assert_eq!(kernel.wait(None), Err(KernelError::NoChildren));
    }

    #[test]
    fn test_grow_process_updates_size_only_on_success() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        kernel.user_init(UserImage::default(), &[]).unwrap();
        install_running(kernel, kernel.init_slot());

        assert_eq!(kernel.grow_process(2 * PAGE as i64), Ok(PAGE));
        assert_eq!(kernel.process_size(), 3 * PAGE);
        assert_eq!(kernel.grow_process(-(PAGE as i64)), Ok(3 * PAGE));
        assert_eq!(kernel.process_size(), 2 * PAGE);

        assert_eq!(kernel.grow_process(i64::MIN), Err(KernelError::OutOfRange));
        assert_eq!(kernel.grow_process(i64::MAX), Err(KernelError::OutOfRange));
        assert_eq!(kernel.process_size(), 2 * PAGE);
    }

    #[test]
    fn test_procdump_releases_every_lock() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        arch::install_console();
        kernel.user_init(UserImage::default(), &[]).unwrap();

        kernel.procdump();
        assert_eq!(kernel.current_cpu().noff(), 0);
        assert!(kernel.procs.iter().all(|p| !p.inner.holding()));
    }
}
