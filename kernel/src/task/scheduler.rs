// =============================================================================
// xv64 — Scheduler, Sleep and Wakeup
// =============================================================================
//
// Every CPU runs `scheduler` forever on its own context. It scans the
// process table round-robin and switches into the first Runnable process
// it finds. A process gives the CPU back through `sched`, always holding
// its own lock, so the scheduler's guard and the process's guard release
// each other's acquisitions:
//
//   scheduler                         process
//   ─────────                         ───────
//   lock p, state = Running
//   switch ──────────────────────────▶ (returns from its own sched,
//                                        or starts in fork_return)
//                                      ... lock p, state = Runnable
//   ◀────────────────────────────────── sched → switch
//   unlock p
//
// An exiting process leaves through `sched_final` instead and never comes
// back; its kernel thread ends there.
//
// SLEEP/WAKEUP:
//   A sleeper takes its own lock *before* releasing the condition lock,
//   and a waker holds the condition lock while it scans. A wakeup can
//   therefore never slip in between "check condition" and "go to sleep".
// =============================================================================

use crate::Kernel;
use crate::arch::{self, interrupts};
use crate::sync::SpinLockGuard;
use crate::task::cpu::Cpu;
use crate::task::process::{Channel, Proc, ProcInner, ProcState};

impl Kernel {
    /// Marks this CPU online and runs its scheduler.
    pub fn run_cpu(&'static self) -> ! {
        self.mark_started();
        klog::info!("sched: cpu with apic id {} online", arch::apic_id());
        self.scheduler()
    }

    /// Per-CPU scheduling loop. Never returns.
    pub fn scheduler(&'static self) -> ! {
        loop {
            // Let devices interrupt an idle scan.
            interrupts::enable();

            let mut ran = false;
            for p in self.procs.iter() {
                let mut inner = p.inner.lock();
                if inner.state != ProcState::Runnable {
                    continue;
                }

                inner.state = ProcState::Running;
                let cpu = self.cpus.current();
                cpu.set_proc(Some(p.slot()));
                self.switch_user_space(cpu, p);

                // SAFETY: p's lock is held, so no other CPU can be using or
                // switching to its context.
                unsafe { arch::switch(cpu.scheduler_context(), p.context_ptr()) };

                // The process is back in the table (Runnable, Sleeping or
                // Zombie) and has re-taken its lock for us to release.
                self.switch_kernel_space(cpu);
                cpu.set_proc(None);
                ran = true;
                drop(inner);
            }

            if !ran {
                arch::idle();
            }
        }
    }

    /// Switches back to this CPU's scheduler.
    ///
    /// The caller holds exactly its own process lock (passed in) and has
    /// already moved the process out of Running. Returns the same guard when
    /// the process is next scheduled, possibly on another CPU.
    pub(crate) fn sched<'a>(&self, inner: SpinLockGuard<'a, ProcInner>) -> SpinLockGuard<'a, ProcInner> {
        let (cpu, p) = self.check_sched(&inner);

        // intena belongs to this kernel thread, not to the CPU.
        let intena = cpu.intena();
        // SAFETY: p's lock is held; the scheduler context belongs to this CPU.
        unsafe { arch::switch(p.context_ptr(), cpu.scheduler_context()) };
        self.cpus.current().set_intena(intena);
        inner
    }

    /// Switches back to the scheduler for the last time. Used by `exit`
    /// once the process is a Zombie; its lock is released by the scheduler.
    pub(crate) fn sched_final(&self, inner: SpinLockGuard<'_, ProcInner>) -> ! {
        let (cpu, p) = self.check_sched(&inner);
        if inner.state != ProcState::Zombie {
            panic!("sched_final: slot {} is not a zombie", p.slot());
        }
        core::mem::forget(inner);
        // SAFETY: as in `sched`; the zombie's context is never resumed.
        unsafe { arch::switch_final(p.context_ptr(), cpu.scheduler_context()) }
    }

    fn check_sched(&self, inner: &ProcInner) -> (&Cpu, &Proc) {
        if interrupts::are_enabled() {
            panic!("sched interruptible");
        }
        let cpu = self.cpus.current();
        let Some(slot) = cpu.proc() else {
            panic!("sched: no process on cpu {}", cpu.index());
        };
        let p = self.procs.get(slot);
        if !p.inner.holding() {
            panic!("sched: process lock not held");
        }
        if cpu.noff() != 1 {
            klog::error!("sched: {} locks held on cpu {}", cpu.noff(), cpu.index());
            panic!("sched locks");
        }
        if inner.state == ProcState::Running {
            panic!("sched running");
        }
        (cpu, p)
    }

    /// Gives up the CPU for one scheduling round.
    pub fn yield_now(&self) {
        let p = self.my_proc();
        let mut inner = p.inner.lock();
        inner.state = ProcState::Runnable;
        drop(self.sched(inner));
    }

    /// Atomically releases `guard` and sleeps on `chan`; re-acquires the
    /// same lock before returning.
    ///
    /// `guard` must not be the caller's own process lock; use
    /// `sleep_locked` for that.
    pub fn sleep<'a, T>(&self, chan: Channel, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let p = self.my_proc();
        // Once we hold p's lock, no wakeup can be missed: wakeup needs it
        // to make us Runnable.
        let inner = p.inner.lock();
        let lock = SpinLockGuard::unlock(guard);

        drop(self.sleep_locked(chan, inner));
        lock.lock()
    }

    /// Sleeps on `chan` while already holding the caller's own lock.
    pub(crate) fn sleep_locked<'a>(
        &self,
        chan: Channel,
        mut inner: SpinLockGuard<'a, ProcInner>,
    ) -> SpinLockGuard<'a, ProcInner> {
        inner.channel = Some(chan);
        inner.state = ProcState::Sleeping;
        let mut inner = self.sched(inner);
        inner.channel = None;
        inner
    }

    /// Makes every process sleeping on `chan` Runnable. Skips the caller's
    /// own slot, which is running and may already be locked.
    pub fn wakeup(&self, chan: Channel) {
        let me = self.current_proc();
        for p in self.procs.iter() {
            if Some(p.slot()) == me {
                continue;
            }
            let mut inner = p.inner.lock();
            Self::wake_if_sleeping(&mut inner, chan);
        }
    }

    /// Wakes one process whose lock the caller holds.
    pub(crate) fn wake_if_sleeping(inner: &mut ProcInner, chan: Channel) -> bool {
        if inner.state == ProcState::Sleeping && inner.channel == Some(chan) {
            inner.state = ProcState::Runnable;
            true
        } else {
            false
        }
    }

    // ── Page-table installation ───────────────────────────────────────

    /// Installs `p`'s address space on `cpu`.
    pub(crate) fn switch_user_space(&self, cpu: &Cpu, p: &Proc) {
        // SAFETY: the scheduler holds p's lock and p is not running.
        let root = match unsafe { p.data_mut() }.space_root() {
            Some(root) => root,
            None => panic!("switch_user_space: slot {} has no page table", p.slot()),
        };
        cpu.set_page_table(root);
        arch::load_page_table(root);
    }

    /// Installs the process-independent kernel address space on `cpu`.
    pub(crate) fn switch_kernel_space(&self, cpu: &Cpu) {
        cpu.set_page_table(self.kernel_root);
        arch::load_page_table(self.kernel_root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{boot_kernel, install_running};

    #[test]
    fn test_wakeup_matches_channel_only() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);

        let mut pids = alloc::vec::Vec::new();
        for chan in [Channel::Token(1), Channel::Token(2), Channel::Ticks] {
            let (pid, _, mut inner) = kernel.allocate().unwrap();
            inner.state = ProcState::Sleeping;
            inner.channel = Some(chan);
            pids.push(pid);
        }

        kernel.wakeup(Channel::Token(1));
        let states: alloc::vec::Vec<_> =
            pids.iter().map(|&pid| kernel.process_info(pid).unwrap().state).collect();
        assert_eq!(states, [ProcState::Runnable, ProcState::Sleeping, ProcState::Sleeping]);

        kernel.wakeup(Channel::Ticks);
        assert_eq!(kernel.process_info(pids[2]).unwrap().state, ProcState::Runnable);
        assert_eq!(kernel.process_info(pids[1]).unwrap().state, ProcState::Sleeping);
    }

    #[test]
    fn test_wakeup_ignores_runnable_and_skips_caller() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);

        let (me, p, mut inner) = kernel.allocate().unwrap();
        inner.state = ProcState::Sleeping;
        inner.channel = Some(Channel::Token(9));
        drop(inner);
        install_running(kernel, p.slot());
        // install_running marked it Running; put it back to sleep by hand.
        {
            let mut inner = p.inner.lock();
            inner.state = ProcState::Sleeping;
            inner.channel = Some(Channel::Token(9));
        }

        kernel.wakeup(Channel::Token(9));
        assert_eq!(kernel.process_info(me).unwrap().state, ProcState::Sleeping);
    }

    #[test]
    #[should_panic(expected = "sched locks")]
    fn test_sched_with_extra_lock_is_fatal() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        let (_, p, inner) = kernel.allocate().unwrap();
        drop(inner);
        install_running(kernel, p.slot());

        let other = crate::sync::SpinLock::new((), "other");
        let _held = other.lock();
        let mut inner = p.inner.lock();
        inner.state = ProcState::Runnable;
        kernel.sched(inner);
    }

    #[test]
    #[should_panic(expected = "sched running")]
    fn test_sched_while_running_is_fatal() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        let (_, p, inner) = kernel.allocate().unwrap();
        drop(inner);
        install_running(kernel, p.slot());
        kernel.sched(p.inner.lock());
    }

    #[test]
    #[should_panic(expected = "not a zombie")]
    fn test_final_sched_requires_zombie() {
        let kernel = boot_kernel(&[0], 4);
        arch::bind_current_thread(kernel, 0);
        let (_, p, inner) = kernel.allocate().unwrap();
        drop(inner);
        install_running(kernel, p.slot());
        let mut inner = p.inner.lock();
        inner.state = ProcState::Runnable;
        kernel.sched_final(inner);
    }
}
