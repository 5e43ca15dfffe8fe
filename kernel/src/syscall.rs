// =============================================================================
// xv64 — Process System Calls
// =============================================================================
//
// The user-facing edge of the process core. Each handler decodes raw
// register arguments, calls into the kernel, and encodes the result the
// way user space expects: a non-negative value on success, -1 on any
// failure. The trap path that collects the registers lives with the
// architecture backend.
//
//   nr            args                  returns
//   ──────────    ──────────────────    ──────────────────────────────
//   SYS_FORK      —                     child pid (0 in the child)
//   SYS_EXIT      status                never returns
//   SYS_WAIT      status address | 0    pid of the reaped child
//   SYS_KILL      pid                   0
//   SYS_GETPID    —                     caller's pid
//   SYS_SBRK      delta (signed)        previous break
//   SYS_SLEEP     ticks                 0
//   SYS_UPTIME    —                     ticks since boot
// =============================================================================

use crate::Kernel;
use crate::error::Result;
use crate::memory::address::VirtAddr;
use crate::task::process::Pid;

/// Syscall numbers.
pub mod nr {
    /// `fork()` — duplicate the calling process.
    pub const SYS_FORK: u64 = 1;
    /// `exit(status)` — terminate the calling process.
    pub const SYS_EXIT: u64 = 2;
    /// `wait(status_ptr)` — reap a child; `status_ptr` may be 0.
    pub const SYS_WAIT: u64 = 3;
    /// `kill(pid)` — mark a process killed.
    pub const SYS_KILL: u64 = 6;
    /// `getpid()`.
    pub const SYS_GETPID: u64 = 11;
    /// `sbrk(delta)` — grow or shrink user memory.
    pub const SYS_SBRK: u64 = 12;
    /// `sleep(ticks)`.
    pub const SYS_SLEEP: u64 = 13;
    /// `uptime()` — clock ticks since boot.
    pub const SYS_UPTIME: u64 = 14;
}

/// Result value for any failed call.
const FAILED: i64 = -1;

fn encode(result: Result<i64>) -> i64 {
    result.unwrap_or(FAILED)
}

/// Runs syscall `number` for the current process.
pub fn dispatch(kernel: &Kernel, number: u64, args: [u64; 6]) -> i64 {
    match number {
        nr::SYS_FORK => sys_fork(kernel),
        nr::SYS_EXIT => sys_exit(kernel, args[0] as i32),
        nr::SYS_WAIT => sys_wait(kernel, args[0]),
        nr::SYS_KILL => sys_kill(kernel, args[0] as i64),
        nr::SYS_GETPID => sys_getpid(kernel),
        nr::SYS_SBRK => sys_sbrk(kernel, args[0] as i64),
        nr::SYS_SLEEP => sys_sleep(kernel, args[0]),
        nr::SYS_UPTIME => sys_uptime(kernel),
        _ => {
            klog::warn!("syscall: pid {:?} unknown syscall {}", kernel.current_pid(), number);
            FAILED
        }
    }
}

pub fn sys_fork(kernel: &Kernel) -> i64 {
    encode(kernel.fork().map(|pid| pid.as_u32() as i64))
}

pub fn sys_exit(kernel: &Kernel, status: i32) -> i64 {
    kernel.exit(status)
}

pub fn sys_wait(kernel: &Kernel, status_addr: u64) -> i64 {
    let addr = (status_addr != 0).then(|| VirtAddr::new(status_addr));
    encode(kernel.wait(addr).map(|pid| pid.as_u32() as i64))
}

pub fn sys_kill(kernel: &Kernel, pid: i64) -> i64 {
    let Some(pid) = u32::try_from(pid).ok().and_then(Pid::new) else {
        return FAILED;
    };
    encode(kernel.kill(pid).map(|()| 0))
}

pub fn sys_getpid(kernel: &Kernel) -> i64 {
    kernel.current_pid().map_or(FAILED, |pid| pid.as_u32() as i64)
}

pub fn sys_sbrk(kernel: &Kernel, delta: i64) -> i64 {
    encode(kernel.grow_process(delta).map(|old| old as i64))
}

pub fn sys_sleep(kernel: &Kernel, ticks: u64) -> i64 {
    encode(kernel.sleep_ticks(ticks).map(|()| 0))
}

pub fn sys_uptime(kernel: &Kernel) -> i64 {
    kernel.uptime() as i64
}
