//! Simulated user mode.
//!
//! A process image is a closure. Entering user mode calls it with a
//! `UserEnv`, which plays the role of the `syscall` instruction: each
//! method traps into the kernel through the syscall dispatcher and runs
//! the kill check a real return to user mode would run. The closure's
//! return value becomes the exit status.
//!
//! There is no saved user program counter to resume after `fork`, so the
//! child runs the same closure from the top. `fork` records a resume point
//! in the trapframe first; the child reads it back with `entry()` to tell
//! which half of the program it is.

use alloc::sync::Arc;
use core::fmt;

use super::interrupts;
use crate::Kernel;
use crate::memory::address::VirtAddr;
use crate::syscall::{self, nr};

type Program = dyn Fn(&UserEnv) -> i32 + Send + Sync;

/// The code a process runs in user mode.
#[derive(Clone, Default)]
pub struct UserImage(Option<Arc<Program>>);

impl UserImage {
    pub fn new<F>(program: F) -> Self
    where
        F: Fn(&UserEnv) -> i32 + Send + Sync + 'static,
    {
        Self(Some(Arc::new(program)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for UserImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => write!(f, "UserImage(program)"),
            None => write!(f, "UserImage(empty)"),
        }
    }
}

/// Runs the current process's image until it returns, then exits with
/// its result. An empty image exits immediately with status 0.
pub fn enter_user(kernel: &'static Kernel) -> ! {
    let image = kernel.current_image();
    interrupts::enable();
    let env = UserEnv { kernel };
    let status = match &image.0 {
        Some(program) => program(&env),
        None => 0,
    };
    interrupts::disable();
    kernel.exit(status)
}

/// What a user program can reach: its own trapframe and memory, and the
/// system calls.
pub struct UserEnv {
    kernel: &'static Kernel,
}

impl UserEnv {
    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    /// The program counter user mode was (re)entered at.
    pub fn entry(&self) -> u64 {
        self.kernel.with_trapframe(|tf| tf.rip)
    }

    fn trap(&self, number: u64, args: [u64; 6]) -> i64 {
        interrupts::disable();
        let ret = syscall::dispatch(self.kernel, number, args);
        self.kernel.check_killed();
        interrupts::enable();
        ret
    }

    /// Forks; the child starts over with `entry() == resume_at`.
    pub fn fork(&self, resume_at: u64) -> i64 {
        interrupts::disable();
        self.kernel.with_trapframe(|tf| tf.rip = resume_at);
        self.trap(nr::SYS_FORK, [0; 6])
    }

    pub fn exit(&self, status: i32) -> ! {
        self.trap(nr::SYS_EXIT, [status as u64, 0, 0, 0, 0, 0]);
        panic!("exit returned to user mode");
    }

    /// Waits for a child. `status_addr` of `None` discards the status.
    pub fn wait(&self, status_addr: Option<u64>) -> i64 {
        self.trap(nr::SYS_WAIT, [status_addr.unwrap_or(0), 0, 0, 0, 0, 0])
    }

    pub fn kill(&self, pid: i64) -> i64 {
        self.trap(nr::SYS_KILL, [pid as u64, 0, 0, 0, 0, 0])
    }

    pub fn getpid(&self) -> i64 {
        self.trap(nr::SYS_GETPID, [0; 6])
    }

    pub fn sbrk(&self, delta: i64) -> i64 {
        self.trap(nr::SYS_SBRK, [delta as u64, 0, 0, 0, 0, 0])
    }

    pub fn sleep(&self, ticks: u64) -> i64 {
        self.trap(nr::SYS_SLEEP, [ticks, 0, 0, 0, 0, 0])
    }

    pub fn uptime(&self) -> i64 {
        self.trap(nr::SYS_UPTIME, [0; 6])
    }

    /// Gives up the CPU as if the timer had fired.
    pub fn yield_now(&self) {
        interrupts::disable();
        self.kernel.yield_now();
        self.kernel.check_killed();
        interrupts::enable();
    }

    /// Stores `bytes` at user address `addr`.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> bool {
        interrupts::disable();
        let ok = self.kernel.copy_to_user(VirtAddr::new(addr), bytes).is_ok();
        interrupts::enable();
        ok
    }

    /// Loads `buf.len()` bytes from user address `addr`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        interrupts::disable();
        let ok = self.kernel.copy_from_user(buf, VirtAddr::new(addr)).is_ok();
        interrupts::enable();
        ok
    }
}
