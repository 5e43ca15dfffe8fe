//! Kernel tick counter.
//!
//! Incremented by the timer interrupt on one CPU. Sleepers wait on
//! `Channel::Ticks` and re-check the count each time it moves.

use crate::Kernel;
use crate::error::{KernelError, Result};
use crate::sync::SpinLock;
use crate::task::process::Channel;

pub struct Clock {
    ticks: SpinLock<u64>,
}

impl Clock {
    pub const fn new() -> Self {
        Self { ticks: SpinLock::new(0, "time") }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Called by the timer interrupt on every tick.
    pub fn clock_tick(&self) {
        let mut ticks = self.clock.ticks.lock();
        *ticks += 1;
        self.wakeup(Channel::Ticks);
    }

    /// Ticks since boot.
    pub fn uptime(&self) -> u64 {
        *self.clock.ticks.lock()
    }

    /// Sleeps for at least `n` ticks. Fails with `Killed` if the caller is
    /// killed meanwhile.
    pub fn sleep_ticks(&self, n: u64) -> Result<()> {
        let mut ticks = self.clock.ticks.lock();
        let start = *ticks;
        while *ticks - start < n {
            if self.killed() {
                return Err(KernelError::Killed);
            }
            ticks = self.sleep(Channel::Ticks, ticks);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::arch;
    use crate::testing::boot_kernel;

    #[test]
    fn test_ticks_count_up() {
        let kernel = boot_kernel(&[0], 2);
        arch::bind_current_thread(kernel, 0);
        assert_eq!(kernel.uptime(), 0);
        kernel.clock_tick();
        kernel.clock_tick();
        assert_eq!(kernel.uptime(), 2);
    }

    #[test]
    fn test_zero_tick_sleep_returns_at_once() {
        let kernel = boot_kernel(&[0], 2);
        arch::bind_current_thread(kernel, 0);
        assert_eq!(kernel.sleep_ticks(0), Ok(()));
    }
}
