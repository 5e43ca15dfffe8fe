// =============================================================================
// xv64 — Hosted Machine
// =============================================================================
//
// Runs the core on an ordinary OS so the scheduler, spinlocks and process
// lifecycle can be exercised by `cargo test`.
//
// THE MODEL:
//   - A simulated CPU is whatever OS thread is currently *bound* to
//     `(kernel, apic id)`. The binding lives in a thread-local and travels
//     with the baton on every context switch (see `context.rs`).
//   - The interrupt flag is a thread-local bool. Nothing ever interrupts a
//     hosted CPU, so the flag only drives the `push_off`/`pop_off`
//     bookkeeping and the assertions built on it.
//   - Exactly one thread per simulated CPU is runnable at any moment; the
//     others are parked inside `switch`.
//   - "User mode" is a Rust closure (see `user.rs`).
//
// A freshly bound thread starts with interrupts disabled, like a CPU
// coming out of reset.
// =============================================================================

use core::fmt;
use std::cell::Cell;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::Kernel;
use crate::memory::address::PhysAddr;

mod context;
mod user;

pub use context::{Context, switch, switch_final};
pub use user::{UserEnv, UserImage, enter_user};

/// Which simulated CPU the current thread is acting as.
#[derive(Clone, Copy)]
struct Binding {
    kernel: &'static Kernel,
    apic_id: u32,
}

thread_local! {
    static BINDING: Cell<Option<Binding>> = const { Cell::new(None) };
    static INTERRUPTS: Cell<bool> = const { Cell::new(false) };
}

pub mod interrupts {
    use super::INTERRUPTS;

    pub fn are_enabled() -> bool {
        INTERRUPTS.with(|flag| flag.get())
    }

    pub fn enable() {
        INTERRUPTS.with(|flag| flag.set(true));
    }

    pub fn disable() {
        INTERRUPTS.with(|flag| flag.set(false));
    }
}

fn binding() -> Binding {
    match BINDING.with(Cell::get) {
        Some(binding) => binding,
        None => panic!("thread is not bound to a simulated cpu"),
    }
}

fn set_binding(binding: Binding) {
    BINDING.with(|slot| slot.set(Some(binding)));
    interrupts::disable();
}

/// Makes the calling thread act as the CPU with `apic_id`.
pub fn bind_current_thread(kernel: &'static Kernel, apic_id: u32) {
    set_binding(Binding { kernel, apic_id });
}

/// Brings up a simulated CPU on a new thread.
///
/// The thread binds itself, runs `boot` (typically `user_init` on the
/// first CPU), then enters the scheduler for good.
pub fn start_cpu<F>(kernel: &'static Kernel, apic_id: u32, boot: F) -> JoinHandle<()>
where
    F: FnOnce(&'static Kernel) + Send + 'static,
{
    thread::spawn(move || {
        bind_current_thread(kernel, apic_id);
        boot(kernel);
        kernel.run_cpu()
    })
}

pub fn apic_id() -> u32 {
    binding().apic_id
}

pub fn kernel() -> &'static Kernel {
    binding().kernel
}

pub fn relax() {
    core::hint::spin_loop();
    thread::yield_now();
}

/// Nothing runnable: give the host a moment instead of spinning hot.
pub fn idle() {
    thread::sleep(Duration::from_micros(100));
}

/// There is no MMU to program; the current root is tracked per CPU.
pub fn load_page_table(_root: PhysAddr) {}

fn console(level: Option<klog::Level>, args: fmt::Arguments) {
    match level {
        Some(level) => eprintln!("{}[{}]\x1b[0m {}", level.color(), level.as_str(), args),
        None => eprint!("{}", args),
    }
}

/// Routes `klog` output to stderr.
pub fn install_console() {
    klog::init(console);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::boot_kernel;

    #[test]
    fn test_fresh_binding_starts_with_interrupts_off() {
        let kernel = boot_kernel(&[3], 2);
        interrupts::enable();
        bind_current_thread(kernel, 3);
        assert!(!interrupts::are_enabled());
        assert_eq!(apic_id(), 3);
        assert!(core::ptr::eq(super::kernel(), kernel));
    }

    #[test]
    #[should_panic(expected = "not bound")]
    fn test_unbound_thread_has_no_cpu() {
        std::thread::spawn(apic_id).join().unwrap_or_else(|e| std::panic::resume_unwind(e));
    }
}
