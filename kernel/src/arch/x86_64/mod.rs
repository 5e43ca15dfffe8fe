// =============================================================================
// xv64 — x86_64 Bare-Metal Backend
// =============================================================================
//
// All hardware-specific code for x86_64. Higher-level kernel code (process
// table, scheduler, address spaces) is safe Rust calling into the safe
// wrappers defined here.
//
//   cpu.rs     — CPU identity, HLT, CR3
//   context.rs — callee-saved register context switch
//   user.rs    — first entry into ring 3 through iretq
//   serial.rs  — COM1 UART, the `klog` sink
//
// The kernel singleton lives in a `spin::Once` filled by the boot code via
// `install`; `kernel()` is only valid after that.
// =============================================================================

mod context;
mod cpu;
mod serial;
mod user;

pub use context::{Context, switch, switch_final};
pub use cpu::{apic_id, halt, idle, load_page_table, relax};
pub use serial::install_console;
pub use user::{UserImage, enter_user};

use spin::Once;

use crate::Kernel;

pub mod interrupts {
    pub use ::x86_64::instructions::interrupts::{are_enabled, disable, enable};
}

static KERNEL: Once<Kernel> = Once::new();

/// Publishes the booted kernel. Only the first call has any effect.
pub fn install(kernel: Kernel) -> &'static Kernel {
    KERNEL.call_once(|| kernel)
}

pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("kernel used before install"),
    }
}
