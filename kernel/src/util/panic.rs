// =============================================================================
// xv64 — Kernel Panic Handler
// =============================================================================
//
// A kernel panic is fatal: an invariant of the core no longer holds. Report
// the location and message through the log sink, then stop this CPU with
// interrupts off. Other CPUs keep running until they trip over the damage.
// =============================================================================

use core::panic::PanicInfo;

use crate::arch;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::interrupts::disable();
    match info.location() {
        Some(location) => {
            klog::error!("panic at {}:{}: {}", location.file(), location.line(), info.message())
        }
        None => klog::error!("panic: {}", info.message()),
    }
    arch::halt()
}
