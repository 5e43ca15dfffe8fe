// =============================================================================
// xv64 — CPU Utilities (x86_64)
// =============================================================================
//
// Thin wrappers around privileged instructions. Minimal logic: execute the
// instruction and return.
// =============================================================================

use ::x86_64::instructions::{self, interrupts};
use ::x86_64::registers::control::{Cr3, Cr3Flags};
use ::x86_64::structures::paging::PhysFrame;

use crate::memory::address::PhysAddr;

/// Local APIC id of the executing CPU, from CPUID leaf 1 (EBX[31:24]).
#[allow(unused_unsafe)]
pub fn apic_id() -> u32 {
    // SAFETY: CPUID leaf 1 exists on every x86_64 processor.
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.ebx >> 24
}

/// Spin-wait hint for lock loops.
#[inline(always)]
pub fn relax() {
    core::hint::spin_loop();
}

/// Sleeps until the next interrupt. Called by the scheduler when nothing
/// is runnable, with interrupts already enabled.
#[inline]
pub fn idle() {
    interrupts::enable_and_hlt();
}

/// Stops this CPU for good.
pub fn halt() -> ! {
    loop {
        interrupts::disable();
        instructions::hlt();
    }
}

/// Installs `root` as the active PML4 and flushes the TLB.
pub fn load_page_table(root: PhysAddr) {
    let frame = PhysFrame::containing_address(::x86_64::PhysAddr::new(root.as_u64()));
    // SAFETY: every root handed out by the address-space manager shares the
    // kernel slot, which holds the kernel regions given at boot plus the
    // kernel stacks and trampoline. The boot config must list the kernel
    // image there for the running code to stay mapped.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}
