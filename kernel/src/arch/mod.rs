// =============================================================================
// xv64 — Architecture Abstraction
// =============================================================================
//
// This module re-exports the current machine's backend. The rest of the
// kernel uses `crate::arch::*` and never names a backend directly.
//
//   x86_64/  — bare metal (`target_os = "none"`): real interrupt flag, CR3,
//              callee-saved context switch, iretq into ring 3
//   hosted/  — any other target: OS threads play the part of CPUs so the
//              whole core runs under the normal test harness
//
// Both backends provide the same surface:
//   interrupts::{are_enabled, enable, disable}
//   apic_id(), kernel(), relax(), idle()
//   load_page_table(root), install_console()
//   Context, switch(old, new), switch_final(old, new)
//   UserImage, enter_user(kernel)
//
// Bare metal adds `install` and `halt`; hosted adds `start_cpu` and
// `bind_current_thread`.
// =============================================================================

#[cfg(target_os = "none")]
mod x86_64;

#[cfg(target_os = "none")]
pub use self::x86_64::*;

#[cfg(not(target_os = "none"))]
mod hosted;

#[cfg(not(target_os = "none"))]
pub use self::hosted::*;
