//! Dropping into ring 3.
//!
//! On hardware the user image is whatever the address space maps, so
//! `UserImage` carries nothing. Entering user mode builds the five
//! quadwords `iretq` pops from the current process's trapframe.

use core::arch::asm;

use crate::Kernel;

#[derive(Debug, Clone, Copy, Default)]
pub struct UserImage;

/// User code selector (GDT index 4, RPL 3).
const USER_CS: u64 = 0x23;
/// User data selector (GDT index 3, RPL 3).
const USER_SS: u64 = 0x1b;
/// RFLAGS bit 1 is reserved and must be set.
const RFLAGS_RESERVED1: u64 = 1 << 1;

/// `iretq` frame, lowest address first.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct IretqFrame {
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

/// Returns to user mode at the current process's saved `rip`/`rsp`.
///
/// The scheduler has already installed the process's page table.
pub fn enter_user(kernel: &'static Kernel) -> ! {
    let tf = kernel.with_trapframe(|tf| *tf);
    let frame = IretqFrame {
        rip: tf.rip,
        cs: USER_CS,
        rflags: tf.rflags | RFLAGS_RESERVED1,
        rsp: tf.rsp,
        ss: USER_SS,
    };
    super::interrupts::disable();
    // SAFETY: the frame describes the process's mapped user image; iretq
    // restores IF from the trapframe's rflags.
    unsafe {
        asm!(
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) frame.ss,
            rsp = in(reg) frame.rsp,
            rflags = in(reg) frame.rflags,
            cs = in(reg) frame.cs,
            rip = in(reg) frame.rip,
            in("rax") tf.rax,
            options(noreturn),
        );
    }
}
