//! Kernel-thread context switch.
//!
//! A suspended kernel thread is just its saved stack pointer. The
//! callee-saved registers and the return address sit on the thread's own
//! kernel stack, pushed by `xv64_switch`:
//!
//! ```text
//!   rsp → r15 r14 r13 r12 rbx rbp rip
//! ```

use crate::memory::address::VirtAddr;
use crate::memory::layout::PAGE_SIZE;

#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    rsp: u64,
}

/// Words in a fresh frame: six callee-saved registers, the return address,
/// and one pad word so the entry function sees a call-aligned stack.
const FRESH_FRAME: usize = 8;

impl Context {
    pub const fn new() -> Self {
        Self { rsp: 0 }
    }

    /// Lays out the top of a fresh kernel stack so the first switch to it
    /// "returns" into `entry`.
    ///
    /// `stack_page` is the kernel-visible pointer to the stack's page and
    /// `stack_top` its top in the kernel address space.
    pub fn new_entry(entry: fn() -> !, stack_page: *mut u8, stack_top: VirtAddr) -> Self {
        let words = PAGE_SIZE / 8;
        let frame = stack_page.cast::<u64>();
        // SAFETY: the caller owns the freshly allocated stack page.
        unsafe {
            let base = frame.add(words - FRESH_FRAME);
            for i in 0..6 {
                base.add(i).write(0);
            }
            base.add(6).write(entry as usize as u64);
            base.add(7).write(0);
        }
        Self { rsp: stack_top.as_u64() - (FRESH_FRAME * 8) as u64 }
    }
}

core::arch::global_asm!(
    ".global xv64_switch",
    "xv64_switch:",
    // rdi = &mut old.rsp, rsi = &new.rsp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

unsafe extern "C" {
    fn xv64_switch(old: *mut Context, new: *const Context);
}

/// Saves the current kernel thread into `old` and resumes `new`.
///
/// # Safety
/// `new` must hold a context produced by `new_entry` or by an earlier
/// switch, on a stack that is still mapped.
pub unsafe fn switch(old: *mut Context, new: *const Context) {
    unsafe { xv64_switch(old, new) }
}

/// Leaves the current kernel thread for good and resumes `new`. The saved
/// state in `old` must never be switched to again.
///
/// # Safety
/// As for `switch`.
pub unsafe fn switch_final(old: *mut Context, new: *const Context) -> ! {
    unsafe { xv64_switch(old, new) };
    panic!("switch_final: retired context resumed");
}
