//! Test fixtures: throwaway machines on the hosted backend.
//!
//! Kernels and their frame arenas are leaked so they can be `'static`, the
//! same lifetime they have on hardware. Each test builds its own.

use crate::Kernel;
use crate::config::KernelConfig;
use crate::memory::frame::FrameArena;
use crate::task::cpu::{pop_off, push_off};
use crate::task::process::ProcState;

/// Frames per test arena unless a test asks otherwise.
pub const TEST_FRAMES: usize = 256;

pub fn boot_with_arena(
    apic_ids: &[u32],
    max_procs: usize,
    frames: usize,
) -> (&'static Kernel, &'static FrameArena) {
    let arena: &'static FrameArena = Box::leak(Box::new(FrameArena::new(frames)));
    let config = KernelConfig::default().with_cpus(apic_ids).with_max_procs(max_procs);
    let kernel = Box::leak(Box::new(Kernel::new(&config, arena).unwrap()));
    (kernel, arena)
}

pub fn boot_kernel(apic_ids: &[u32], max_procs: usize) -> &'static Kernel {
    boot_with_arena(apic_ids, max_procs, TEST_FRAMES).0
}

/// Pretends the scheduler switched the calling thread into `slot`, so
/// process-context operations can be driven directly.
pub fn install_running(kernel: &Kernel, slot: usize) {
    push_off();
    kernel.current_cpu().set_proc(Some(slot));
    pop_off();
    kernel.procs().get(slot).inner.lock().state = ProcState::Running;
}
