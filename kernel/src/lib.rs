// =============================================================================
// xv64 — Process and Memory Core
// =============================================================================
//
// The part of the kernel that turns one machine into many processes:
//
//   sync/     — spinlocks that disable interrupts while held, with per-CPU
//               nesting
//   memory/   — 4-level page-table address spaces over a page allocator
//   task/     — CPU records, the process table and its lifecycle
//               (allocate, fork, exit, wait, kill, grow/shrink), the
//               per-CPU scheduler with sleep/wakeup, and the tick clock
//   syscall   — the process system calls in the user ABI
//   arch/     — the machine underneath: bare-metal x86_64, or a hosted
//               simulation where threads play CPUs
//
// Everything hangs off one `Kernel` value. On hardware it is installed once
// at boot and reached through `arch::kernel()`; hosted, each simulated CPU
// thread is bound to a kernel, so several independent machines can run in
// one test binary.
//
// Built `no_std` for `target_os = "none"`. Any other target links `std`
// and uses the hosted backend.
// =============================================================================

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod memory;
pub mod sync;
pub mod syscall;
pub mod task;

#[cfg(target_os = "none")]
mod util;

#[cfg(test)]
mod testing;

use core::sync::atomic::AtomicU32;

use spin::Once;

use crate::config::KernelConfig;
use crate::error::Result;
use crate::memory::address::PhysAddr;
use crate::memory::frame::PageAllocator;
use crate::memory::space::AddressSpace;
use crate::sync::SpinLock;
use crate::task::clock::Clock;
use crate::task::cpu::{Cpu, CpuTable};
use crate::task::process::ProcTable;

/// All state of the process/memory core.
pub struct Kernel {
    cpus: CpuTable,
    procs: ProcTable,
    pages: &'static dyn PageAllocator,
    /// Process-independent page table. Its shared slot holds the boot-time
    /// kernel regions and every kernel stack.
    kernel_space: SpinLock<AddressSpace>,
    kernel_root: PhysAddr,
    /// Slot of the first user process, set once by `user_init`.
    init: Once<usize>,
    next_pid: AtomicU32,
    clock: Clock,
}

impl Kernel {
    /// Builds the CPU table, the process table and the kernel address space.
    pub fn new(config: &KernelConfig, pages: &'static dyn PageAllocator) -> Result<Self> {
        config.validate()?;
        let kernel_space = AddressSpace::new_kernel(pages, &config.regions)?;
        let kernel_root = kernel_space.root();
        klog::info!(
            "boot: {} cpu(s), {} process slots, {} kernel region(s), kernel page table at {}",
            config.apic_ids.len(),
            config.max_procs,
            config.regions.len(),
            kernel_root
        );

        Ok(Self {
            cpus: CpuTable::new(&config.apic_ids),
            procs: ProcTable::new(config.max_procs),
            pages,
            kernel_space: SpinLock::new(kernel_space, "kvm"),
            kernel_root,
            init: Once::new(),
            next_pid: AtomicU32::new(1),
            clock: Clock::new(),
        })
    }

    pub fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    /// The calling CPU's record. Interrupts must be disabled.
    pub fn current_cpu(&self) -> &Cpu {
        self.cpus.current()
    }

    pub fn mark_started(&self) {
        self.cpus.mark_started();
    }

    pub fn online_cpus(&self) -> usize {
        self.cpus.online()
    }

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub fn pages(&self) -> &'static dyn PageAllocator {
        self.pages
    }

    /// Root of the process-independent kernel page table.
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_root
    }
}

/// Builds the kernel and publishes it as the machine's singleton.
#[cfg(target_os = "none")]
pub fn boot(config: &KernelConfig, pages: &'static dyn PageAllocator) -> Result<&'static Kernel> {
    Ok(arch::install(Kernel::new(config, pages)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::memory::frame::FrameArena;

    #[test]
    fn test_boot_rejects_bad_config() {
        let arena: &'static FrameArena = Box::leak(Box::new(FrameArena::new(16)));
        let config = KernelConfig::default().with_cpus(&[2, 2]);
        assert!(matches!(Kernel::new(&config, arena), Err(KernelError::BadConfig(_))));
    }

    #[test]
    fn test_boot_without_memory_fails() {
        let arena: &'static FrameArena = Box::leak(Box::new(FrameArena::new(1)));
        let result = Kernel::new(&KernelConfig::default(), arena);
        assert!(matches!(result, Err(KernelError::OutOfMemory)));
    }

    #[test]
    fn test_boot_builds_tables() {
        let kernel = testing::boot_kernel(&[0, 1], 5);
        assert_eq!(kernel.cpus().len(), 2);
        assert_eq!(kernel.procs().len(), 5);
        assert!(!kernel.kernel_root().is_zero());
        assert_eq!(kernel.online_cpus(), 0);
    }

    #[test]
    fn test_boot_maps_kernel_regions_into_every_space() {
        use crate::memory::address::VirtAddr;
        use crate::memory::layout::KERNEL_BASE;
        use crate::memory::space::KernelRegion;
        use crate::memory::vmm::PageTableFlags;

        let arena: &'static FrameArena = Box::leak(Box::new(FrameArena::new(64)));
        let text = KernelRegion::new(
            VirtAddr::new(KERNEL_BASE),
            PhysAddr::new(0x4000_0000),
            4 * 4096,
            PageTableFlags::PRESENT,
        );
        let config = KernelConfig::default().with_region(text);
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(&config, arena).unwrap()));
        arch::bind_current_thread(kernel, 0);

        let space = kernel.kernel_space.lock();
        let user = AddressSpace::new_user(&space).unwrap();
        let inside = text.va + 3 * 4096 + 12;
        assert_eq!(space.translate(inside), Some(text.pa + 3 * 4096 + 12));
        assert_eq!(user.translate(inside), space.translate(inside));
        drop(space);
        user.teardown();
    }
}
