// =============================================================================
// xv64 — Kernel Configuration
// =============================================================================
//
// Table sizes are fixed at boot. Nothing in the process table or CPU table
// grows afterwards. The kernel regions listed here are mapped once into the
// shared kernel slot and never change either.
// =============================================================================

use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::memory::layout::{KERNEL_BASE, PAGE_SIZE, kstack_floor};
use crate::memory::space::KernelRegion;

/// Default number of process slots.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Bytes kept of a process name.
pub const PROC_NAME_LEN: usize = 16;

/// Shape of the machine the kernel boots on.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Local APIC id of every CPU, in CPU-table order.
    pub apic_ids: Vec<u32>,
    /// Number of process slots.
    pub max_procs: usize,
    /// Kernel image, RAM and device windows to map into the kernel slot.
    pub regions: Vec<KernelRegion>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { apic_ids: alloc::vec![0], max_procs: NPROC, regions: Vec::new() }
    }
}

impl KernelConfig {
    pub fn with_cpus(mut self, apic_ids: &[u32]) -> Self {
        self.apic_ids = apic_ids.to_vec();
        self
    }

    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs;
        self
    }

    pub fn with_region(mut self, region: KernelRegion) -> Self {
        self.regions.push(region);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.apic_ids.is_empty() || self.apic_ids.len() > NCPU {
            return Err(KernelError::BadConfig("cpu count must be 1..=NCPU"));
        }
        for (i, id) in self.apic_ids.iter().enumerate() {
            if self.apic_ids[..i].contains(id) {
                return Err(KernelError::BadConfig("duplicate apic id"));
            }
        }
        if self.max_procs == 0 {
            return Err(KernelError::BadConfig("process table must have a slot"));
        }
        self.validate_regions()
    }

    /// Regions must be page-aligned, non-empty and disjoint, and must sit
    /// between `KERNEL_BASE` and the lowest kernel stack.
    fn validate_regions(&self) -> Result<()> {
        let page = PAGE_SIZE as u64;
        let floor = kstack_floor(self.max_procs);
        for (i, r) in self.regions.iter().enumerate() {
            if !r.va.is_page_aligned() || !r.pa.is_page_aligned() || r.len == 0 || !r.len.is_multiple_of(page) {
                return Err(KernelError::BadConfig("kernel region must be whole pages"));
            }
            let end = r.end().ok_or(KernelError::BadConfig("kernel region wraps"))?;
            if r.va.as_u64() < KERNEL_BASE || end > floor {
                return Err(KernelError::BadConfig("kernel region outside the kernel slot"));
            }
            for other in &self.regions[..i] {
                if other.va.as_u64() < end && r.va.as_u64() < other.va.as_u64() + other.len {
                    return Err(KernelError::BadConfig("kernel regions overlap"));
                }
            }
        }
        Ok(())
    }
}
