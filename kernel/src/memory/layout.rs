// =============================================================================
// xv64 — Virtual Memory Layout
// =============================================================================
//
//   0x0000_0000_0000 ┌──────────────────────────────┐
//                    │ user image, heap, stack      │  grows up via sbrk
//                    │ (0 .. proc size)             │
//   USER_TOP         ├──────────────────────────────┤  PML4 slot 255
//   KERNEL_BASE      │ shared kernel slot           │  aliased into every
//                    │   boot-time kernel regions   │  address space
//                    │   ...                        │
//   kstack_floor(n)  │   ...                        │
//                    │   kstack(1)                  │
//                    │   guard                      │
//                    │   kstack(0)                  │
//                    │   guard                      │
//   TRAMPOLINE       │   trampoline page            │
//   MAX_VA           └──────────────────────────────┘  1 << 47
//
// Kernel stacks sit two pages apart so the page below each one is never
// mapped; overflowing a stack faults instead of corrupting its neighbour.
// =============================================================================

use super::address::VirtAddr;

/// Size of a standard page (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// One past the highest virtual address a walk will accept.
pub const MAX_VA: u64 = 1 << 47;

/// Top-level (PML4) index whose subtree is shared by every address space.
pub const KERNEL_SLOT: usize = 255;

/// Exclusive upper bound of user memory.
pub const USER_TOP: u64 = (KERNEL_SLOT as u64) << 39;

/// Highest page of the address space, mapped in every address space.
pub const TRAMPOLINE: u64 = MAX_VA - PAGE_SIZE as u64;

/// Base of the kernel stack for process slot `slot`.
#[inline]
pub const fn kstack(slot: usize) -> VirtAddr {
    VirtAddr::new(TRAMPOLINE - ((slot as u64) + 1) * 2 * PAGE_SIZE as u64)
}

/// Lowest address available to boot-time kernel regions.
pub const KERNEL_BASE: u64 = USER_TOP;

/// Lowest address used by the kernel stacks of `max_procs` slots; kernel
/// regions must end at or below it.
#[inline]
pub const fn kstack_floor(max_procs: usize) -> u64 {
    kstack(max_procs - 1).as_u64() - PAGE_SIZE as u64
}
