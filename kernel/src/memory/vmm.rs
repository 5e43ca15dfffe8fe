// =============================================================================
// xv64 — Page Table Entries and Tables
// =============================================================================
//
// Raw x86_64 4-level page-table structures. The walking, mapping and
// teardown logic that gives them meaning lives in `space.rs`.
//
//   PML4 (Level 4) → PDPT (Level 3) → PD (Level 2) → PT (Level 1) → Page
//
//   Each level is a 4 KiB table containing 512 entries (each 8 bytes).
//
//   ```text
//   63  62..52  51..12       11..9   8   7   6   5   4   3   2   1   0
//   ┌───┬──────┬────────────┬───────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │NXE│ Avail│ Phys Addr  │ Avail │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └───┴──────┴────────────┴───────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//   ```
//
// Only 4 KiB leaves are ever created here; a PS bit met during a walk is a
// corrupted table, not something to translate through.
// =============================================================================

use bitflags::bitflags;

use super::address::PhysAddr;

bitflags! {
    /// x86_64 page table entry flags.
    ///
    /// Intermediate entries are created permissive (present, writable,
    /// user); the leaf entry carries the real restrictions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Page is present in physical memory.
        const PRESENT       = 1 << 0;
        /// Page is writable. If clear, writes cause a page fault.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (Ring 3).
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on a write.
        const DIRTY         = 1 << 6;
        /// 2 MiB / 1 GiB page. Never produced by this kernel.
        const HUGE_PAGE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// No-Execute (NX / XD). Instruction fetches cause a page fault.
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlags {
    /// Flags for a kernel read-write data page (stacks, trampoline data).
    pub const KERNEL_DATA: Self =
        Self::PRESENT.union(Self::WRITABLE).union(Self::NO_EXECUTE);

    /// Flags for every non-leaf entry. Effective permissions are the
    /// intersection of all levels, so restrictions belong at the leaf.
    pub const INTERMEDIATE: Self =
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Default permissions for user memory created by `grow`.
    pub const USER_DATA: Self =
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Bits a leaf copy must carry over unchanged when cloning an address
    /// space. Hardware status bits (accessed/dirty) start clean in the copy.
    pub const PERMISSIONS: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::WRITE_THROUGH)
        .union(Self::NO_CACHE)
        .union(Self::GLOBAL)
        .union(Self::NO_EXECUTE);
}

// =============================================================================
// Page Table Entry
// =============================================================================

/// A single entry in an x86_64 page table.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

/// Bits 12 through 51 — the 40-bit physical page frame number.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    /// A non-present (zeroed) entry.
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Physical address stored in this entry. Only meaningful if present.
    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    #[inline]
    pub fn is_user(self) -> bool {
        self.0 & PageTableFlags::USER.bits() != 0
    }

    /// Points this entry at `addr` with `flags`.
    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(
            addr.is_page_aligned(),
            "vmm: page table entry address must be page-aligned"
        );
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

// =============================================================================
// Page Table
// =============================================================================

/// Number of entries per table at every level.
pub const ENTRIES: usize = 512;

/// One level of the hierarchy: 512 entries filling exactly one frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

impl PageTable {
    /// Makes every entry non-present.
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}
