// =============================================================================
// xv64 — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual one is the classic paging bug:
// a page-table entry that stores a virtual address "works" until the first
// walk through it scribbles over a random frame.
//
// SOLUTION: Newtype pattern.
//   PhysAddr and VirtAddr are separate types. The compiler prevents you from
//   using one where the other is expected. Physical frames are only ever
//   touched through the page allocator's `page_ptr`, never by casting.
//
// VIRTUAL ADDRESS SHAPE (4-level paging):
//
//   63       48 47    39 38    30 29    21 20    12 11       0
//   ┌──────────┬────────┬────────┬────────┬────────┬─────────┐
//   │ sign ext │ PML4   │  PDPT  │   PD   │   PT   │ Offset  │
//   │ (16 bit) │ (9bit) │ (9bit) │ (9bit) │ (9bit) │ (12bit) │
//   └──────────┴────────┴────────┴────────┴────────┴─────────┘
//               level 4  level 3  level 2  level 1
//
//   Process address spaces live entirely in the lower half, so every
//   address this core hands out is below `MAX_VA` (1 << 47) and needs no
//   sign extension.
//
// =============================================================================

use core::fmt;

use super::layout::PAGE_SIZE;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

// =============================================================================
// PhysAddr — A physical memory address
// =============================================================================

/// A physical memory address.
///
/// Page-table entries store these; the page allocator hands them out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Creates a new physical address.
    ///
    /// # Panics
    /// Debug-asserts that the address fits in 52 bits (x86_64 limit).
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(
            addr & 0xFFF0_0000_0000_0000 == 0,
            "Physical address exceeds 52-bit limit"
        );
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// The `P:` prefix distinguishes physical from virtual addresses in logs.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: PhysAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// VirtAddr — A virtual memory address
// =============================================================================

/// A virtual memory address.
///
/// Unlike `PhysAddr`, a `VirtAddr` may come straight from user space, so
/// construction never asserts anything. Range checks happen in the
/// address-space code, which rejects anything at or above `MAX_VA`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Aligns this address down to the nearest 4KB page boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns this address up to the nearest 4KB page boundary.
    ///
    /// Saturates at the last page boundary instead of wrapping to zero,
    /// so a hostile size near `u64::MAX` still fails the `MAX_VA` check.
    #[inline]
    pub const fn page_align_up(self) -> Self {
        match self.0.checked_add(PAGE_MASK) {
            Some(v) => Self(v & !PAGE_MASK),
            None => Self(u64::MAX & !PAGE_MASK),
        }
    }

    /// The 9-bit table index this address selects at `level`
    /// (4 = PML4 … 1 = PT).
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        ((self.0 >> (12 + 9 * (level - 1))) & 0x1FF) as usize
    }

    /// `[PT, PD, PDPT, PML4]` indices, lowest level first.
    #[inline]
    pub const fn page_table_indices(self) -> [usize; 4] {
        [
            self.table_index(1),
            self.table_index(2),
            self.table_index(3),
            self.table_index(4),
        ]
    }

    /// Extracts the 12-bit page offset (the part within a 4KB page).
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    #[inline]
    pub const fn checked_add(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#014X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#014X}", self.0)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl core::ops::Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u64) -> Self {
        Self(self.0 - offset)
    }
}

impl core::ops::Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: VirtAddr) -> u64 {
        self.0 - other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_indices() {
        let va = VirtAddr::new((3 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x123);
        assert_eq!(va.page_table_indices(), [9, 7, 5, 3]);
        assert_eq!(va.table_index(4), 3);
        assert_eq!(va.page_offset(), 0x123);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(VirtAddr::new(0x1234).page_align_down(), VirtAddr::new(0x1000));
        assert_eq!(VirtAddr::new(0x1234).page_align_up(), VirtAddr::new(0x2000));
        assert_eq!(VirtAddr::new(0x2000).page_align_up(), VirtAddr::new(0x2000));
        assert!(VirtAddr::new(u64::MAX).page_align_up().is_page_aligned());
        assert!(PhysAddr::new(0x5000).is_page_aligned());
        assert_eq!(PhysAddr::new(0x5fff).page_align_down(), PhysAddr::new(0x5000));
    }
}
