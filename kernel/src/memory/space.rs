// =============================================================================
// xv64 — Address Spaces
// =============================================================================
//
// An `AddressSpace` is the root of one 4-level page table plus everything
// it owns: every page-table page it allocated below the root, and every
// physical page mapped by a leaf in the user half.
//
// SHARED KERNEL SLOT:
//   PML4 entries from `KERNEL_SLOT` (255) up are special. The kernel
//   address space allocates the PDPT behind slot 255 once at boot; every
//   user address space copies those root entries. The kernel's own
//   regions (image, direct map of RAM, device windows), the kernel stacks
//   and the trampoline live in this subtree, so mapping a stack into the
//   kernel space makes it visible in every process at once. No
//   per-process operation ever walks into, frees, or copies the slot.
//
// OWNERSHIP WALKS:
//   Teardown, clone and pruning are recursive walks over table *indices*,
//   never over cached pointers, so a freed frame is never touched again.
//   Teardown is post-order: a table is freed only after everything below
//   it has been returned to the allocator.
// =============================================================================

use core::ptr;

use super::address::{PhysAddr, VirtAddr};
use super::frame::PageAllocator;
use super::layout::{KERNEL_SLOT, MAX_VA, PAGE_SIZE, TRAMPOLINE, USER_TOP};
use super::vmm::{ENTRIES, PageTable, PageTableEntry, PageTableFlags};
use crate::error::{KernelError, Result};

const PAGE: u64 = PAGE_SIZE as u64;

/// Bytes of virtual address space covered by one entry at `level`.
#[inline]
const fn entry_span(level: usize) -> u64 {
    1 << (12 + 9 * (level - 1))
}

/// A fixed kernel mapping installed at boot: part of the kernel image, a
/// window of RAM, or a device's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRegion {
    pub va: VirtAddr,
    pub pa: PhysAddr,
    pub len: u64,
    pub perm: PageTableFlags,
}

impl KernelRegion {
    pub const fn new(va: VirtAddr, pa: PhysAddr, len: u64, perm: PageTableFlags) -> Self {
        Self { va, pa, len, perm }
    }

    /// One past the last byte, or `None` if that overflows.
    pub fn end(&self) -> Option<u64> {
        self.va.as_u64().checked_add(self.len)
    }
}

/// One process's (or the kernel's) page-table hierarchy.
pub struct AddressSpace {
    root: PhysAddr,
    pages: &'static dyn PageAllocator,
}

// SAFETY: an AddressSpace exclusively owns the frames reachable from its
// root (except the shared kernel slot, which is only mutated under the
// kernel space lock).
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    // ── Construction ──────────────────────────────────────────────────

    /// Builds the process-independent kernel address space: an empty user
    /// half, the shared kernel-slot PDPT, the trampoline page and every
    /// region in `regions`.
    ///
    /// On failure every frame taken so far is returned to `pages`.
    pub fn new_kernel(pages: &'static dyn PageAllocator, regions: &[KernelRegion]) -> Result<Self> {
        let mut space = Self { root: alloc_table(pages)?, pages };
        match space.build_kernel(regions) {
            Ok(()) => Ok(space),
            Err(e) => {
                space.discard_kernel();
                Err(e)
            }
        }
    }

    fn build_kernel(&mut self, regions: &[KernelRegion]) -> Result<()> {
        let slot = alloc_table(self.pages)?;
        self.root_table()[KERNEL_SLOT].set(slot, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);

        let trampoline = self.pages.alloc_page().ok_or(KernelError::OutOfMemory)?;
        zero_page(self.pages, trampoline);
        if let Err(e) = self.map(VirtAddr::new(TRAMPOLINE), trampoline, PAGE, PageTableFlags::PRESENT) {
            self.pages.free_page(trampoline);
            return Err(e);
        }

        for region in regions {
            self.map(region.va, region.pa, region.len, region.perm)?;
            klog::debug!("space: kernel region {} -> {} ({} bytes)", region.va, region.pa, region.len);
        }
        Ok(())
    }

    /// Releases a kernel space that failed to build: the trampoline page
    /// and every table. Region frames belong to the machine, not to us.
    fn discard_kernel(mut self) {
        if let Some(entry) = self.lookup(VirtAddr::new(TRAMPOLINE)).filter(|e| e.is_present()) {
            self.pages.free_page(entry.addr());
        }
        let root = self.root;
        self.free_tables(root, 4);
        self.pages.free_page(root);
    }

    /// Frees the tables below `table`, leaving leaf frames alone.
    fn free_tables(&mut self, table: PhysAddr, level: usize) {
        if level == 1 {
            return;
        }
        for i in 0..ENTRIES {
            // SAFETY: table frames below the root are owned by this space.
            let entry = unsafe { self.table(table) }[i];
            if entry.is_present() {
                self.free_tables(entry.addr(), level - 1);
                self.pages.free_page(entry.addr());
            }
        }
    }

    /// Creates an empty user address space sharing `kernel`'s root entries
    /// from `KERNEL_SLOT` up.
    pub fn new_user(kernel: &AddressSpace) -> Result<Self> {
        let pages = kernel.pages;
        let mut space = Self { root: alloc_table(pages)?, pages };
        for i in KERNEL_SLOT..ENTRIES {
            space.root_table()[i] = kernel.root_table_ref()[i];
        }
        Ok(space)
    }

    /// Physical address of the PML4, suitable for CR3.
    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    // ── Walking ───────────────────────────────────────────────────────

    /// Returns the leaf entry for `va`, creating missing intermediate
    /// tables when `create` is set.
    ///
    /// Fails when a table is missing and `create` is false, when a table
    /// page cannot be allocated, or when `va` is at or beyond `MAX_VA`.
    pub fn walk(&mut self, va: VirtAddr, create: bool) -> Option<&mut PageTableEntry> {
        if va.as_u64() >= MAX_VA {
            return None;
        }
        let mut table = self.root;
        for level in (2..=4).rev() {
            // SAFETY: `table` is a page-table frame owned by (or shared
            // into) this space, and `&mut self` keeps other walkers out.
            let entry = unsafe { &mut self.table_mut(table)[va.table_index(level)] };
            if entry.is_present() {
                assert!(!entry.is_huge(), "walk: huge page at level {} for {}", level, va);
                table = entry.addr();
            } else {
                if !create {
                    return None;
                }
                let next = alloc_table(self.pages).ok()?;
                entry.set(next, PageTableFlags::INTERMEDIATE);
                table = next;
            }
        }
        // SAFETY: as above; the leaf table outlives the returned borrow.
        Some(unsafe { &mut self.table_mut(table)[va.table_index(1)] })
    }

    /// Read-only lookup of the leaf entry for `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<PageTableEntry> {
        if va.as_u64() >= MAX_VA {
            return None;
        }
        let mut table = self.root;
        for level in (2..=4).rev() {
            // SAFETY: read-only access to a table frame owned by this space.
            let entry = unsafe { self.table(table) }[va.table_index(level)];
            if !entry.is_present() {
                return None;
            }
            table = entry.addr();
        }
        // SAFETY: see above.
        Some(unsafe { self.table(table) }[va.table_index(1)])
    }

    /// Physical address `va` translates to, whatever its privilege.
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let entry = self.lookup(va)?;
        entry.is_present().then(|| entry.addr() + va.page_offset() as u64)
    }

    /// Frame backing the user page at `va`, or `None` if `va` is not a
    /// present, user-accessible mapping.
    fn user_page(&self, va: VirtAddr) -> Option<PhysAddr> {
        let entry = self.lookup(va)?;
        (entry.is_present() && entry.is_user()).then(|| entry.addr())
    }

    // ── Map / unmap ───────────────────────────────────────────────────

    /// Maps `[va, va + len)` to consecutive frames starting at `pa`.
    ///
    /// # Panics
    /// If any page in the range is already mapped.
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, len: u64, perm: PageTableFlags) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len - 1).ok_or(KernelError::OutOfRange)?;
        if end.as_u64() >= MAX_VA {
            return Err(KernelError::OutOfRange);
        }
        let last = end.page_align_down();
        let mut a = va.page_align_down();
        let mut pa = pa.page_align_down();
        loop {
            let pte = self.walk(a, true).ok_or(KernelError::OutOfMemory)?;
            if pte.is_present() {
                panic!("map: remap of {} (already {:?})", a, pte);
            }
            pte.set(pa, perm | PageTableFlags::PRESENT);
            if a == last {
                return Ok(());
            }
            a = a + PAGE;
            pa = pa + PAGE;
        }
    }

    /// Removes the mappings covering `[va, va + len)`, returning the
    /// backing frames to the allocator when `free` is set.
    ///
    /// # Panics
    /// If any page in the range is not mapped.
    pub fn unmap(&mut self, va: VirtAddr, len: u64, free: bool) {
        if len == 0 {
            return;
        }
        let pages = self.pages;
        let Some(end) = va.checked_add(len - 1) else {
            panic!("unmap: range at {} overflows", va);
        };
        let last = end.page_align_down();
        let mut a = va.page_align_down();
        loop {
            let Some(pte) = self.walk(a, false) else {
                panic!("unmap: no table for {}", a);
            };
            if !pte.is_present() {
                panic!("unmap: {} not mapped", a);
            }
            if free {
                pages.free_page(pte.addr());
            }
            pte.clear();
            if a == last {
                return;
            }
            a = a + PAGE;
        }
    }

    // ── Grow / shrink ─────────────────────────────────────────────────

    /// Extends user memory from `old_size` to `new_size` with zeroed,
    /// user-writable pages.
    ///
    /// On failure every page and page table added by this call is released
    /// again and the space is left at `old_size`.
    pub fn grow(&mut self, old_size: u64, new_size: u64) -> Result<u64> {
        if new_size < old_size {
            return Ok(old_size);
        }
        if new_size > USER_TOP {
            return Err(KernelError::OutOfRange);
        }
        let mut a = VirtAddr::new(old_size).page_align_up();
        while a.as_u64() < new_size {
            let Some(page) = self.pages.alloc_page() else {
                self.undo_grow(old_size, a);
                return Err(KernelError::OutOfMemory);
            };
            zero_page(self.pages, page);
            if let Err(e) = self.map(a, page, PAGE, PageTableFlags::USER_DATA) {
                self.pages.free_page(page);
                self.undo_grow(old_size, a);
                return Err(e);
            }
            a = a + PAGE;
        }
        Ok(new_size)
    }

    /// Unmaps the pages a failed `grow` mapped below `failed_at`, then
    /// prunes through `failed_at` itself, where the failing walk may have
    /// left fresh, empty tables.
    fn undo_grow(&mut self, old_size: u64, failed_at: VirtAddr) {
        let lo = VirtAddr::new(old_size).page_align_up().as_u64();
        let hi = failed_at.as_u64();
        if lo < hi {
            self.unmap(VirtAddr::new(lo), hi - lo, true);
        }
        let root = self.root;
        self.prune(root, 4, 0, lo, hi + PAGE);
    }

    /// Releases user pages above `new_size`. Returns the resulting size;
    /// asking to shrink to a larger size is a no-op that returns
    /// `old_size`.
    ///
    /// Page-table pages left empty by the shrink are freed as well, so a
    /// grow followed by the matching shrink returns every frame it took.
    pub fn shrink(&mut self, old_size: u64, new_size: u64) -> u64 {
        if new_size >= old_size {
            return old_size;
        }
        let lo = VirtAddr::new(new_size).page_align_up().as_u64();
        let hi = VirtAddr::new(old_size).page_align_up().as_u64();
        if lo < hi {
            self.unmap(VirtAddr::new(lo), hi - lo, true);
            let root = self.root;
            self.prune(root, 4, 0, lo, hi);
        }
        new_size
    }

    /// Frees page-table pages under `table` that cover part of `[lo, hi)`
    /// and no longer map anything.
    fn prune(&mut self, table: PhysAddr, level: usize, base: u64, lo: u64, hi: u64) {
        if level == 1 {
            return;
        }
        let span = entry_span(level);
        let first = (lo.max(base) - base) / span;
        let last = ((hi - 1 - base) / span).min(ENTRIES as u64 - 1);
        for i in first as usize..=last as usize {
            if level == 4 && i >= KERNEL_SLOT {
                break;
            }
            // SAFETY: table frames below the root are owned by this space.
            let entry = unsafe { self.table(table) }[i];
            if !entry.is_present() {
                continue;
            }
            let child = entry.addr();
            self.prune(child, level - 1, base + i as u64 * span, lo, hi);
            // SAFETY: as above.
            if unsafe { self.table(child) }.is_empty() {
                // SAFETY: as above.
                unsafe { self.table_mut(table)[i].clear() };
                self.pages.free_page(child);
            }
        }
    }

    // ── User copies ───────────────────────────────────────────────────

    /// Copies `src` into user memory at `dst`.
    pub fn copy_out(&mut self, dst: VirtAddr, src: &[u8]) -> Result<()> {
        let mut va = dst;
        let mut done = 0;
        while done < src.len() {
            let page_va = va.page_align_down();
            let pa = self.user_page(page_va).ok_or(KernelError::BadAddress)?;
            let offset = va.page_offset();
            let n = (PAGE_SIZE - offset).min(src.len() - done);
            // SAFETY: `pa` is a user frame owned by this space and
            // `offset + n` stays within the page.
            unsafe {
                ptr::copy_nonoverlapping(src[done..].as_ptr(), self.pages.page_ptr(pa).add(offset), n);
            }
            done += n;
            va = page_va + PAGE;
        }
        Ok(())
    }

    /// Fills `dst` from user memory starting at `src`.
    pub fn copy_in(&self, dst: &mut [u8], src: VirtAddr) -> Result<()> {
        let mut va = src;
        let mut done = 0;
        while done < dst.len() {
            let page_va = va.page_align_down();
            let pa = self.user_page(page_va).ok_or(KernelError::BadAddress)?;
            let offset = va.page_offset();
            let n = (PAGE_SIZE - offset).min(dst.len() - done);
            // SAFETY: see copy_out.
            unsafe {
                ptr::copy_nonoverlapping(self.pages.page_ptr(pa).add(offset), dst[done..].as_mut_ptr(), n);
            }
            done += n;
            va = page_va + PAGE;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from user memory into `dst`,
    /// terminator included. Returns the number of bytes copied.
    ///
    /// Fails with `NoTerminator` if `dst` fills up before a NUL is seen.
    pub fn copy_in_string(&self, dst: &mut [u8], src: VirtAddr) -> Result<usize> {
        let mut va = src;
        let mut done = 0;
        while done < dst.len() {
            let page_va = va.page_align_down();
            let pa = self.user_page(page_va).ok_or(KernelError::BadAddress)?;
            let offset = va.page_offset();
            let n = (PAGE_SIZE - offset).min(dst.len() - done);
            // SAFETY: see copy_out.
            let bytes = unsafe { core::slice::from_raw_parts(self.pages.page_ptr(pa).add(offset), n) };
            match bytes.iter().position(|&b| b == 0) {
                Some(nul) => {
                    dst[done..=done + nul].copy_from_slice(&bytes[..=nul]);
                    return Ok(done + nul + 1);
                }
                None => dst[done..done + n].copy_from_slice(bytes),
            }
            done += n;
            va = page_va + PAGE;
        }
        Err(KernelError::NoTerminator)
    }

    // ── Clone / teardown ──────────────────────────────────────────────

    /// Builds a new address space holding a private copy of every user
    /// page in this one, at the same addresses with the same permissions.
    pub fn try_clone(&self, kernel: &AddressSpace) -> Result<AddressSpace> {
        let mut child = AddressSpace::new_user(kernel)?;
        match self.copy_user_into(&mut child) {
            Ok(()) => Ok(child),
            Err(e) => {
                child.teardown();
                Err(e)
            }
        }
    }

    /// Copies every user mapping of `self` into the (empty) user half of
    /// `dst`. On failure `dst` holds a partial copy that the caller tears
    /// down.
    pub fn copy_user_into(&self, dst: &mut AddressSpace) -> Result<()> {
        self.copy_tree(dst, self.root, 4, 0)
    }

    fn copy_tree(&self, dst: &mut AddressSpace, table: PhysAddr, level: usize, base: u64) -> Result<()> {
        let limit = if level == 4 { KERNEL_SLOT } else { ENTRIES };
        for i in 0..limit {
            // SAFETY: table frames below the root are owned by this space.
            let entry = unsafe { self.table(table) }[i];
            if !entry.is_present() {
                continue;
            }
            let va = base + i as u64 * entry_span(level);
            if level > 1 {
                self.copy_tree(dst, entry.addr(), level - 1, va)?;
                continue;
            }
            let page = self.pages.alloc_page().ok_or(KernelError::OutOfMemory)?;
            // SAFETY: both frames are whole pages, the source owned by
            // this space and the destination freshly allocated.
            unsafe {
                ptr::copy_nonoverlapping(self.pages.page_ptr(entry.addr()), self.pages.page_ptr(page), PAGE_SIZE);
            }
            let perm = entry.flags() & PageTableFlags::PERMISSIONS;
            if let Err(e) = dst.map(VirtAddr::new(va), page, PAGE, perm) {
                self.pages.free_page(page);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Frees every user page, then every page-table page, then the root.
    /// The shared kernel slot is left alone.
    pub fn teardown(mut self) {
        let root = self.root;
        let (leaves, tables) = self.free_tree(root, 4);
        self.pages.free_page(root);
        klog::trace!("space: teardown {} freed {} pages, {} tables", root, leaves, tables + 1);
    }

    fn free_tree(&mut self, table: PhysAddr, level: usize) -> (usize, usize) {
        let limit = if level == 4 { KERNEL_SLOT } else { ENTRIES };
        let (mut leaves, mut tables) = (0, 0);
        for i in 0..limit {
            // SAFETY: table frames below the root are owned by this space.
            let entry = unsafe { self.table(table) }[i];
            if !entry.is_present() {
                continue;
            }
            if level > 1 {
                let (l, t) = self.free_tree(entry.addr(), level - 1);
                leaves += l;
                tables += t + 1;
            } else {
                leaves += 1;
            }
            self.pages.free_page(entry.addr());
            // SAFETY: as above.
            unsafe { self.table_mut(table)[i].clear() };
        }
        (leaves, tables)
    }

    // ── Internal helpers ──────────────────────────────────────────────

    #[inline]
    fn table_ptr(&self, table: PhysAddr) -> *mut PageTable {
        self.pages.page_ptr(table).cast::<PageTable>()
    }

    /// # Safety
    /// `table` must be a page-table frame reachable from this space.
    #[inline]
    unsafe fn table(&self, table: PhysAddr) -> &PageTable {
        unsafe { &*self.table_ptr(table) }
    }

    /// # Safety
    /// As for `table`, and no other reference to the frame may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self, table: PhysAddr) -> &mut PageTable {
        unsafe { &mut *self.table_ptr(table) }
    }

    fn root_table(&mut self) -> &mut PageTable {
        // SAFETY: the root frame is owned by this space.
        unsafe { self.table_mut(self.root) }
    }

    fn root_table_ref(&self) -> &PageTable {
        // SAFETY: the root frame is owned by this space.
        unsafe { self.table(self.root) }
    }
}

/// Allocates a zero-filled page-table page.
fn alloc_table(pages: &'static dyn PageAllocator) -> Result<PhysAddr> {
    let frame = pages.alloc_page().ok_or(KernelError::OutOfMemory)?;
    // SAFETY: a freshly allocated frame is exclusively ours.
    unsafe { (&mut *pages.page_ptr(frame).cast::<PageTable>()).zero() };
    Ok(frame)
}

pub(crate) fn zero_page(pages: &'static dyn PageAllocator, page: PhysAddr) {
    // SAFETY: callers own `page`.
    unsafe { ptr::write_bytes(pages.page_ptr(page), 0, PAGE_SIZE) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame::FrameArena;
    use crate::memory::layout::{KERNEL_BASE, kstack};
    use alloc::boxed::Box;
    use alloc::vec;

    /// A device window well outside any test arena.
    const MMIO: KernelRegion = KernelRegion::new(
        VirtAddr::new(KERNEL_BASE),
        PhysAddr::new(0xFEE0_0000),
        PAGE,
        PageTableFlags::KERNEL_DATA,
    );

    fn arena(pages: usize) -> &'static FrameArena {
        Box::leak(Box::new(FrameArena::new(pages)))
    }

    fn setup(pages: usize) -> (&'static FrameArena, AddressSpace, AddressSpace) {
        let arena = arena(pages);
        let kernel = AddressSpace::new_kernel(arena, &[]).unwrap();
        let user = AddressSpace::new_user(&kernel).unwrap();
        (arena, kernel, user)
    }

    /// Takes frames out of `arena` until only `left` remain.
    fn hoard(arena: &FrameArena, left: usize) {
        while arena.free_pages() > left {
            arena.alloc_page().unwrap();
        }
    }

    #[test]
    fn test_walk_creates_tables_on_demand() {
        let (arena, _kernel, mut user) = setup(32);
        let va = VirtAddr::new(0x40_0000);

        assert!(user.walk(va, false).is_none());
        let before = arena.free_pages();
        let leaf = user.walk(va, true).unwrap();
        assert!(!leaf.is_present());
        // PDPT, PD and PT for a fresh corner of the user half.
        assert_eq!(before - arena.free_pages(), 3);
        assert!(user.walk(va, false).is_some());
    }

    #[test]
    fn test_walk_rejects_addresses_beyond_max_va() {
        let (_arena, _kernel, mut user) = setup(16);
        assert!(user.walk(VirtAddr::new(MAX_VA), true).is_none());
        assert!(user.walk(VirtAddr::new(u64::MAX), false).is_none());
    }

    #[test]
    fn test_single_page_pattern_round_trip() {
        let (arena, _kernel, mut user) = setup(32);
        let page = arena.alloc_page().unwrap();
        let va = VirtAddr::new(0x1000_0000);
        user.map(va, page, PAGE, PageTableFlags::USER_DATA).unwrap();

        user.copy_out(va, &[0xAA; PAGE_SIZE]).unwrap();
        let mut back = vec![0u8; PAGE_SIZE];
        user.copy_in(&mut back, va).unwrap();
        assert!(back.iter().all(|&b| b == 0xAA));
        assert_eq!(user.translate(va + 5), Some(page + 5));
    }

    #[test]
    fn test_zero_length_map_and_unmap_are_noops() {
        let (arena, _kernel, mut user) = setup(16);
        let before = arena.free_pages();
        user.map(VirtAddr::new(0x5000), PhysAddr::new(0x20_0000), 0, PageTableFlags::USER_DATA).unwrap();
        user.unmap(VirtAddr::new(0x5000), 0, true);
        assert_eq!(arena.free_pages(), before);
        assert!(user.lookup(VirtAddr::new(0x5000)).is_none());
    }

    #[test]
    fn test_map_rounds_range_outward() {
        let (arena, _kernel, mut user) = setup(32);
        let a = arena.alloc_page().unwrap();
        let b = arena.alloc_page().unwrap();
        // A fresh arena hands out ascending frames.
        assert_eq!(b, a + PAGE);
        // Two bytes straddling a page boundary need two pages.
        user.map(VirtAddr::new(0x3FFF), a, 2, PageTableFlags::USER_DATA).unwrap();
        assert_eq!(user.translate(VirtAddr::new(0x3000)), Some(a));
        assert_eq!(user.translate(VirtAddr::new(0x4000)), Some(b));
        assert!(user.translate(VirtAddr::new(0x5000)).is_none());
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn test_overlapping_map_is_fatal() {
        let (arena, _kernel, mut user) = setup(32);
        let page = arena.alloc_page().unwrap();
        user.map(VirtAddr::new(0x2000), page, PAGE, PageTableFlags::USER_DATA).unwrap();
        user.map(VirtAddr::new(0x2000), page, PAGE, PageTableFlags::USER_DATA).unwrap();
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn test_unmapping_a_hole_is_fatal() {
        let (_arena, _kernel, mut user) = setup(32);
        user.grow(0, PAGE).unwrap();
        user.unmap(VirtAddr::new(0x1000), PAGE, false);
    }

    #[test]
    fn test_grow_then_shrink_round_trip() {
        let (arena, _kernel, mut user) = setup(64);
        let baseline = arena.free_pages();

        assert_eq!(user.grow(0, 3 * PAGE + 10), Ok(3 * PAGE + 10));
        for i in 0..4 {
            assert!(user.translate(VirtAddr::new(i * PAGE)).is_some());
        }
        assert!(user.translate(VirtAddr::new(4 * PAGE)).is_none());

        assert_eq!(user.shrink(3 * PAGE + 10, 0), 0);
        for i in 0..4 {
            assert!(user.translate(VirtAddr::new(i * PAGE)).is_none());
        }
        assert_eq!(arena.free_pages(), baseline);
    }

    #[test]
    fn test_partial_shrink_keeps_lower_pages() {
        let (arena, _kernel, mut user) = setup(64);
        user.grow(0, 2 * PAGE).unwrap();
        user.copy_out(VirtAddr::new(0), b"kept").unwrap();
        let before = arena.free_pages();

        user.grow(2 * PAGE, 5 * PAGE).unwrap();
        assert_eq!(user.shrink(5 * PAGE, 2 * PAGE), 2 * PAGE);
        assert_eq!(arena.free_pages(), before);

        let mut buf = [0u8; 4];
        user.copy_in(&mut buf, VirtAddr::new(0)).unwrap();
        assert_eq!(&buf, b"kept");
        assert!(user.translate(VirtAddr::new(2 * PAGE)).is_none());
    }

    #[test]
    fn test_grow_pages_are_zeroed() {
        let (arena, _kernel, mut user) = setup(32);
        // Dirty a frame and give it back; LIFO hands it out again.
        let page = arena.alloc_page().unwrap();
        unsafe { ptr::write_bytes(arena.page_ptr(page), 0x5A, PAGE_SIZE) };
        arena.free_page(page);

        user.grow(0, PAGE).unwrap();
        let mut buf = vec![0xFFu8; PAGE_SIZE];
        user.copy_in(&mut buf, VirtAddr::new(0)).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shrink_to_larger_size_is_noop() {
        let (_arena, _kernel, mut user) = setup(32);
        user.grow(0, PAGE).unwrap();
        assert_eq!(user.shrink(PAGE, 2 * PAGE), PAGE);
        assert!(user.translate(VirtAddr::new(0)).is_some());
    }

    #[test]
    fn test_grow_failure_leaves_space_unchanged() {
        // The kernel space takes 5 frames and the user root 1; the first
        // grow takes 4 more, and the 3 left run out partway through the
        // second grow.
        let (arena, _kernel, mut user) = setup(13);
        user.grow(0, PAGE).unwrap();
        let before = arena.free_pages();

        assert_eq!(before, 3);
        assert_eq!(user.grow(PAGE, 10 * PAGE), Err(KernelError::OutOfMemory));
        assert_eq!(arena.free_pages(), before);
        assert!(user.translate(VirtAddr::new(0)).is_some());
        assert!(user.translate(VirtAddr::new(PAGE)).is_none());
    }

    #[test]
    fn test_failed_grow_across_gigabyte_releases_new_tables() {
        const GIB: u64 = 1 << 30;
        let (arena, _kernel, mut user) = setup(32);
        // The page below 1 GiB needs a PDPT, PD and PT plus itself; the page
        // at 1 GiB gets its frame and a second PD, then runs dry on its PT.
        hoard(arena, 6);

        assert_eq!(user.grow(GIB - PAGE, GIB + PAGE), Err(KernelError::OutOfMemory));
        assert_eq!(arena.free_pages(), 6);
        assert!(user.lookup(VirtAddr::new(GIB - PAGE)).is_none());
        assert!(user.lookup(VirtAddr::new(GIB)).is_none());
    }

    #[test]
    fn test_grow_beyond_user_top_is_rejected() {
        let (_arena, _kernel, mut user) = setup(16);
        assert_eq!(user.grow(0, USER_TOP + 1), Err(KernelError::OutOfRange));
    }

    #[test]
    fn test_copy_round_trips_across_page_boundaries() {
        let (_arena, _kernel, mut user) = setup(64);
        user.grow(0, 4 * PAGE).unwrap();

        for (start, len) in [(0, 0), (100, 1), (0, PAGE_SIZE), (PAGE_SIZE - 3, 7), (10, 3 * PAGE_SIZE)] {
            let data: vec::Vec<u8> = (0..len).map(|i| (i * 7 + start) as u8).collect();
            user.copy_out(VirtAddr::new(start as u64), &data).unwrap();
            let mut back = vec![0u8; len];
            user.copy_in(&mut back, VirtAddr::new(start as u64)).unwrap();
            assert_eq!(back, data, "start {} len {}", start, len);
        }
    }

    #[test]
    fn test_copy_rejects_unmapped_and_kernel_pages() {
        let (_arena, _kernel, mut user) = setup(32);
        user.grow(0, PAGE).unwrap();

        // Runs off the end of user memory.
        assert_eq!(user.copy_out(VirtAddr::new(PAGE - 2), &[1, 2, 3]), Err(KernelError::BadAddress));
        let mut buf = [0u8; 8];
        assert_eq!(user.copy_in(&mut buf, VirtAddr::new(MAX_VA)), Err(KernelError::BadAddress));
        // The trampoline is visible through the shared slot but not to user code.
        assert!(user.translate(VirtAddr::new(TRAMPOLINE)).is_some());
        assert_eq!(user.copy_in(&mut buf, VirtAddr::new(TRAMPOLINE)), Err(KernelError::BadAddress));
    }

    #[test]
    fn test_copy_in_string() {
        let (_arena, _kernel, mut user) = setup(32);
        user.grow(0, 2 * PAGE).unwrap();
        let at = VirtAddr::new(PAGE - 3);
        user.copy_out(at, b"init\0junk").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(user.copy_in_string(&mut buf, at), Ok(5));
        assert_eq!(&buf[..5], b"init\0");

        let mut short = [0u8; 4];
        assert_eq!(user.copy_in_string(&mut short, at), Err(KernelError::NoTerminator));
    }

    #[test]
    fn test_clone_is_a_private_copy() {
        let (arena, kernel, mut parent) = setup(64);
        parent.grow(0, 2 * PAGE).unwrap();
        parent.copy_out(VirtAddr::new(PAGE + 8), b"parent").unwrap();

        let mut child = parent.try_clone(&kernel).unwrap();
        let mut buf = [0u8; 6];
        child.copy_in(&mut buf, VirtAddr::new(PAGE + 8)).unwrap();
        assert_eq!(&buf, b"parent");
        assert_ne!(child.translate(VirtAddr::new(0)), parent.translate(VirtAddr::new(0)));

        child.copy_out(VirtAddr::new(PAGE + 8), b"child!").unwrap();
        parent.copy_in(&mut buf, VirtAddr::new(PAGE + 8)).unwrap();
        assert_eq!(&buf, b"parent");

        let before_teardown = arena.free_pages();
        child.teardown();
        // 2 data pages + PDPT + PD + PT + root.
        assert_eq!(arena.free_pages(), before_teardown + 6);
    }

    #[test]
    fn test_clone_failure_releases_partial_copy() {
        // Room for the child's root, one data page and two of the three
        // tables that page needs.
        let (arena, kernel, mut parent) = setup(17);
        parent.grow(0, 4 * PAGE).unwrap();
        let before = arena.free_pages();
        assert_eq!(before, 4);

        assert_eq!(parent.try_clone(&kernel).err(), Some(KernelError::OutOfMemory));
        assert_eq!(arena.free_pages(), before);
    }

    #[test]
    fn test_kernel_regions_are_shared_but_not_user_accessible() {
        let arena = arena(32);
        let kernel = AddressSpace::new_kernel(arena, &[MMIO]).unwrap();
        let user = AddressSpace::new_user(&kernel).unwrap();

        assert_eq!(kernel.translate(MMIO.va + 0x20), Some(MMIO.pa + 0x20));
        assert_eq!(user.translate(MMIO.va + 0x20), Some(MMIO.pa + 0x20));
        let mut buf = [0u8; 4];
        assert_eq!(user.copy_in(&mut buf, MMIO.va), Err(KernelError::BadAddress));
        // Region frames are not the allocator's.
        assert!(!arena.is_allocated(MMIO.pa));
    }

    #[test]
    fn test_failed_kernel_build_returns_every_frame() {
        // Root, slot PDPT, PD, PT, trampoline, then a PD and PT for the region.
        const FULL: usize = 7;
        for frames in 0..FULL {
            let arena = arena(frames);
            assert_eq!(
                AddressSpace::new_kernel(arena, &[MMIO]).err(),
                Some(KernelError::OutOfMemory),
                "{} frames",
                frames
            );
            assert_eq!(arena.free_pages(), frames);
        }
        let arena = arena(FULL);
        assert!(AddressSpace::new_kernel(arena, &[MMIO]).is_ok());
        assert_eq!(arena.free_pages(), 0);
    }

    #[test]
    fn test_teardown_frees_user_half_only() {
        let (arena, mut kernel, _user) = setup(64);
        let baseline = arena.free_pages();

        let mut user = AddressSpace::new_user(&kernel).unwrap();
        user.grow(0, 3 * PAGE).unwrap();
        let far = arena.alloc_page().unwrap();
        user.map(VirtAddr::new(0x7F00_0000_0000), far, PAGE, PageTableFlags::USER_DATA).unwrap();

        // A kernel stack mapped after the user space was created is still
        // visible through the shared slot, with its guard page unmapped.
        let before_stack = arena.free_pages();
        let stack = arena.alloc_page().unwrap();
        kernel.map(kstack(0), stack, PAGE, PageTableFlags::KERNEL_DATA).unwrap();
        let stack_cost = before_stack - arena.free_pages();
        assert_eq!(user.translate(kstack(0)), Some(stack));
        assert!(user.translate(kstack(0) + PAGE).is_none());

        user.teardown();
        assert_eq!(arena.free_pages(), baseline - stack_cost);
        assert_eq!(kernel.translate(kstack(0)), Some(stack));
        assert!(arena.is_allocated(stack));
    }
}
