// =============================================================================
// xv64 — Physical Page Allocator Interface and Frame Arena
// =============================================================================
//
// The address-space code never owns physical memory directly: it asks a
// `PageAllocator` for frames and hands them back on unmap/teardown. Frames
// are named by `PhysAddr`; contents are reached only via `page_ptr`, which
// on hardware is the direct map and in the arena is an offset into a
// heap block.
//
// `FrameArena` is the allocator used when the core runs hosted and in every
// test. It is a fixed block of page-aligned frames with a LIFO free list, so
// a freed frame is the next one handed out and leaks show up as a
// `free_pages()` mismatch.
//
// CONCURRENCY:
//   The free list sits behind a `spin::Mutex`, not the kernel `SpinLock`.
//   The allocator is an independent collaborator; it must work before any
//   CPU is bound and from any CPU holding any lock.
// =============================================================================

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use spin::Mutex;

use super::address::PhysAddr;
use super::layout::PAGE_SIZE;

/// Source of physical pages for page tables, user memory and kernel stacks.
///
/// Implementations must be safe to call concurrently from every CPU.
/// Returned pages are exclusively owned by the caller until freed. Their
/// contents are unspecified; callers zero what they need.
pub trait PageAllocator: Send + Sync {
    /// Allocates one page-aligned physical page.
    fn alloc_page(&self) -> Option<PhysAddr>;

    /// Returns a page previously obtained from `alloc_page`.
    fn free_page(&self, page: PhysAddr);

    /// Kernel-visible pointer to the first byte of `page`.
    fn page_ptr(&self, page: PhysAddr) -> *mut u8;
}

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_SIZE]>);

struct FreeList {
    free: Vec<u32>,
    allocated: Vec<bool>,
}

/// A fixed pool of frames addressed as if they started at `base`.
pub struct FrameArena {
    base: PhysAddr,
    frames: Box<[Frame]>,
    list: Mutex<FreeList>,
}

// SAFETY: frame contents are only reached through raw pointers handed to the
// single owner of each frame; the bookkeeping is behind the mutex.
unsafe impl Sync for FrameArena {}
unsafe impl Send for FrameArena {}

impl FrameArena {
    /// Default physical base of the arena. Nonzero so that a zero
    /// `PhysAddr` is never a valid frame.
    pub const DEFAULT_BASE: PhysAddr = PhysAddr::new(0x10_0000);

    pub fn new(pages: usize) -> Self {
        Self::with_base(Self::DEFAULT_BASE, pages)
    }

    pub fn with_base(base: PhysAddr, pages: usize) -> Self {
        assert!(base.is_page_aligned() && !base.is_zero(), "frame arena: bad base {}", base);
        let frames: Box<[Frame]> = (0..pages).map(|_| Frame(UnsafeCell::new([0; PAGE_SIZE]))).collect();
        // Hand out low frames first.
        let free = (0..pages as u32).rev().collect();
        Self {
            base,
            frames,
            list: Mutex::new(FreeList { free, allocated: alloc::vec![false; pages] }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn free_pages(&self) -> usize {
        self.list.lock().free.len()
    }

    pub fn is_allocated(&self, page: PhysAddr) -> bool {
        match self.index_of(page) {
            Some(index) => self.list.lock().allocated[index],
            None => false,
        }
    }

    fn index_of(&self, page: PhysAddr) -> Option<usize> {
        if !page.is_page_aligned() || page < self.base {
            return None;
        }
        let index = ((page - self.base) / PAGE_SIZE as u64) as usize;
        (index < self.frames.len()).then_some(index)
    }
}

impl PageAllocator for FrameArena {
    fn alloc_page(&self) -> Option<PhysAddr> {
        let mut list = self.list.lock();
        let index = list.free.pop()? as usize;
        list.allocated[index] = true;
        Some(self.base + (index * PAGE_SIZE) as u64)
    }

    fn free_page(&self, page: PhysAddr) {
        let Some(index) = self.index_of(page) else {
            panic!("free_page: {} is not an arena frame", page);
        };
        let mut list = self.list.lock();
        if !list.allocated[index] {
            panic!("free_page: double free of {}", page);
        }
        list.allocated[index] = false;
        list.free.push(index as u32);
    }

    fn page_ptr(&self, page: PhysAddr) -> *mut u8 {
        let Some(index) = self.index_of(page) else {
            panic!("page_ptr: {} is not an arena frame", page);
        };
        self.frames[index].0.get().cast::<u8>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_accounting() {
        let arena = FrameArena::new(4);
        assert_eq!(arena.free_pages(), 4);

        let a = arena.alloc_page().unwrap();
        let b = arena.alloc_page().unwrap();
        assert_ne!(a, b);
        assert!(a.is_page_aligned());
        assert!(arena.is_allocated(a));
        assert_eq!(arena.free_pages(), 2);

        arena.free_page(a);
        assert!(!arena.is_allocated(a));
        // LIFO: the page just freed comes back first.
        assert_eq!(arena.alloc_page(), Some(a));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let arena = FrameArena::new(2);
        assert!(arena.alloc_page().is_some());
        assert!(arena.alloc_page().is_some());
        assert_eq!(arena.alloc_page(), None);
    }

    #[test]
    fn test_page_ptr_is_page_aligned() {
        let arena = FrameArena::new(2);
        let page = arena.alloc_page().unwrap();
        assert_eq!(arena.page_ptr(page) as usize % PAGE_SIZE, 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let arena = FrameArena::new(1);
        let page = arena.alloc_page().unwrap();
        arena.free_page(page);
        arena.free_page(page);
    }
}
