// =============================================================================
// xv64 — Kernel Synchronization Primitives
// =============================================================================
//
// Lock ordering (outermost first). Never acquire an earlier lock while
// holding a later one:
//
//   1. tickslock                  (task::clock)
//   2. parent process lock
//   3. child process lock         — at most two process locks at once,
//                                   always parent before child
//   4. kernel address-space lock  (kernel stacks)
//   5. frame arena mutex          (inside the page allocator)
//
// `sched` must be entered holding exactly one lock: the caller's own
// process lock.
// =============================================================================

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
