// =============================================================================
// xv64 — Kernel Error Type
// =============================================================================
//
// Two kinds of failure cross the core's API boundary as values:
//   - resource exhaustion (no frame, no process slot), and
//   - user-induced failures (bad address, wait without children).
// Both leave no partially built state behind. Broken invariants never
// become a `KernelError`; they panic and stop the CPU.
// =============================================================================

use core::fmt;

/// Recoverable failures reported by the process/memory core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The page allocator had no frame for data or a page table.
    OutOfMemory,
    /// Every process slot is in use.
    NoFreeSlot,
    /// `wait` was called by a process with no children.
    NoChildren,
    /// The caller was killed while blocked.
    Killed,
    /// `kill` found no live process with that pid.
    NoSuchProcess,
    /// A user range is unmapped, not user-accessible, or out of range.
    BadAddress,
    /// `copy_in_string` found no NUL within the allowed length.
    NoTerminator,
    /// A requested size runs past the top of user memory.
    OutOfRange,
    /// Boot-time configuration is inconsistent.
    BadConfig(&'static str),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of physical memory"),
            KernelError::NoFreeSlot => write!(f, "process table full"),
            KernelError::NoChildren => write!(f, "no children to wait for"),
            KernelError::Killed => write!(f, "process was killed"),
            KernelError::NoSuchProcess => write!(f, "no such process"),
            KernelError::BadAddress => write!(f, "bad user address"),
            KernelError::NoTerminator => write!(f, "string not terminated"),
            KernelError::OutOfRange => write!(f, "size beyond user address limit"),
            KernelError::BadConfig(why) => write!(f, "bad kernel config: {}", why),
        }
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
