//! Processes, CPUs and scheduling.

pub mod clock;
pub mod cpu;
pub mod files;
pub mod process;
pub mod scheduler;
