//! Physical pages and the page tables built from them.
//!
//! `frame` hands out pages, `vmm` walks and edits one 4-level table, and
//! `space` turns a table into a user or kernel address space.

pub mod address;
pub mod frame;
pub mod layout;
pub mod space;
pub mod vmm;
