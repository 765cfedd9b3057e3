//! VMem_R - the virtual memory subsystem of a Unix-like kernel, in Rust
//!
//! This crate backs per-process address spaces with physical pages and
//! implements demand paging, copy-on-write forking, lazy commit, purgeable
//! memory, and page-fault handling. The architecture-specific translation
//! layer is an interface (`arch`, `paging`); the embedding kernel supplies
//! the physical window and routes CPU faults into `vm::memory_manager`.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

// Core types
pub mod types;

// Architecture interface
pub mod arch;

// Page-table entry encoding
pub mod paging;

// The VM core
pub mod vm;

/// Subsystem version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Subsystem name
pub const NAME: &str = "VMem_R";
