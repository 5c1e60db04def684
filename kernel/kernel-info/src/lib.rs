//! # Kernel Configuration Constants
//!
//! Single home for the memory-layout facts the rest of the kernel needs to
//! agree on. Keeping them in one leaf crate means the PMM, the MMU backend
//! and the VMM can all reference the same numbers without depending on each
//! other.

#![cfg_attr(not(test), no_std)]

pub mod memory;
