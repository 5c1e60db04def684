//! # Slab Object Cache
//!
//! Fixed-size object allocator for hot kernel types (address-space contexts,
//! range descriptors, ...). Two layers:
//!
//! ```text
//!   allocate(cpu) ──► per-CPU magazine ──► depot ──► slab lists ──► backing
//!                     (lock-light fast     (full /    (full /
//!                      path, LIFO)         empty      partial /
//!                                          magazines) free slabs)
//! ```
//!
//! - **Slab layer**: objects are carved out of power-of-two blocks obtained
//!   from a [`SlabBacking`]. Each block starts with a small header and a
//!   threaded free list; `free()` recovers the header by masking the object
//!   pointer down to the block boundary, so no per-object metadata exists.
//! - **Magazine layer**: each CPU holds up to two magazines (loaded and
//!   previous) of recently freed objects. The common allocate/free touches
//!   only that CPU's lock. When both run dry or fill up, whole magazines are
//!   exchanged with the shared depot in O(1).
//!
//! Empty slabs are retained up to [`SLAB_MAX_FREE`] per cache before their
//! blocks go back to the backing.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::alloc::Layout;
use core::ptr::NonNull;

mod cache;
mod magazine;

pub use cache::{SlabCache, SlabStats};
pub use magazine::MAGAZINE_ROUNDS;

/// Empty slabs kept around per cache before blocks return to the backing.
pub const SLAB_MAX_FREE: usize = 2;

/// Source of the raw blocks slabs and magazines are carved from.
///
/// In the kernel proper this is a thin shim over the virtual memory manager;
/// hosted tests plug in [`HeapBacking`].
pub trait SlabBacking: Send + Sync {
    /// Allocate `size` bytes at `align` alignment, or `None` when exhausted.
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a block previously handed out by [`SlabBacking::allocate`].
    ///
    /// # Safety
    /// `ptr`, `size` and `align` must match a prior `allocate` exactly, and
    /// the block must no longer be referenced.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// [`SlabBacking`] over the global heap, for hosted use.
#[derive(Default)]
pub struct HeapBacking;

impl SlabBacking for HeapBacking {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        // Safety: layout is non-zero; slab sizes are at least a page.
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        // Safety: matches the layout used in `allocate`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, align);
            alloc::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SlabError {
    #[error("slab cache '{cache}' could not grow: backing exhausted")]
    OutOfMemory { cache: &'static str },
}
