//! In-memory stand-in for physical RAM so the paging code runs in hosted
//! tests. Enabled for this crate's own tests and for dependents via the
//! `testing` feature.

use core::cell::UnsafeCell;
use core::mem;

use alloc::vec::Vec;
use kernel_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_pmm::PhysicalRegion;

use crate::PhysMapper;

/// One fake frame, aligned like the real thing.
#[repr(align(4096))]
pub struct Aligned4K(pub [u8; PAGE_SIZE as usize]);

/// A contiguous run of fake physical frames starting at
/// [`ArenaPhys::DEFAULT_BASE`]. Translation is a bounds-checked index.
pub struct ArenaPhys {
    base: u64,
    frames: UnsafeCell<Vec<Aligned4K>>,
}

// Safety: tests serialize frame access through the allocator and VMM locks,
// mirroring how the kernel serializes page-table access.
unsafe impl Sync for ArenaPhys {}

impl ArenaPhys {
    /// Bottom of the PMM's default zone, so a PMM seeded from
    /// [`ArenaPhys::regions`] serves `Zone::Default` allocations.
    pub const DEFAULT_BASE: u64 = 0x100_0000;

    #[must_use]
    pub fn new(frames: usize) -> Self {
        let mut storage = Vec::with_capacity(frames);
        for _ in 0..frames {
            storage.push(Aligned4K([0; PAGE_SIZE as usize]));
        }
        Self {
            base: Self::DEFAULT_BASE,
            frames: UnsafeCell::new(storage),
        }
    }

    /// The memory-map entry describing this arena, for seeding a PMM over
    /// the same range.
    #[must_use]
    pub fn regions(&self) -> [PhysicalRegion; 1] {
        // Safety: construction-time data; the length never changes.
        let len = unsafe { (*self.frames.get()).len() } as u64;
        [PhysicalRegion::available(
            self.base,
            self.base + len * PAGE_SIZE,
        )]
    }
}

impl PhysMapper for ArenaPhys {
    unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T {
        assert!(
            phys.as_u64() >= self.base,
            "arena: {phys} below the tracked range"
        );
        let offset = phys.as_u64() - self.base;
        let idx = (offset / PAGE_SIZE) as usize;
        let in_page = (offset % PAGE_SIZE) as usize;

        // Safety: the Vec itself is never resized after construction; only
        // frame contents are handed out.
        let frames = unsafe { &mut *self.frames.get() };
        assert!(idx < frames.len(), "arena: {phys} beyond the tracked range");
        assert!(
            in_page + mem::size_of::<T>() <= PAGE_SIZE as usize,
            "arena: access at {phys} crosses a frame boundary"
        );

        // Safety: in-bounds, and Aligned4K guarantees page alignment, so
        // any T no more aligned than a page fits.
        unsafe {
            let ptr = frames[idx].0.as_mut_ptr().add(in_page).cast::<T>();
            assert!(ptr.cast::<u8>() as usize % mem::align_of::<T>() == 0);
            &mut *ptr
        }
    }
}
