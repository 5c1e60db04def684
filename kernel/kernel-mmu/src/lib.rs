//! # MMU Abstraction
//!
//! The seam between the portable virtual memory manager and the paging
//! hardware. The VMM only ever talks to a [`MmuBackend`]; the backend owns
//! page-table layout, TLB shootdown and the physical-window mechanism.
//!
//! ```text
//!   kernel-vmm ──► MmuBackend (trait) ──► PagedMmu<M: PhysMapper>
//!                                          │
//!                                          └─► PhysMapper: how to touch a
//!                                              physical frame (direct map
//!                                              on hardware, an in-memory
//!                                              arena in hosted tests)
//! ```
//!
//! [`PagedMmu`] implements the backend over a classic 4-level, 48-bit,
//! 4 KiB-page radix tree. It is portable in the sense that it never executes
//! privileged instructions; everything goes through the [`PhysMapper`], so
//! the exact same walk runs in hosted tests and on the metal.
//!
//! Callers serialize access per address space; the backend itself takes no
//! locks and assumes a mapping is not mutated concurrently with a walk of
//! the same directory.

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

mod entry;
mod flags;
mod paged;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use entry::{PageEntry, PageTable, TABLE_ENTRIES};
pub use flags::{Access, FaultInfo, PageFlags, Privilege};
pub use paged::PagedMmu;

use kernel_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::PmmError;

#[derive(Debug, thiserror::Error)]
pub enum MmuError {
    #[error("out of physical memory for page tables: {0}")]
    OutOfMemory(#[from] PmmError),
}

/// Opaque handle to a top-level page directory (the root of one address
/// space's translation tree).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Directory(PhysicalAddress);

impl Directory {
    #[must_use]
    pub const fn new(root: PhysicalAddress) -> Self {
        Self(root)
    }

    /// Physical address of the root table frame.
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        self.0
    }
}

/// Lifetime of a physical-window mapping created by
/// [`MmuBackend::remap_physical`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RemapPolicy {
    /// Short-lived; the caller promises a prompt
    /// [`MmuBackend::unmap_physical`].
    Temporary,
    /// Stays mapped until explicitly torn down.
    Permanent,
}

/// How to reach the bytes of a physical frame from kernel code.
pub trait PhysMapper {
    /// Interpret the memory at `phys` as a `T`.
    ///
    /// # Safety
    /// The caller must ensure `phys` is backed, suitably aligned for `T`,
    /// and that no conflicting references to the same frame exist for the
    /// duration of the returned borrow.
    unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T;
}

impl<M: PhysMapper> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T {
        // Safety: forwarded contract.
        unsafe { (*self).phys_to_mut(phys) }
    }
}

/// Architecture adapter the VMM drives. `dir: None` means the currently
/// loaded directory.
pub trait MmuBackend {
    /// Allocate and initialize an empty directory. Kernel mappings are NOT
    /// copied; see [`MmuBackend::copy_kernel_mappings`].
    fn new_directory(&self) -> Result<Directory, MmuError>;

    /// Free the user half of `dir`'s translation tree and the root frame.
    /// Leaf frames are owned by the VMM and are not touched.
    fn destroy_directory(&self, dir: Directory);

    /// Share the kernel half of the boot directory into `dir`. Top-level
    /// entries are copied, so kernel mappings made later are visible in
    /// every directory.
    fn copy_kernel_mappings(&self, dir: Directory);

    /// Install a translation for the page containing `virt`. `PRESENT` is
    /// implied. Intermediate tables are created on demand.
    fn map(
        &self,
        dir: Option<Directory>,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MmuError>;

    /// Drop the translation for the page containing `virt`, if any.
    fn unmap(&self, dir: Option<Directory>, virt: VirtualAddress);

    /// Flags of the live translation, or `PageFlags::empty()` when the page
    /// is not mapped.
    fn read_flags(&self, dir: Option<Directory>, virt: VirtualAddress) -> PageFlags;

    /// Physical frame backing `virt`, if mapped.
    fn physical_of(&self, dir: Option<Directory>, virt: VirtualAddress)
    -> Option<PhysicalAddress>;

    /// Invalidate cached translations for `[virt, virt + len)`.
    fn invalidate_range(&self, dir: Option<Directory>, virt: VirtualAddress, len: u64);

    /// Make `dir` the active address space.
    fn load(&self, dir: Directory);

    /// The active directory.
    fn current(&self) -> Directory;

    /// The kernel-only boot directory.
    fn kernel_directory(&self) -> Directory;

    /// A kernel virtual address through which `[phys, phys + len)` can be
    /// addressed.
    fn remap_physical(&self, phys: PhysicalAddress, len: u64, policy: RemapPolicy)
    -> VirtualAddress;

    /// Release a window obtained from [`MmuBackend::remap_physical`].
    fn unmap_physical(&self, virt: VirtualAddress, len: u64);

    /// Run `f` over `len` bytes of the frame at `phys`. Must not cross a
    /// page boundary.
    fn with_phys<R>(&self, phys: PhysicalAddress, len: usize, f: impl FnOnce(&mut [u8]) -> R)
    -> R;
}
