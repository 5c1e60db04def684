//! 4-level paged [`MmuBackend`] implementation.
//!
//! Translation tree for 48-bit virtual addresses and 4 KiB pages:
//!
//! ```text
//!   va[47:39] ─► root (L4) ─► va[38:30] ─► L3 ─► va[29:21] ─► L2
//!                                               va[20:12] ─► L1 ─► frame
//! ```
//!
//! Table frames come from the PMM; the bytes of a frame are reached through
//! the [`PhysMapper`], never by dereferencing physical addresses directly.
//! The kernel half of the root (entries 256..512) is shared between all
//! directories by copying root entries, and the root slots covering kernel
//! space are populated up front so mappings made after a directory was
//! cloned still appear everywhere.

use core::sync::atomic::{AtomicU64, Ordering};

use kernel_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_info::memory::{HHDM_BASE, KERNEL_SPACE_END, KERNEL_SPACE_START, USERSPACE_END};
use kernel_pmm::{Pmm, Zone};

use crate::entry::{PageEntry, PageTable, TABLE_ENTRIES};
use crate::{Directory, MmuBackend, MmuError, PageFlags, PhysMapper, RemapPolicy};

const LEVELS: usize = 4;

/// Root entries at and above this index map the kernel half.
const KERNEL_HALF_START: usize = 256;

const fn table_index(va: u64, level: usize) -> usize {
    ((va >> (12 + 9 * level)) & 0x1ff) as usize
}

/// The generic paged MMU. `M` decides how table frames are addressed.
pub struct PagedMmu<'p, M: PhysMapper> {
    mapper: M,
    pmm: &'p Pmm,
    kernel_root: Directory,
    /// Root frame address of the active directory.
    active: AtomicU64,
}

impl<'p, M: PhysMapper> PagedMmu<'p, M> {
    /// Build the boot directory. The root slots covering
    /// `KERNEL_SPACE_START..KERNEL_SPACE_END` are populated immediately so
    /// every later directory shares their second-level tables.
    pub fn new(mapper: M, pmm: &'p Pmm) -> Result<Self, MmuError> {
        let root = Self::allocate_table_with(&mapper, pmm)?;
        let mmu = Self {
            mapper,
            pmm,
            kernel_root: Directory::new(root),
            active: AtomicU64::new(root.as_u64()),
        };

        let first = table_index(KERNEL_SPACE_START, LEVELS - 1);
        let last = table_index(KERNEL_SPACE_END - 1, LEVELS - 1);
        for idx in first..=last {
            let frame = mmu.allocate_table()?;
            // Safety: the root frame was just allocated and is ours.
            let table: &mut PageTable = unsafe { mmu.mapper.phys_to_mut(root) };
            table.entries[idx] = PageEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_frame(frame.as_u64() >> 12);
        }
        log::debug!("mmu: kernel root at {root}");
        Ok(mmu)
    }

    fn allocate_table_with(mapper: &M, pmm: &Pmm) -> Result<PhysicalAddress, MmuError> {
        let frame = pmm.allocate_page(Zone::Default)?;
        // Safety: freshly allocated, page sized and page aligned.
        unsafe { *mapper.phys_to_mut::<PageTable>(frame) = PageTable::ZERO };
        Ok(frame)
    }

    fn allocate_table(&self) -> Result<PhysicalAddress, MmuError> {
        Self::allocate_table_with(&self.mapper, self.pmm)
    }

    fn resolve(&self, dir: Option<Directory>) -> Directory {
        dir.unwrap_or_else(|| Directory::new(PhysicalAddress::new(self.active.load(Ordering::Acquire))))
    }

    /// Walk to the leaf (L1) table for `va`, creating intermediate tables
    /// as needed. Intermediates get the user bit for user-half addresses.
    fn leaf_table_create(
        &self,
        dir: Option<Directory>,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, MmuError> {
        let user = va.as_u64() < USERSPACE_END;
        let mut table_pa = self.resolve(dir).address();
        for level in (1..LEVELS).rev() {
            // Safety: table frames are live for the directory's lifetime;
            // callers serialize mutation per address space.
            let table: &mut PageTable = unsafe { self.mapper.phys_to_mut(table_pa) };
            let idx = table_index(va.as_u64(), level);
            let entry = table.entries[idx];
            table_pa = if entry.present() {
                entry.address()
            } else {
                let frame = self.allocate_table()?;
                table.entries[idx] = PageEntry::new()
                    .with_present(true)
                    .with_writable(true)
                    .with_user(user)
                    .with_frame(frame.as_u64() >> 12);
                frame
            };
        }
        Ok(table_pa)
    }

    /// Walk to the leaf table for `va` without creating anything.
    fn leaf_table_lookup(
        &self,
        dir: Option<Directory>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let mut table_pa = self.resolve(dir).address();
        for level in (1..LEVELS).rev() {
            // Safety: see `leaf_table_create`.
            let table: &PageTable = unsafe { self.mapper.phys_to_mut(table_pa) };
            let entry = table.entries[table_index(va.as_u64(), level)];
            if !entry.present() {
                return None;
            }
            table_pa = entry.address();
        }
        Some(table_pa)
    }

    fn leaf_entry(&self, dir: Option<Directory>, va: VirtualAddress) -> Option<PageEntry> {
        let leaf = self.leaf_table_lookup(dir, va)?;
        // Safety: see `leaf_table_create`.
        let table: &PageTable = unsafe { self.mapper.phys_to_mut(leaf) };
        let entry = table.entries[table_index(va.as_u64(), 0)];
        entry.present().then_some(entry)
    }
}

impl<M: PhysMapper> MmuBackend for PagedMmu<'_, M> {
    fn new_directory(&self) -> Result<Directory, MmuError> {
        let root = self.allocate_table()?;
        Ok(Directory::new(root))
    }

    fn destroy_directory(&self, dir: Directory) {
        debug_assert_ne!(dir, self.kernel_root, "destroying the kernel directory");
        // Safety: the directory is dead by contract; no walk races this.
        unsafe {
            let root: &PageTable = self.mapper.phys_to_mut(dir.address());
            for e3 in &root.entries[..KERNEL_HALF_START] {
                if !e3.present() {
                    continue;
                }
                let l3: &PageTable = self.mapper.phys_to_mut(e3.address());
                for e2 in &l3.entries {
                    if !e2.present() {
                        continue;
                    }
                    let l2: &PageTable = self.mapper.phys_to_mut(e2.address());
                    for e1 in &l2.entries {
                        // Leaf *table* frames; the data frames they point at
                        // belong to the VMM.
                        if e1.present() {
                            self.pmm.free_page(e1.address());
                        }
                    }
                    self.pmm.free_page(e2.address());
                }
                self.pmm.free_page(e3.address());
            }
        }
        self.pmm.free_page(dir.address());
    }

    fn copy_kernel_mappings(&self, dir: Directory) {
        // Safety: source and destination roots are distinct live frames.
        unsafe {
            let src: &PageTable = self.mapper.phys_to_mut(self.kernel_root.address());
            let dst: &mut PageTable = self.mapper.phys_to_mut(dir.address());
            dst.entries[KERNEL_HALF_START..].copy_from_slice(&src.entries[KERNEL_HALF_START..]);
        }
    }

    fn map(
        &self,
        dir: Option<Directory>,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MmuError> {
        let leaf = self.leaf_table_create(dir, virt)?;
        // Safety: see `leaf_table_create`.
        let table: &mut PageTable = unsafe { self.mapper.phys_to_mut(leaf) };
        table.entries[table_index(virt.as_u64(), 0)] =
            PageEntry::from_parts(phys, flags | PageFlags::PRESENT);
        log::trace!("mmu: map {virt} -> {phys} {flags:?}");
        Ok(())
    }

    fn unmap(&self, dir: Option<Directory>, virt: VirtualAddress) {
        if let Some(leaf) = self.leaf_table_lookup(dir, virt) {
            // Safety: see `leaf_table_create`.
            let table: &mut PageTable = unsafe { self.mapper.phys_to_mut(leaf) };
            table.entries[table_index(virt.as_u64(), 0)] = PageEntry::new();
            log::trace!("mmu: unmap {virt}");
        }
    }

    fn read_flags(&self, dir: Option<Directory>, virt: VirtualAddress) -> PageFlags {
        self.leaf_entry(dir, virt)
            .map_or_else(PageFlags::empty, PageEntry::protection)
    }

    fn physical_of(
        &self,
        dir: Option<Directory>,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        self.leaf_entry(dir, virt).map(PageEntry::address)
    }

    fn invalidate_range(&self, _dir: Option<Directory>, virt: VirtualAddress, len: u64) {
        // Hardware backends shoot down the TLB here; the hosted walk reads
        // the tables directly and has nothing to invalidate.
        log::trace!("mmu: invalidate {virt}+{len:#x}");
    }

    fn load(&self, dir: Directory) {
        self.active.store(dir.address().as_u64(), Ordering::Release);
        log::trace!("mmu: switch to directory {}", dir.address());
    }

    fn current(&self) -> Directory {
        Directory::new(PhysicalAddress::new(self.active.load(Ordering::Acquire)))
    }

    fn kernel_directory(&self) -> Directory {
        self.kernel_root
    }

    fn remap_physical(
        &self,
        phys: PhysicalAddress,
        _len: u64,
        _policy: RemapPolicy,
    ) -> VirtualAddress {
        // All of physical memory sits inside the direct map.
        VirtualAddress::new(HHDM_BASE + phys.as_u64())
    }

    fn unmap_physical(&self, _virt: VirtualAddress, _len: u64) {
        // The direct map is permanent.
    }

    fn with_phys<R>(
        &self,
        phys: PhysicalAddress,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        debug_assert!(
            len as u64 <= PAGE_SIZE - phys.page_offset(),
            "with_phys crosses a page boundary"
        );
        // Safety: the frame is backed (PMM-owned) and byte access needs no
        // particular alignment; exclusivity comes from the caller's locks.
        let first: &mut u8 = unsafe { self.mapper.phys_to_mut(phys) };
        let bytes = unsafe { core::slice::from_raw_parts_mut(core::ptr::from_mut(first), len) };
        f(bytes)
    }
}
