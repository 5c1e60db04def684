//! Page-fault resolution.
//!
//! The resolver decides, under the faulting space's lock, whether a fault
//! is demand paging, a spurious fault against an already-correct entry, a
//! copy-on-write break, or a genuine protection violation. It is
//! idempotent: resolving the same fault twice leaves the same mapping in
//! place and reports success both times.

use kernel_addresses::{PAGE_SIZE, VirtualAddress, align_down};
use kernel_info::memory::{KERNEL_SPACE_START, USERSPACE_END, USERSPACE_START};
use kernel_mmu::{Access, Directory, FaultInfo, MmuBackend, PageFlags, Privilege};
use kernel_pmm::Zone;

use crate::range::MemoryRange;
use crate::{Processor, VmFlags, Vmm};

/// Outcome of [`Vmm::fault`]. `Unresolved` means the caller (trap handler)
/// must treat the fault as a genuine violation: signal the process or
/// panic, depending on privilege.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultResolution {
    Resolved,
    Unresolved,
}

impl<B: MmuBackend> Vmm<'_, B> {
    /// Try to resolve a page fault on the current CPU.
    pub fn fault(&self, proc: &Processor, info: &FaultInfo) -> FaultResolution {
        let addr = info.address.as_u64();
        let page = align_down(addr, PAGE_SIZE);

        // Kernel space is eagerly backed; nothing there is resolvable.
        if addr >= KERNEL_SPACE_START {
            log::error!("vmm: fault on kernel address {addr:#x}");
            return FaultResolution::Unresolved;
        }
        if !(USERSPACE_START..USERSPACE_END).contains(&page) {
            log::debug!("vmm: fault outside the user window at {addr:#x}");
            return FaultResolution::Unresolved;
        }
        let Some(ctx) = proc.current_ctx() else {
            log::error!("vmm: user fault at {addr:#x} with no current context");
            return FaultResolution::Unresolved;
        };

        let ranges = ctx.space.lock();
        let Some(range) = ranges.find_containing(page) else {
            log::debug!("vmm: fault in unreserved space at {addr:#x}");
            return FaultResolution::Unresolved;
        };
        if !Self::access_permitted(range.protection, info) {
            log::debug!("vmm: fault at {addr:#x} violates the reservation");
            return FaultResolution::Unresolved;
        }

        let dir = Some(ctx.dir);
        let va = VirtualAddress::new(page);
        let live = self.backend.read_flags(dir, va);
        if live.contains(PageFlags::PRESENT) {
            self.resolve_present(dir, va, live, range, info)
        } else {
            self.demand_page(dir, va, range)
        }
    }

    fn access_permitted(protection: PageFlags, info: &FaultInfo) -> bool {
        if info.privilege == Privilege::User && !protection.contains(PageFlags::USER) {
            return false;
        }
        if info.access.contains(Access::WRITE) && !protection.contains(PageFlags::WRITABLE) {
            return false;
        }
        if info.access.contains(Access::EXECUTE) && protection.contains(PageFlags::NO_EXECUTE) {
            return false;
        }
        true
    }

    /// Allocate and fill a frame for a not-present page.
    fn demand_page(
        &self,
        dir: Option<Directory>,
        va: VirtualAddress,
        range: &MemoryRange,
    ) -> FaultResolution {
        let Ok(pa) = self.pmm.allocate_page(Zone::Default) else {
            log::error!("vmm: out of memory demand-paging {va}");
            return FaultResolution::Unresolved;
        };

        let filled = self.backend.with_phys(pa, PAGE_SIZE as usize, |bytes| {
            bytes.fill(0);
            match (&range.file, range.file_offset(va.as_u64())) {
                (Some(file), Some(offset)) => file.provider.fill_page(offset, bytes),
                _ => Ok(()),
            }
        });
        if let Err(err) = filled {
            log::error!("vmm: provider failed for {va}: {err}");
            self.pmm.release(pa);
            return FaultResolution::Unresolved;
        }

        if self.backend.map(dir, va, pa, range.protection).is_err() {
            self.pmm.release(pa);
            return FaultResolution::Unresolved;
        }
        log::trace!("vmm: demand-paged {va} -> {pa}");
        FaultResolution::Resolved
    }

    /// The page is mapped but faulted anyway: spurious (stale TLB), a
    /// copy-on-write break, or a real violation.
    fn resolve_present(
        &self,
        dir: Option<Directory>,
        va: VirtualAddress,
        live: PageFlags,
        range: &MemoryRange,
        info: &FaultInfo,
    ) -> FaultResolution {
        if Self::access_permitted(live, info) {
            // The live entry already allows this; the fault raced a
            // resolution on another CPU or stale TLB state.
            log::trace!("vmm: spurious fault at {va}");
            return FaultResolution::Resolved;
        }

        let cow_break = info.access.contains(Access::WRITE)
            && range.protection.contains(PageFlags::WRITABLE)
            && !live.contains(PageFlags::WRITABLE)
            && !range
                .vm_flags
                .intersects(VmFlags::SHARED | VmFlags::DEVICE);
        if !cow_break {
            log::debug!("vmm: protection violation at {va}");
            return FaultResolution::Unresolved;
        }

        let Some(pa) = self.backend.physical_of(dir, va) else {
            return FaultResolution::Unresolved;
        };

        if self.pmm.refcount(pa) == 1 {
            // Last sharer; take the frame writable in place.
            if self.backend.map(dir, va, pa, range.protection).is_err() {
                return FaultResolution::Unresolved;
            }
            self.backend.invalidate_range(dir, va, PAGE_SIZE);
            log::trace!("vmm: cow upgrade in place at {va}");
            return FaultResolution::Resolved;
        }

        let Ok(new) = self.pmm.allocate_page(Zone::Default) else {
            log::error!("vmm: out of memory breaking cow at {va}");
            return FaultResolution::Unresolved;
        };
        self.backend.with_phys(new, PAGE_SIZE as usize, |dst| {
            self.backend
                .with_phys(pa, PAGE_SIZE as usize, |src| dst.copy_from_slice(src));
        });
        if self.backend.map(dir, va, new, range.protection).is_err() {
            self.pmm.release(new);
            return FaultResolution::Unresolved;
        }
        self.pmm.release(pa);
        self.backend.invalidate_range(dir, va, PAGE_SIZE);
        log::trace!("vmm: cow copy at {va}: {pa} -> {new}");
        FaultResolution::Resolved
    }
}
