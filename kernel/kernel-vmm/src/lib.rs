//! # Virtual Memory Manager
//!
//! The portable core of the memory subsystem. It owns the *policy* of
//! virtual memory: which parts of each address space are reserved, how
//! pages get backed (eagerly, on fault, from a file provider), how address
//! spaces are cloned, and what a page fault means. The *mechanism* lives
//! behind the [`MmuBackend`] seam in `kernel-mmu`.
//!
//! ```text
//!   ┌────────────────────────── Vmm ──────────────────────────┐
//!   │ kernel Space            user contexts (slab allocated)  │
//!   │ ┌─────────────┐         ┌──────────────┐ ┌───────────┐  │
//!   │ │ RangeSet    │         │ Space + dir  │ │ Space+dir │  │
//!   │ │ (SpinLock)  │         │ (SpinLock)   │ │ ...       │  │
//!   │ └─────────────┘         └──────────────┘ └───────────┘  │
//!   └───────────────┬─────────────────────────────────────────┘
//!                   ▼
//!            MmuBackend (map / unmap / walk / load)
//! ```
//!
//! ## Address spaces
//! Kernel reservations live in one global [`Space`] shared by every
//! directory (the backend shares the kernel half of the translation tree).
//! Each user context carries its own private [`Space`]. An address at or
//! above the kernel-space floor always resolves to the kernel space; below
//! it, to the CPU's current context.
//!
//! ## Concurrency
//! One exclusive lock per space serializes every operation touching its
//! reservations, fault resolution included. Page-table mutation happens
//! only while holding the owning space's lock, which is what makes the
//! lock-free backend sound.
//!
//! ## Faults
//! Kernel space is always eagerly backed, so kernel-address faults are
//! never resolvable. User faults demand-allocate (zeroed or provider
//! filled), detect spurious faults against the live entry, and break
//! copy-on-write sharing on write.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod clone;
mod context;
mod error;
mod fault;
mod range;
mod special;

pub use clone::CloneMode;
pub use context::{ContextHandle, Processor, Space, VmmContext};
pub use error::VmmError;
pub use fault::FaultResolution;
pub use range::{FileBacking, MemoryRange, PageProvider, RangeSet, VmFlags};

use kernel_addresses::{PAGE_SIZE, VirtualAddress, align_down, align_up};
use kernel_info::memory::KERNEL_SPACE_START;
use kernel_mmu::{Access, Directory, MmuBackend, PageFlags, Privilege};
use kernel_pmm::{Pmm, Zone};
use kernel_slab::SlabCache;

/// What to do when an unmap request does not exactly match a reservation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnmapPolicy {
    /// Treat it as corrupted bookkeeping and panic. The default.
    Fatal,
    /// Carve the requested interval out of its reservation, keeping the
    /// remainders mapped.
    Split,
}

/// The virtual memory manager.
pub struct Vmm<'a, B: MmuBackend> {
    pub(crate) backend: &'a B,
    pub(crate) pmm: &'a Pmm,
    kernel_space: Space,
    pub(crate) contexts: SlabCache<VmmContext>,
    unmap_policy: UnmapPolicy,
    pub(crate) clone_mode: CloneMode,
}

impl<'a, B: MmuBackend> Vmm<'a, B> {
    /// Default policies: fatal unmap mismatches, copy-on-write clones.
    #[must_use]
    pub fn new(backend: &'a B, pmm: &'a Pmm, cpus: usize) -> Self {
        Self::with_policies(backend, pmm, cpus, UnmapPolicy::Fatal, CloneMode::CopyOnWrite)
    }

    #[must_use]
    pub fn with_policies(
        backend: &'a B,
        pmm: &'a Pmm,
        cpus: usize,
        unmap_policy: UnmapPolicy,
        clone_mode: CloneMode,
    ) -> Self {
        Self {
            backend,
            pmm,
            kernel_space: Space::new(
                KERNEL_SPACE_START,
                kernel_info::memory::KERNEL_SPACE_END,
            ),
            contexts: SlabCache::new("vmm-context", cpus),
            unmap_policy,
            clone_mode,
        }
    }

    /// The space responsible for `addr`, plus the directory to mutate for
    /// it. `None` when `addr` is a user address and no context is current.
    pub(crate) fn target_for<'s>(
        &'s self,
        proc: &'s Processor,
        addr: u64,
    ) -> Option<(&'s Space, Directory)> {
        if addr >= KERNEL_SPACE_START {
            Some((&self.kernel_space, self.backend.kernel_directory()))
        } else {
            proc.current_ctx().map(|ctx| (&ctx.space, ctx.dir))
        }
    }

    /// Reserve (and possibly back) an anonymous mapping. See
    /// [`Vmm::map_with`].
    pub fn map(
        &self,
        proc: &Processor,
        hint: VirtualAddress,
        size: u64,
        vm_flags: VmFlags,
        protection: PageFlags,
    ) -> Result<VirtualAddress, VmmError> {
        self.map_with(proc, hint, size, vm_flags, protection, None)
    }

    /// Reserve a mapping of `size` bytes at or after `hint`.
    ///
    /// - A null hint without [`VmFlags::EXACT`] means "anywhere in kernel
    ///   space".
    /// - With [`VmFlags::EXACT`], anything but the hint itself is
    ///   [`VmmError::ExactUnavailable`] and nothing changes.
    /// - Kernel-space mappings and [`VmFlags::EAGER`] are backed with
    ///   zeroed frames immediately; other mappings are backed on first
    ///   fault.
    pub fn map_with(
        &self,
        proc: &Processor,
        hint: VirtualAddress,
        size: u64,
        vm_flags: VmFlags,
        protection: PageFlags,
        file: Option<FileBacking>,
    ) -> Result<VirtualAddress, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidRange);
        }
        let size = align_up(size, PAGE_SIZE);
        let mut hint_addr = align_down(hint.as_u64(), PAGE_SIZE);
        if hint_addr == 0 && !vm_flags.contains(VmFlags::EXACT) {
            hint_addr = KERNEL_SPACE_START;
        }

        let mut vm_flags = vm_flags;
        if file.is_some() {
            vm_flags |= VmFlags::FILE;
        }

        let (space, dir) = self.target_for(proc, hint_addr).ok_or(VmmError::NoSpace)?;
        let is_kernel = hint_addr >= KERNEL_SPACE_START;

        let mut ranges = space.lock();
        let base = ranges
            .find_free(hint_addr, size)
            .ok_or(VmmError::NoVirtualSpace(size))?;
        if vm_flags.contains(VmFlags::EXACT) && base != hint_addr {
            log::warn!("vmm: exact mapping at {hint_addr:#x} unavailable");
            return Err(VmmError::ExactUnavailable);
        }

        ranges.insert(MemoryRange {
            start: base,
            end: base + size,
            vm_flags,
            protection,
            file,
        });

        let eager = (is_kernel || vm_flags.contains(VmFlags::EAGER))
            && !vm_flags.contains(VmFlags::DEVICE);
        if eager {
            if let Err(err) = self.back_range(Some(dir), base, size, protection) {
                ranges.remove_exact(base, base + size);
                return Err(err);
            }
        }

        log::trace!("vmm: mapped {base:#x}..{:#x} {vm_flags:?}", base + size);
        Ok(VirtualAddress::new(base))
    }

    /// Back `[base, base + size)` with zeroed frames, unwinding on failure.
    fn back_range(
        &self,
        dir: Option<Directory>,
        base: u64,
        size: u64,
        protection: PageFlags,
    ) -> Result<(), VmmError> {
        let mut backed = base;
        while backed < base + size {
            if let Err(err) = self.back_page(dir, backed, protection) {
                for page in (base..backed).step_by(PAGE_SIZE as usize) {
                    let va = VirtualAddress::new(page);
                    if let Some(pa) = self.backend.physical_of(dir, va) {
                        self.backend.unmap(dir, va);
                        self.pmm.release(pa);
                    }
                }
                log::error!("vmm: failed to back {size:#x} bytes at {base:#x}");
                return Err(err);
            }
            backed += PAGE_SIZE;
        }
        Ok(())
    }

    fn back_page(
        &self,
        dir: Option<Directory>,
        page: u64,
        protection: PageFlags,
    ) -> Result<(), VmmError> {
        let pa = self.pmm.allocate_page(Zone::Default)?;
        self.backend
            .with_phys(pa, PAGE_SIZE as usize, |bytes| bytes.fill(0));
        if let Err(err) = self
            .backend
            .map(dir, VirtualAddress::new(page), pa, protection)
        {
            self.pmm.release(pa);
            return Err(err.into());
        }
        Ok(())
    }

    /// Release the reservation at `[addr, addr + size)` and every frame
    /// backing it.
    ///
    /// # Panics
    /// Under [`UnmapPolicy::Fatal`], if the interval does not exactly match
    /// a reservation. Under [`UnmapPolicy::Split`], only if it is not
    /// covered by one reservation at all.
    pub fn unmap(
        &self,
        proc: &Processor,
        addr: VirtualAddress,
        size: u64,
    ) -> Result<(), VmmError> {
        let base = align_down(addr.as_u64(), PAGE_SIZE);
        let size = align_up(size, PAGE_SIZE);
        let end = base.checked_add(size).ok_or(VmmError::InvalidRange)?;
        let (space, dir) = self.target_for(proc, base).ok_or(VmmError::NoSpace)?;
        let dir = Some(dir);

        let mut ranges = space.lock();
        let range = ranges.remove_exact(base, end).unwrap_or_else(|| {
            match self.unmap_policy {
                UnmapPolicy::Fatal => {
                    panic!("vmm: unmap {base:#x}..{end:#x} does not match a reservation")
                }
                UnmapPolicy::Split => ranges.split_remove(base, end).unwrap_or_else(|| {
                    panic!("vmm: unmap {base:#x}..{end:#x} covers unreserved space")
                }),
            }
        });

        for page in range.pages() {
            let va = VirtualAddress::new(page);
            if !self.backend.read_flags(dir, va).contains(PageFlags::PRESENT) {
                continue;
            }
            if let Some(pa) = self.backend.physical_of(dir, va) {
                self.backend.unmap(dir, va);
                if !range.vm_flags.contains(VmFlags::DEVICE) {
                    self.pmm.release(pa);
                }
            }
        }
        self.backend
            .invalidate_range(dir, VirtualAddress::new(base), size);
        Ok(())
    }

    /// Make `target` the CPU's current context (`None` for the bare kernel
    /// context) and load its directory. A no-op when already current.
    pub fn switch(&self, proc: &Processor, target: Option<&ContextHandle>) {
        let next = target.map(|handle| handle.0);
        if proc.current.get() == next {
            return;
        }
        proc.current.set(next);
        let dir = target.map_or_else(|| self.backend.kernel_directory(), ContextHandle::directory);
        self.backend.load(dir);
    }

    /// Check whether `[addr, addr + size)` is reserved with permissions
    /// compatible with `access` at `privilege`. Judged against the
    /// reservations, not the live page tables, so unfaulted lazy pages
    /// validate successfully. Fails closed.
    #[must_use]
    pub fn validate(
        &self,
        proc: &Processor,
        addr: VirtualAddress,
        size: u64,
        access: Access,
        privilege: Privilege,
    ) -> bool {
        if size == 0 {
            return true;
        }
        let start = align_down(addr.as_u64(), PAGE_SIZE);
        let Some(end) = addr.as_u64().checked_add(size) else {
            return false;
        };
        let Some((space, _)) = self.target_for(proc, start) else {
            return false;
        };
        if end > space.end() {
            return false;
        }

        let ranges = space.lock();
        let mut page = start;
        while page < end {
            let Some(range) = ranges.find_containing(page) else {
                return false;
            };
            if privilege == Privilege::User && !range.protection.contains(PageFlags::USER) {
                return false;
            }
            if access.contains(Access::WRITE) && !range.protection.contains(PageFlags::WRITABLE) {
                return false;
            }
            if access.contains(Access::EXECUTE) && range.protection.contains(PageFlags::NO_EXECUTE)
            {
                return false;
            }
            page = range.end.min(end).max(page + PAGE_SIZE);
        }
        true
    }

    /// Log every reservation of the kernel space and of the current
    /// context, if any.
    pub fn dump(&self, proc: &Processor) {
        let ranges = self.kernel_space.lock();
        log::debug!("vmm: kernel space ({} ranges)", ranges.len());
        for range in ranges.iter() {
            log::debug!(
                "vmm:   {:#014x}..{:#014x} {:?} {:?}",
                range.start,
                range.end,
                range.vm_flags,
                range.protection
            );
        }
        drop(ranges);

        if let Some((space, _)) = self.target_for(proc, 0) {
            let ranges = space.lock();
            log::debug!("vmm: user space ({} ranges)", ranges.len());
            for range in ranges.iter() {
                log::debug!(
                    "vmm:   {:#014x}..{:#014x} {:?} {:?}",
                    range.start,
                    range.end,
                    range.vm_flags,
                    range.protection
                );
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;

    #[test]
    fn kernel_mapping_is_eagerly_backed_and_round_trips() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        // Warm-up cycle so page-table frames for this region exist.
        let va = vmm
            .map(&cpu, VirtualAddress::NULL, PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        vmm.unmap(&cpu, va, PAGE_SIZE).unwrap();
        let baseline = pmm.stats().used_frames;

        let va = vmm
            .map(
                &cpu,
                VirtualAddress::NULL,
                3 * PAGE_SIZE,
                VmFlags::empty(),
                PageFlags::kernel_data(),
            )
            .unwrap();
        assert!(va.as_u64() >= KERNEL_SPACE_START);
        for i in 0..3 {
            let flags = mmu.read_flags(None, va + i * PAGE_SIZE);
            assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE));
        }
        assert_eq!(pmm.stats().used_frames, baseline + 3);

        vmm.unmap(&cpu, va, 3 * PAGE_SIZE).unwrap();
        assert_eq!(mmu.read_flags(None, va), PageFlags::empty());
        assert_eq!(pmm.stats().used_frames, baseline);
    }

    #[test]
    fn mappings_do_not_overlap() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let mut spans = Vec::new();
        for pages in [1u64, 4, 2, 8, 1] {
            let va = vmm
                .map(
                    &cpu,
                    VirtualAddress::NULL,
                    pages * PAGE_SIZE,
                    VmFlags::empty(),
                    PageFlags::kernel_data(),
                )
                .unwrap();
            spans.push((va.as_u64(), va.as_u64() + pages * PAGE_SIZE));
        }
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                assert!(a.1 <= b.0 || b.1 <= a.0, "{a:x?} overlaps {b:x?}");
            }
        }
        for (start, end) in spans {
            vmm.unmap(&cpu, VirtualAddress::new(start), end - start).unwrap();
        }
    }

    #[test]
    fn exact_conflict_fails_without_side_effects() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let hint = VirtualAddress::new(KERNEL_SPACE_START + 0x10_0000);
        let va = vmm
            .map(&cpu, hint, 2 * PAGE_SIZE, VmFlags::EXACT, PageFlags::kernel_data())
            .unwrap();
        assert_eq!(va, hint);
        let frames = pmm.stats().used_frames;

        // Overlapping exact request must fail and change nothing.
        let second = vmm.map(
            &cpu,
            hint + PAGE_SIZE,
            2 * PAGE_SIZE,
            VmFlags::EXACT,
            PageFlags::kernel_data(),
        );
        assert!(matches!(second, Err(VmmError::ExactUnavailable)));
        assert_eq!(pmm.stats().used_frames, frames);

        vmm.unmap(&cpu, va, 2 * PAGE_SIZE).unwrap();
    }

    #[test]
    fn freed_virtual_space_is_reused_first_fit() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let a = vmm
            .map(&cpu, VirtualAddress::NULL, 4 * PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        let b = vmm
            .map(&cpu, VirtualAddress::NULL, 4 * PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        assert!(b > a);

        vmm.unmap(&cpu, a, 4 * PAGE_SIZE).unwrap();
        let c = vmm
            .map(&cpu, VirtualAddress::NULL, 4 * PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        assert_eq!(c, a);

        vmm.unmap(&cpu, b, 4 * PAGE_SIZE).unwrap();
        vmm.unmap(&cpu, c, 4 * PAGE_SIZE).unwrap();
    }

    #[test]
    #[should_panic(expected = "does not match a reservation")]
    fn partial_unmap_is_fatal_by_default() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let va = vmm
            .map(&cpu, VirtualAddress::NULL, 4 * PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        let _ = vmm.unmap(&cpu, va + PAGE_SIZE, 2 * PAGE_SIZE);
    }

    #[test]
    fn split_policy_carves_the_middle_out() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::with_policies(mmu, pmm, 1, UnmapPolicy::Split, CloneMode::CopyOnWrite);
        let cpu = Processor::new(0);

        // Warm-up cycle so page-table frames for this region exist.
        let va = vmm
            .map(&cpu, VirtualAddress::NULL, PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        vmm.unmap(&cpu, va, PAGE_SIZE).unwrap();
        let baseline = pmm.stats().used_frames;

        let va = vmm
            .map(&cpu, VirtualAddress::NULL, 4 * PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        vmm.unmap(&cpu, va + PAGE_SIZE, 2 * PAGE_SIZE).unwrap();

        // Outer pages stay mapped, the carved middle is gone.
        assert!(mmu.read_flags(None, va).contains(PageFlags::PRESENT));
        assert_eq!(mmu.read_flags(None, va + PAGE_SIZE), PageFlags::empty());
        assert_eq!(mmu.read_flags(None, va + 2 * PAGE_SIZE), PageFlags::empty());
        assert!(mmu
            .read_flags(None, va + 3 * PAGE_SIZE)
            .contains(PageFlags::PRESENT));

        vmm.unmap(&cpu, va, PAGE_SIZE).unwrap();
        vmm.unmap(&cpu, va + 3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(pmm.stats().used_frames, baseline);
    }

    #[test]
    fn validate_judges_reservations_not_page_tables() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let ctx = vmm.create_context(&cpu).unwrap();
        vmm.switch(&cpu, Some(&ctx));

        let va = vmm
            .map(
                &cpu,
                VirtualAddress::new(0x40_0000),
                2 * PAGE_SIZE,
                VmFlags::EXACT,
                PageFlags::user_data(),
            )
            .unwrap();

        // Lazy, unfaulted pages still validate.
        assert!(vmm.validate(&cpu, va, 2 * PAGE_SIZE, Access::empty(), Privilege::User));
        assert!(vmm.validate(&cpu, va, 2 * PAGE_SIZE, Access::WRITE, Privilege::User));
        // Execution is forbidden by the protection.
        assert!(!vmm.validate(&cpu, va, PAGE_SIZE, Access::EXECUTE, Privilege::User));
        // Reaching past the reservation fails.
        assert!(!vmm.validate(&cpu, va, 3 * PAGE_SIZE, Access::empty(), Privilege::User));
        // Unreserved space fails.
        assert!(!vmm.validate(
            &cpu,
            VirtualAddress::new(0x100_0000),
            PAGE_SIZE,
            Access::empty(),
            Privilege::User
        ));

        vmm.destroy_context(&cpu, ctx);
    }

    #[test]
    fn validate_rejects_user_access_to_kernel_ranges() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let va = vmm
            .map(&cpu, VirtualAddress::NULL, PAGE_SIZE, VmFlags::empty(), PageFlags::kernel_data())
            .unwrap();
        assert!(vmm.validate(&cpu, va, PAGE_SIZE, Access::WRITE, Privilege::Kernel));
        assert!(!vmm.validate(&cpu, va, PAGE_SIZE, Access::empty(), Privilege::User));
        vmm.unmap(&cpu, va, PAGE_SIZE).unwrap();
    }

    #[test]
    fn switch_loads_the_target_directory() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let ctx = vmm.create_context(&cpu).unwrap();
        vmm.switch(&cpu, Some(&ctx));
        assert_eq!(mmu.current(), ctx.directory());

        vmm.switch(&cpu, None);
        assert_eq!(mmu.current(), mmu.kernel_directory());

        vmm.destroy_context(&cpu, ctx);
    }

    #[test]
    fn destroying_a_context_returns_every_frame() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);
        let baseline = pmm.stats().used_frames;

        let ctx = vmm.create_context(&cpu).unwrap();
        vmm.switch(&cpu, Some(&ctx));
        let va = vmm
            .map(
                &cpu,
                VirtualAddress::new(0x40_0000),
                4 * PAGE_SIZE,
                VmFlags::EXACT | VmFlags::EAGER,
                PageFlags::user_data(),
            )
            .unwrap();
        assert!(mmu.read_flags(None, va).contains(PageFlags::PRESENT));

        vmm.destroy_context(&cpu, ctx);
        assert_eq!(pmm.stats().used_frames, baseline);
        assert!(cpu.current.get().is_none());
    }
}
