//! Address-space cloning.
//!
//! A clone gets a copy of every reservation and, per page, either a shared
//! frame (device and explicitly shared ranges), a copy-on-write alias
//! (the default for private ranges) or an eager copy. Copy-on-write
//! downgrades the parent's own mapping to read-only; the first write on
//! either side faults and is resolved in `fault.rs`.

use kernel_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mmu::{Directory, MmuBackend, PageFlags};
use kernel_pmm::Zone;

use crate::range::RangeSet;
use crate::{ContextHandle, Processor, VmFlags, Vmm, VmmError};

/// How private pages are treated when cloning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneMode {
    /// Share frames read-only and copy on the first write. The default.
    CopyOnWrite,
    /// Copy every present frame at clone time.
    EagerCopy,
}

impl<B: MmuBackend> Vmm<'_, B> {
    /// Clone `src` into a new context. On any failure the partially built
    /// child is destroyed and the parent is left consistent (already
    /// downgraded pages recover through the spurious-fault path).
    pub fn clone_context(
        &self,
        proc: &Processor,
        src: &ContextHandle,
    ) -> Result<ContextHandle, VmmError> {
        let src_ctx = src.get();
        let child = self.create_context(proc)?;

        let result = {
            let src_ranges = src_ctx.space.lock();
            {
                let mut child_ranges = child.get().space.lock();
                for range in src_ranges.iter() {
                    child_ranges.insert(range.clone());
                }
            }
            self.populate_clone(src_ctx.dir, child.get().dir, &src_ranges)
        };

        match result {
            Ok(()) => {
                log::debug!(
                    "vmm: cloned context {} -> {}",
                    src_ctx.dir.address(),
                    child.get().dir.address()
                );
                Ok(child)
            }
            Err(err) => {
                self.destroy_context(proc, child);
                Err(err)
            }
        }
    }

    fn populate_clone(
        &self,
        src_dir: Directory,
        child_dir: Directory,
        ranges: &RangeSet,
    ) -> Result<(), VmmError> {
        let src = Some(src_dir);
        let child = Some(child_dir);

        for range in ranges.iter() {
            let mut downgraded = false;
            for page in range.pages() {
                let va = VirtualAddress::new(page);
                let live = self.backend.read_flags(src, va);
                if !live.contains(PageFlags::PRESENT) {
                    continue;
                }
                let Some(pa) = self.backend.physical_of(src, va) else {
                    continue;
                };

                if range.vm_flags.contains(VmFlags::DEVICE) {
                    // Device frames are aliased; nobody owns them.
                    self.backend.map(child, va, pa, range.protection)?;
                } else if range.vm_flags.contains(VmFlags::SHARED) {
                    self.pmm.retain(pa);
                    if let Err(err) = self.backend.map(child, va, pa, range.protection) {
                        self.pmm.release(pa);
                        return Err(err.into());
                    }
                } else {
                    match self.clone_mode {
                        CloneMode::CopyOnWrite => {
                            let readonly = range.protection.difference(PageFlags::WRITABLE);
                            self.backend.map(src, va, pa, readonly)?;
                            downgraded = true;
                            self.pmm.retain(pa);
                            if let Err(err) = self.backend.map(child, va, pa, readonly) {
                                self.pmm.release(pa);
                                return Err(err.into());
                            }
                        }
                        CloneMode::EagerCopy => {
                            let new = self.pmm.allocate_page(Zone::Default)?;
                            self.backend.with_phys(new, PAGE_SIZE as usize, |dst| {
                                self.backend
                                    .with_phys(pa, PAGE_SIZE as usize, |s| dst.copy_from_slice(s));
                            });
                            if let Err(err) = self.backend.map(child, va, new, range.protection) {
                                self.pmm.release(new);
                                return Err(err.into());
                            }
                        }
                    }
                }
            }
            if downgraded {
                self.backend
                    .invalidate_range(src, VirtualAddress::new(range.start), range.size());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;
    use crate::{FaultResolution, UnmapPolicy};
    use kernel_mmu::{Access, FaultInfo, Privilege};

    fn write_fault(va: VirtualAddress) -> FaultInfo {
        FaultInfo {
            address: va,
            access: Access::WRITE,
            privilege: Privilege::User,
        }
    }

    const USER_BASE: u64 = 0x40_0000;

    /// Map, fault in and stamp two pages in a fresh context.
    fn populated_parent<B: MmuBackend>(
        vmm: &Vmm<'_, B>,
        cpu: &Processor,
    ) -> (ContextHandle, VirtualAddress) {
        let ctx = vmm.create_context(cpu).unwrap();
        vmm.switch(cpu, Some(&ctx));
        let va = vmm
            .map(
                cpu,
                VirtualAddress::new(USER_BASE),
                2 * PAGE_SIZE,
                VmFlags::EXACT,
                PageFlags::user_data(),
            )
            .unwrap();
        for i in 0..2u64 {
            let page = va + i * PAGE_SIZE;
            assert_eq!(vmm.fault(cpu, &write_fault(page)), FaultResolution::Resolved);
            let pa = vmm.backend.physical_of(None, page).unwrap();
            vmm.backend
                .with_phys(pa, PAGE_SIZE as usize, |b| b.fill(0xA0 + i as u8));
        }
        (ctx, va)
    }

    #[test]
    fn clone_preserves_layout_and_aliases_frames_read_only() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);
        let (parent, va) = populated_parent(&vmm, &cpu);

        let child = vmm.clone_context(&cpu, &parent).unwrap();

        let parent_dir = Some(parent.directory());
        let child_dir = Some(child.directory());
        for i in 0..2u64 {
            let page = va + i * PAGE_SIZE;
            let ppa = mmu.physical_of(parent_dir, page).unwrap();
            let cpa = mmu.physical_of(child_dir, page).unwrap();
            assert_eq!(ppa, cpa, "copy-on-write aliases the frame");
            assert_eq!(pmm.refcount(ppa), 2);
            assert!(!mmu.read_flags(parent_dir, page).contains(PageFlags::WRITABLE));
            assert!(!mmu.read_flags(child_dir, page).contains(PageFlags::WRITABLE));
        }

        vmm.destroy_context(&cpu, child);
        vmm.destroy_context(&cpu, parent);
    }

    #[test]
    fn first_write_after_clone_copies_and_isolates() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);
        let (parent, va) = populated_parent(&vmm, &cpu);
        let child = vmm.clone_context(&cpu, &parent).unwrap();

        // Parent writes: the shared frame gets copied for the parent.
        assert_eq!(vmm.fault(&cpu, &write_fault(va)), FaultResolution::Resolved);
        let ppa = mmu.physical_of(Some(parent.directory()), va).unwrap();
        let cpa = mmu.physical_of(Some(child.directory()), va).unwrap();
        assert_ne!(ppa, cpa);
        assert!(mmu
            .read_flags(Some(parent.directory()), va)
            .contains(PageFlags::WRITABLE));

        // Contents were carried over, then diverge.
        mmu.with_phys(cpa, PAGE_SIZE as usize, |b| assert_eq!(b[0], 0xA0));
        mmu.with_phys(ppa, PAGE_SIZE as usize, |b| {
            assert_eq!(b[0], 0xA0);
            b[0] = 0x5A;
        });
        mmu.with_phys(cpa, PAGE_SIZE as usize, |b| assert_eq!(b[0], 0xA0));

        // Child's write now finds itself the sole owner and upgrades in
        // place instead of copying again.
        assert_eq!(pmm.refcount(cpa), 1);
        vmm.switch(&cpu, Some(&child));
        assert_eq!(vmm.fault(&cpu, &write_fault(va)), FaultResolution::Resolved);
        assert_eq!(mmu.physical_of(Some(child.directory()), va), Some(cpa));
        assert!(mmu
            .read_flags(Some(child.directory()), va)
            .contains(PageFlags::WRITABLE));

        vmm.destroy_context(&cpu, child);
        vmm.destroy_context(&cpu, parent);
    }

    #[test]
    fn eager_clone_copies_every_present_frame() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::with_policies(mmu, pmm, 1, UnmapPolicy::Fatal, CloneMode::EagerCopy);
        let cpu = Processor::new(0);
        let (parent, va) = populated_parent(&vmm, &cpu);
        let child = vmm.clone_context(&cpu, &parent).unwrap();

        for i in 0..2u64 {
            let page = va + i * PAGE_SIZE;
            let ppa = mmu.physical_of(Some(parent.directory()), page).unwrap();
            let cpa = mmu.physical_of(Some(child.directory()), page).unwrap();
            assert_ne!(ppa, cpa);
            assert_eq!(pmm.refcount(ppa), 1);
            assert_eq!(pmm.refcount(cpa), 1);
            // Parent mappings stay writable; no faulting needed on either side.
            assert!(mmu.read_flags(Some(parent.directory()), page).contains(PageFlags::WRITABLE));
            mmu.with_phys(cpa, PAGE_SIZE as usize, |b| assert_eq!(b[0], 0xA0 + i as u8));
        }

        vmm.destroy_context(&cpu, child);
        vmm.destroy_context(&cpu, parent);
    }

    #[test]
    fn shared_ranges_stay_shared_and_writable() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let parent = vmm.create_context(&cpu).unwrap();
        vmm.switch(&cpu, Some(&parent));
        let va = vmm
            .map(
                &cpu,
                VirtualAddress::new(USER_BASE),
                PAGE_SIZE,
                VmFlags::EXACT | VmFlags::SHARED,
                PageFlags::user_data(),
            )
            .unwrap();
        assert_eq!(vmm.fault(&cpu, &write_fault(va)), FaultResolution::Resolved);
        let pa = mmu.physical_of(None, va).unwrap();

        let child = vmm.clone_context(&cpu, &parent).unwrap();
        assert_eq!(mmu.physical_of(Some(child.directory()), va), Some(pa));
        assert_eq!(pmm.refcount(pa), 2);
        // Shared mappings keep write permission on both sides.
        assert!(mmu.read_flags(Some(parent.directory()), va).contains(PageFlags::WRITABLE));
        assert!(mmu.read_flags(Some(child.directory()), va).contains(PageFlags::WRITABLE));

        vmm.destroy_context(&cpu, child);
        assert_eq!(pmm.refcount(pa), 1);
        vmm.destroy_context(&cpu, parent);
    }

    #[test]
    fn clone_and_teardown_balance_the_frame_counters() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);
        let baseline = pmm.stats().used_frames;

        let (parent, va) = populated_parent(&vmm, &cpu);
        let child = vmm.clone_context(&cpu, &parent).unwrap();

        // Exercise a cow break so parent and child own distinct frames.
        assert_eq!(vmm.fault(&cpu, &write_fault(va)), FaultResolution::Resolved);

        vmm.destroy_context(&cpu, child);
        vmm.destroy_context(&cpu, parent);
        assert_eq!(pmm.stats().used_frames, baseline);
    }
}
