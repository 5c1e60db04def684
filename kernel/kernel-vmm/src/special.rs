//! Device-memory helpers: MMIO windows and DMA buffers.
//!
//! Both live in kernel space under [`VmFlags::DEVICE`], which keeps the
//! generic unmap path from feeding device frames to the PMM. DMA buffers
//! are the one place the VMM asks the PMM for physically contiguous runs.

use kernel_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
use kernel_mmu::{MmuBackend, PageFlags};
use kernel_pmm::Zone;

use crate::{Processor, VmFlags, Vmm, VmmError};

impl<B: MmuBackend> Vmm<'_, B> {
    /// Map `[phys, phys + size)` of device memory into kernel space,
    /// uncached. Returns the virtual address of `phys` itself, which keeps
    /// its offset within the first page.
    pub fn mmio_map(
        &self,
        proc: &Processor,
        phys: PhysicalAddress,
        size: u64,
    ) -> Result<VirtualAddress, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidRange);
        }
        let phys_base = align_down(phys.as_u64(), PAGE_SIZE);
        let offset = phys.as_u64() - phys_base;
        let span = align_up(offset + size, PAGE_SIZE);

        let va = self.map_with(
            proc,
            VirtualAddress::NULL,
            span,
            VmFlags::DEVICE,
            PageFlags::device(),
            None,
        )?;
        let dir = Some(self.backend.kernel_directory());
        for page in (0..span).step_by(PAGE_SIZE as usize) {
            if let Err(err) = self.backend.map(
                dir,
                va + page,
                PhysicalAddress::new(phys_base + page),
                PageFlags::device(),
            ) {
                // The reservation carries DEVICE, so this unmaps without
                // releasing anything to the PMM.
                let _ = self.unmap(proc, va, span);
                return Err(err.into());
            }
        }
        log::debug!("vmm: mmio {phys} mapped at {va} ({span:#x} bytes)");
        Ok(va + offset)
    }

    /// Tear down an MMIO window created by [`Vmm::mmio_map`], given the
    /// same address and size.
    pub fn mmio_unmap(
        &self,
        proc: &Processor,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<(), VmmError> {
        let base = align_down(virt.as_u64(), PAGE_SIZE);
        let span = align_up(virt.as_u64() - base + size, PAGE_SIZE);
        self.unmap(proc, VirtualAddress::new(base), span)
    }

    /// Allocate a physically contiguous, zeroed, uncached buffer and map it
    /// into kernel space. Returns the virtual and physical base.
    pub fn dma_map(
        &self,
        proc: &Processor,
        size: u64,
    ) -> Result<(VirtualAddress, PhysicalAddress), VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidRange);
        }
        let size = align_up(size, PAGE_SIZE);
        let pages = (size / PAGE_SIZE) as usize;

        let phys = self.pmm.allocate_pages(pages, Zone::Default)?;
        let va = match self.map_with(
            proc,
            VirtualAddress::NULL,
            size,
            VmFlags::DEVICE,
            PageFlags::device(),
            None,
        ) {
            Ok(va) => va,
            Err(err) => {
                self.pmm.free_pages(phys, pages);
                return Err(err);
            }
        };

        let dir = Some(self.backend.kernel_directory());
        for page in (0..size).step_by(PAGE_SIZE as usize) {
            let pa = phys + page;
            self.backend
                .with_phys(pa, PAGE_SIZE as usize, |bytes| bytes.fill(0));
            if let Err(err) = self.backend.map(dir, va + page, pa, PageFlags::device()) {
                let _ = self.unmap(proc, va, size);
                self.pmm.free_pages(phys, pages);
                return Err(err.into());
            }
        }
        log::debug!("vmm: dma buffer {va} -> {phys} ({size:#x} bytes)");
        Ok((va, phys))
    }

    /// Release a DMA buffer: unmap it and return its frames to the PMM.
    pub fn dma_unmap(
        &self,
        proc: &Processor,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<(), VmmError> {
        let size = align_up(size, PAGE_SIZE);
        let pages = (size / PAGE_SIZE) as usize;
        let dir = Some(self.backend.kernel_directory());
        let phys = self
            .backend
            .physical_of(dir, virt)
            .ok_or(VmmError::InvalidRange)?;
        self.unmap(proc, virt, size)?;
        self.pmm.free_pages(phys, pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;
    use kernel_mmu::Directory;

    fn kernel_dir<B: MmuBackend>(vmm: &Vmm<'_, B>) -> Option<Directory> {
        Some(vmm.backend.kernel_directory())
    }

    #[test]
    fn mmio_window_aliases_the_device_frames() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        // A PMM frame stands in for a device BAR.
        let bar = pmm.allocate_page(Zone::Default).unwrap();
        let regs = bar + 0x10;

        let va = vmm.mmio_map(&cpu, regs, 0x100).unwrap();
        assert_eq!(va.page_offset(), 0x10);
        assert_eq!(mmu.physical_of(kernel_dir(&vmm), va), Some(bar));
        let flags = mmu.read_flags(kernel_dir(&vmm), va);
        assert!(flags.contains(PageFlags::NO_CACHE));

        // Unmapping a DEVICE range must not touch the frame's ownership.
        vmm.mmio_unmap(&cpu, va, 0x100).unwrap();
        assert_eq!(pmm.refcount(bar), 1);
        pmm.free_page(bar);
    }

    #[test]
    fn mmio_spanning_two_pages_maps_both() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        let bar = pmm.allocate_pages(2, Zone::Default).unwrap();
        // 0x20 bytes short of the boundary, 0x40 long: straddles two pages.
        let va = vmm.mmio_map(&cpu, bar + (PAGE_SIZE - 0x20), 0x40).unwrap();
        let second_page = VirtualAddress::new(align_down(va.as_u64(), PAGE_SIZE) + PAGE_SIZE);
        assert_eq!(
            mmu.physical_of(kernel_dir(&vmm), second_page),
            Some(bar + PAGE_SIZE)
        );

        vmm.mmio_unmap(&cpu, va, 0x40).unwrap();
        pmm.free_pages(bar, 2);
    }

    #[test]
    fn dma_buffer_is_contiguous_zeroed_and_reclaimed() {
        let (pmm, mmu) = harness();
        let vmm = Vmm::new(mmu, pmm, 1);
        let cpu = Processor::new(0);

        // Warm-up cycle so page-table frames for this region exist.
        let (va, _) = vmm.dma_map(&cpu, 3 * PAGE_SIZE).unwrap();
        vmm.dma_unmap(&cpu, va, 3 * PAGE_SIZE).unwrap();
        let baseline = pmm.stats().used_frames;

        let (va, pa) = vmm.dma_map(&cpu, 3 * PAGE_SIZE).unwrap();
        for page in (0..3 * PAGE_SIZE).step_by(PAGE_SIZE as usize) {
            assert_eq!(
                mmu.physical_of(kernel_dir(&vmm), va + page),
                Some(pa + page)
            );
            let zeroed = mmu.with_phys(pa + page, PAGE_SIZE as usize, |b| {
                b.iter().all(|&x| x == 0)
            });
            assert!(zeroed);
        }
        assert_eq!(pmm.stats().used_frames, baseline + 3);

        vmm.dma_unmap(&cpu, va, 3 * PAGE_SIZE).unwrap();
        assert_eq!(pmm.stats().used_frames, baseline);
    }
}
