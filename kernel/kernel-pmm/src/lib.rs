//! # Physical Memory Manager
//!
//! Bitmap-backed frame allocator over boot-time memory-map regions.
//!
//! Each usable region becomes a [`Section`]: a contiguous physical range
//! with its own bitmap, free count, first-free-byte hint and spin lock.
//! Sections are grouped into [`Zone`]s and are otherwise independent —
//! there is no global allocation lock, so different sections can serve
//! allocations concurrently.
//!
//! Frames carry a reference count. [`Pmm::allocate_page`] hands out frames
//! with a count of one; [`Pmm::retain`] / [`Pmm::release`] let the VMM share
//! a frame between address spaces (copy-on-write) and free it only when the
//! last owner lets go.
//!
//! ## Invariants
//! - A section's free count always equals the number of zero bits in its
//!   bitmap (tail bits past the last frame are permanently set).
//! - A frame's bitmap bit is set iff its reference count is non-zero.
//! - Releasing a frame nobody owns, or an address no section tracks, is a
//!   caller bug and panics with a diagnostic.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};
use kernel_sync::SpinLock;

/// Boundary below which sections land in [`Zone::Low`] (legacy DMA devices
/// that can only address the first 16 MiB).
pub const LOW_ZONE_LIMIT: u64 = 16 * 1024 * 1024;

/// Number of zones; indexes into the per-zone section lists.
const NZONES: usize = 2;

/// Physical allocation zone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Zone {
    /// Anything above [`LOW_ZONE_LIMIT`]; the common case.
    Default,
    /// Memory below [`LOW_ZONE_LIMIT`].
    Low,
}

impl Zone {
    const fn index(self) -> usize {
        match self {
            Self::Default => 0,
            Self::Low => 1,
        }
    }
}

/// Classification of a boot memory-map region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadRam,
    Kernel,
    Module,
}

/// One entry of the firmware/bootloader memory map.
#[derive(Copy, Clone, Debug)]
pub struct PhysicalRegion {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub kind: RegionKind,
}

impl PhysicalRegion {
    #[must_use]
    pub const fn available(start: u64, end: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            kind: RegionKind::Available,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PmmError {
    #[error("out of physical memory (requested {requested} page(s))")]
    OutOfMemory { requested: usize },
}

/// Allocator statistics; counters are atomics, so reading them never takes
/// a section lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PmmStats {
    pub total_frames: u64,
    pub used_frames: u64,
    pub free_frames: u64,
}

/// Mutable section state, guarded by the section's spin lock.
struct SectionInner {
    /// One bit per frame; set = used. Tail bits past `frames` are set.
    bitmap: Vec<u8>,
    /// Per-frame reference counts; non-zero iff the bitmap bit is set.
    refcounts: Vec<u32>,
    /// Number of free frames.
    nfree: usize,
    /// First-free-byte hint: index of the lowest bitmap byte that may
    /// contain a zero bit.
    ffb: usize,
}

/// A contiguous tracked physical range with its own lock.
struct Section {
    /// First frame's physical address (page aligned).
    start: PhysicalAddress,
    /// Number of frames tracked.
    frames: usize,
    inner: SpinLock<SectionInner>,
}

impl Section {
    fn new(start: PhysicalAddress, frames: usize) -> Self {
        let bytes = frames.div_ceil(8);
        let mut bitmap = alloc::vec![0u8; bytes];
        // Mark tail bits past the last frame as used so scans never hand
        // out frames outside the section.
        for idx in frames..bytes * 8 {
            bitmap[idx / 8] |= 1 << (idx % 8);
        }
        Self {
            start,
            frames,
            inner: SpinLock::new(SectionInner {
                bitmap,
                refcounts: alloc::vec![0u32; frames],
                nfree: frames,
                ffb: 0,
            }),
        }
    }

    fn contains(&self, addr: PhysicalAddress) -> bool {
        let a = addr.as_u64();
        let start = self.start.as_u64();
        a >= start && a < start + self.frames as u64 * PAGE_SIZE
    }

    fn frame_index(&self, addr: PhysicalAddress) -> usize {
        ((addr.as_u64() - self.start.as_u64()) / PAGE_SIZE) as usize
    }

    fn frame_address(&self, idx: usize) -> PhysicalAddress {
        self.start + idx as u64 * PAGE_SIZE
    }
}

impl SectionInner {
    fn is_free(&self, idx: usize) -> bool {
        self.bitmap[idx / 8] & (1 << (idx % 8)) == 0
    }

    fn mark_used(&mut self, idx: usize) {
        self.bitmap[idx / 8] |= 1 << (idx % 8);
    }

    fn mark_free(&mut self, idx: usize) {
        self.bitmap[idx / 8] &= !(1 << (idx % 8));
        if idx / 8 < self.ffb {
            self.ffb = idx / 8;
        }
    }

    /// Advance the first-free-byte hint past fully-used bytes.
    fn advance_ffb(&mut self) {
        while self.ffb < self.bitmap.len() && self.bitmap[self.ffb] == 0xFF {
            self.ffb += 1;
        }
    }
}

/// The physical memory manager.
pub struct Pmm {
    zones: [Vec<Section>; NZONES],
    total: AtomicU64,
    used: AtomicU64,
}

impl Pmm {
    /// Build sections from the boot memory map. Only [`RegionKind::Available`]
    /// regions are tracked; everything else is left alone forever.
    #[must_use]
    pub fn new(regions: &[PhysicalRegion]) -> Self {
        let mut zones: [Vec<Section>; NZONES] = [Vec::new(), Vec::new()];
        let mut total = 0u64;

        for region in regions {
            if region.kind != RegionKind::Available {
                continue;
            }
            let start = align_up(region.start.as_u64(), PAGE_SIZE);
            let end = align_down(region.end.as_u64(), PAGE_SIZE);
            if end <= start {
                continue;
            }
            // A region straddling the zone boundary contributes one
            // section to each zone.
            for (lo, hi) in [
                (start, end.min(LOW_ZONE_LIMIT)),
                (start.max(LOW_ZONE_LIMIT), end),
            ] {
                if hi <= lo {
                    continue;
                }
                let frames = ((hi - lo) / PAGE_SIZE) as usize;
                let zone = if lo < LOW_ZONE_LIMIT {
                    Zone::Low
                } else {
                    Zone::Default
                };
                log::debug!(
                    "pmm: section {lo:#014x}-{hi:#014x} ({frames} frames, {zone:?})"
                );
                zones[zone.index()].push(Section::new(PhysicalAddress::new(lo), frames));
                total += frames as u64;
            }
        }

        log::info!("pmm: tracking {total} frames");
        Self {
            zones,
            total: AtomicU64::new(total),
            used: AtomicU64::new(0),
        }
    }

    /// Allocate one frame from `zone`. The frame's reference count is one;
    /// contents are whatever was there before (callers zero if they care).
    pub fn allocate_page(&self, zone: Zone) -> Result<PhysicalAddress, PmmError> {
        for section in &self.zones[zone.index()] {
            let mut inner = section.inner.lock();
            if inner.nfree == 0 {
                continue;
            }
            inner.advance_ffb();
            debug_assert!(
                inner.ffb < inner.bitmap.len(),
                "pmm: free count does not match bitmap"
            );

            let byte = inner.bitmap[inner.ffb];
            let bit = (0..8)
                .find(|b| byte & (1 << b) == 0)
                .expect("pmm: ffb points at a full byte");
            let idx = inner.ffb * 8 + bit;

            inner.mark_used(idx);
            debug_assert_eq!(inner.refcounts[idx], 0, "pmm: allocating an owned frame");
            inner.refcounts[idx] = 1;
            inner.nfree -= 1;
            inner.advance_ffb();
            drop(inner);

            self.used.fetch_add(1, Ordering::Relaxed);
            return Ok(section.frame_address(idx));
        }
        log::error!("pmm: zone {zone:?} exhausted");
        Err(PmmError::OutOfMemory { requested: 1 })
    }

    /// Allocate `count` physically contiguous frames from `zone`.
    ///
    /// Never returns a partially contiguous run: a section either yields the
    /// whole run or is skipped.
    pub fn allocate_pages(&self, count: usize, zone: Zone) -> Result<PhysicalAddress, PmmError> {
        if count == 0 {
            return Err(PmmError::OutOfMemory { requested: 0 });
        }
        if count == 1 {
            return self.allocate_page(zone);
        }

        for section in &self.zones[zone.index()] {
            let mut inner = section.inner.lock();
            if inner.nfree < count {
                continue;
            }

            let mut run_start = None;
            let mut run_len = 0usize;
            for idx in 0..section.frames {
                if inner.is_free(idx) {
                    if run_len == 0 {
                        run_start = Some(idx);
                    }
                    run_len += 1;
                    if run_len == count {
                        break;
                    }
                } else {
                    run_len = 0;
                    run_start = None;
                }
            }

            if run_len == count {
                let first = run_start.expect("run bookkeeping");
                for idx in first..first + count {
                    inner.mark_used(idx);
                    inner.refcounts[idx] = 1;
                }
                inner.nfree -= count;
                inner.advance_ffb();
                drop(inner);

                self.used.fetch_add(count as u64, Ordering::Relaxed);
                return Ok(section.frame_address(first));
            }
        }
        log::error!("pmm: no contiguous run of {count} frames in zone {zone:?}");
        Err(PmmError::OutOfMemory { requested: count })
    }

    /// Free one frame. Equivalent to [`Pmm::release`]; the frame actually
    /// returns to the bitmap only when its reference count hits zero.
    pub fn free_page(&self, addr: PhysicalAddress) {
        self.release(addr);
    }

    /// Free `count` frames starting at `base`.
    pub fn free_pages(&self, base: PhysicalAddress, count: usize) {
        for i in 0..count {
            self.release(base + i as u64 * PAGE_SIZE);
        }
    }

    /// Increment a frame's reference count, preventing it from being freed
    /// until a matching [`Pmm::release`].
    ///
    /// # Panics
    /// If `addr` is untracked or the frame is currently free.
    pub fn retain(&self, addr: PhysicalAddress) {
        let section = self.section_for(addr);
        let idx = section.frame_index(addr);
        let mut inner = section.inner.lock();
        assert!(inner.refcounts[idx] != 0, "pmm: retain of free frame {addr}");
        inner.refcounts[idx] += 1;
    }

    /// Decrement a frame's reference count, freeing it at zero.
    ///
    /// # Panics
    /// If `addr` is untracked or the frame is already free (double free).
    pub fn release(&self, addr: PhysicalAddress) {
        let section = self.section_for(addr);
        let idx = section.frame_index(addr);
        let mut inner = section.inner.lock();
        assert!(inner.refcounts[idx] != 0, "pmm: double free of frame {addr}");
        inner.refcounts[idx] -= 1;
        if inner.refcounts[idx] == 0 {
            inner.mark_free(idx);
            inner.nfree += 1;
            drop(inner);
            self.used.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Current reference count of the frame holding `addr`.
    ///
    /// # Panics
    /// If `addr` is untracked.
    #[must_use]
    pub fn refcount(&self, addr: PhysicalAddress) -> u32 {
        let section = self.section_for(addr);
        let idx = section.frame_index(addr);
        section.inner.lock().refcounts[idx]
    }

    /// Snapshot of the global counters.
    #[must_use]
    pub fn stats(&self) -> PmmStats {
        let total = self.total.load(Ordering::Relaxed);
        let used = self.used.load(Ordering::Relaxed);
        PmmStats {
            total_frames: total,
            used_frames: used,
            free_frames: total - used,
        }
    }

    fn section_for(&self, addr: PhysicalAddress) -> &Section {
        self.zones
            .iter()
            .flatten()
            .find(|s| s.contains(addr))
            .unwrap_or_else(|| panic!("pmm: no section contains frame {addr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Above LOW_ZONE_LIMIT, so the frames land in Zone::Default.
    fn pmm_with_frames(n: u64) -> Pmm {
        let base = 0x100_0000;
        Pmm::new(&[PhysicalRegion::available(base, base + n * PAGE_SIZE)])
    }

    #[test]
    fn allocate_then_free_restores_counters() {
        let pmm = pmm_with_frames(32);
        let before = pmm.stats();

        let page = pmm.allocate_page(Zone::Default).unwrap();
        assert_eq!(pmm.stats().used_frames, before.used_frames + 1);

        pmm.free_page(page);
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn many_frames_freed_in_any_order_restore_counters() {
        let pmm = pmm_with_frames(64);
        let before = pmm.stats();

        let mut pages: Vec<_> = (0..16)
            .map(|_| pmm.allocate_page(Zone::Default).unwrap())
            .collect();
        // All distinct.
        for (i, a) in pages.iter().enumerate() {
            for b in &pages[i + 1..] {
                assert_ne!(a, b);
            }
        }

        // Free in a scrambled order.
        pages.reverse();
        pages.swap(0, 7);
        pages.swap(3, 11);
        for p in pages {
            pmm.free_page(p);
        }
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn freed_frame_is_reused_first_fit() {
        let pmm = pmm_with_frames(8);
        let a = pmm.allocate_page(Zone::Default).unwrap();
        let _b = pmm.allocate_page(Zone::Default).unwrap();
        pmm.free_page(a);
        // The hint moves back to the freed frame.
        let c = pmm.allocate_page(Zone::Default).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn contiguous_run_is_contiguous() {
        let pmm = pmm_with_frames(32);
        let base = pmm.allocate_pages(5, Zone::Default).unwrap();
        for i in 0..5u64 {
            // Each frame of the run is individually owned.
            assert_eq!(pmm.refcount(base + i * PAGE_SIZE), 1);
        }
        pmm.free_pages(base, 5);
        assert_eq!(pmm.stats().used_frames, 0);
    }

    #[test]
    fn contiguous_run_skips_fragmented_holes() {
        let pmm = pmm_with_frames(8);
        let a = pmm.allocate_page(Zone::Default).unwrap();
        let b = pmm.allocate_page(Zone::Default).unwrap();
        let c = pmm.allocate_page(Zone::Default).unwrap();
        pmm.free_page(b);
        // Frames 3..8 are the only run of 4; the hole at `b` must be skipped.
        let run = pmm.allocate_pages(4, Zone::Default).unwrap();
        assert!(run.as_u64() > c.as_u64());
        pmm.free_page(a);
        pmm.free_page(c);
        pmm.free_pages(run, 4);
    }

    #[test]
    fn exhaustion_is_an_error_not_a_panic() {
        let pmm = pmm_with_frames(4);
        let mut pages = Vec::new();
        for _ in 0..4 {
            pages.push(pmm.allocate_page(Zone::Default).unwrap());
        }
        assert!(matches!(
            pmm.allocate_page(Zone::Default),
            Err(PmmError::OutOfMemory { requested: 1 })
        ));
        for p in pages {
            pmm.free_page(p);
        }
    }

    #[test]
    fn retain_keeps_frame_alive_until_last_release() {
        let pmm = pmm_with_frames(8);
        let before = pmm.stats();

        let page = pmm.allocate_page(Zone::Default).unwrap();
        pmm.retain(page);
        assert_eq!(pmm.refcount(page), 2);

        pmm.release(page);
        // Still owned by the second reference.
        assert_eq!(pmm.refcount(page), 1);
        assert_eq!(pmm.stats().used_frames, before.used_frames + 1);

        pmm.release(page);
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pmm = pmm_with_frames(4);
        let page = pmm.allocate_page(Zone::Default).unwrap();
        pmm.free_page(page);
        pmm.free_page(page);
    }

    #[test]
    #[should_panic(expected = "no section contains")]
    fn freeing_untracked_address_panics() {
        let pmm = pmm_with_frames(4);
        pmm.free_page(PhysicalAddress::new(0xdead_d000));
    }

    #[test]
    fn low_zone_regions_are_separate() {
        let pmm = Pmm::new(&[
            PhysicalRegion::available(0x10_000, 0x10_000 + 4 * PAGE_SIZE),
            PhysicalRegion::available(0x100_0000_0, 0x100_0000_0 + 4 * PAGE_SIZE),
        ]);
        let low = pmm.allocate_page(Zone::Low).unwrap();
        assert!(low.as_u64() < LOW_ZONE_LIMIT);
        let high = pmm.allocate_page(Zone::Default).unwrap();
        assert!(high.as_u64() >= LOW_ZONE_LIMIT);
        pmm.free_page(low);
        pmm.free_page(high);
    }

    #[test]
    fn straddling_region_is_split_at_the_zone_boundary() {
        let pmm = Pmm::new(&[PhysicalRegion::available(
            LOW_ZONE_LIMIT - 2 * PAGE_SIZE,
            LOW_ZONE_LIMIT + 2 * PAGE_SIZE,
        )]);

        // Each zone owns exactly its half of the region.
        for _ in 0..2 {
            let low = pmm.allocate_page(Zone::Low).unwrap();
            assert!(low.as_u64() < LOW_ZONE_LIMIT);
            let high = pmm.allocate_page(Zone::Default).unwrap();
            assert!(high.as_u64() >= LOW_ZONE_LIMIT);
        }
        assert!(pmm.allocate_page(Zone::Low).is_err());
        assert!(pmm.allocate_page(Zone::Default).is_err());
    }

    #[test]
    fn unaligned_region_edges_are_trimmed() {
        let pmm = Pmm::new(&[PhysicalRegion::available(0x10_0001, 0x10_0000 + 3 * PAGE_SIZE)]);
        // First frame starts at the next page boundary; only two fit.
        assert_eq!(pmm.stats().total_frames, 2);
    }
}
