//! Range bookkeeping: what parts of an address space are reserved, with
//! what semantics, and where a new reservation can go.
//!
//! A [`RangeSet`] is a sorted, non-overlapping vector of [`MemoryRange`]s
//! covering one address space. Sorted order makes containment lookups a
//! binary search and lets [`RangeSet::find_free`] find a first-fit hole in
//! a single pass. Overlap can only arise from a bookkeeping bug, so
//! [`RangeSet::insert`] panics on it rather than reporting an error.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kernel_addresses::PAGE_SIZE;
use kernel_mmu::PageFlags;

use crate::VmmError;

bitflags::bitflags! {
    /// Semantics of a reservation, orthogonal to its page protection.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct VmFlags: u32 {
        /// Back every page with a frame at map time instead of on first
        /// fault. Kernel-space mappings are always eager.
        const EAGER = 1 << 0;
        /// The hint is a requirement; fail instead of relocating.
        const EXACT = 1 << 1;
        /// Pages are filled from a [`PageProvider`] on first fault.
        const FILE = 1 << 2;
        /// Frames are shared on clone instead of copied.
        const SHARED = 1 << 3;
        /// Frames are device memory the PMM does not own; never freed,
        /// never copied.
        const DEVICE = 1 << 4;
    }
}

/// Source of page contents for file-backed mappings. Implemented by the
/// page cache / filesystem layer; the VMM only asks for whole pages.
pub trait PageProvider: Send + Sync {
    /// Fill `buf` (exactly one page) with the page starting `offset` bytes
    /// into the backing object. Short objects zero-fill the tail.
    fn fill_page(&self, offset: u64, buf: &mut [u8]) -> Result<(), VmmError>;
}

/// A provider plus the byte offset where a range's window into it begins.
#[derive(Clone)]
pub struct FileBacking {
    pub provider: Arc<dyn PageProvider>,
    pub offset: u64,
}

/// One reservation: `[start, end)`, page aligned, never empty.
#[derive(Clone)]
pub struct MemoryRange {
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    pub vm_flags: VmFlags,
    pub protection: PageFlags,
    pub file: Option<FileBacking>,
}

impl MemoryRange {
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Page base addresses of the range, in order.
    pub fn pages(&self) -> impl Iterator<Item = u64> + use<> {
        (self.start..self.end).step_by(PAGE_SIZE as usize)
    }

    /// Byte offset into the backing object for the page at `page_base`.
    #[must_use]
    pub fn file_offset(&self, page_base: u64) -> Option<u64> {
        self.file
            .as_ref()
            .map(|f| f.offset + (page_base - self.start))
    }
}

/// The reservations of one address space, sorted by start address.
pub struct RangeSet {
    start: u64,
    end: u64,
    ranges: Vec<MemoryRange>,
}

impl RangeSet {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ranges: Vec::new(),
        }
    }

    #[must_use]
    pub const fn span(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRange> {
        self.ranges.iter()
    }

    /// First-fit search for a `size`-byte hole at or after `hint`. A hint
    /// below the space floor is clamped up; both arguments must be page
    /// aligned.
    #[must_use]
    pub fn find_free(&self, hint: u64, size: u64) -> Option<u64> {
        debug_assert_eq!(hint % PAGE_SIZE, 0);
        debug_assert_eq!(size % PAGE_SIZE, 0);
        if size == 0 {
            return None;
        }

        let mut addr = hint.max(self.start);
        for range in &self.ranges {
            if range.end <= addr {
                continue;
            }
            if addr.checked_add(size)? <= range.start {
                break;
            }
            addr = range.end;
        }
        (addr.checked_add(size)? <= self.end).then_some(addr)
    }

    /// Insert a reservation.
    ///
    /// # Panics
    /// If the range is empty, outside the space, or overlaps an existing
    /// reservation. Callers reserve via [`RangeSet::find_free`] under the
    /// same lock, so any of these is corrupted bookkeeping.
    pub fn insert(&mut self, range: MemoryRange) {
        assert!(range.start < range.end, "vmm: empty range");
        assert!(
            range.start >= self.start && range.end <= self.end,
            "vmm: range {:#x}..{:#x} outside the address space",
            range.start,
            range.end
        );
        let idx = self.ranges.partition_point(|r| r.start < range.start);
        let overlaps_prev = idx > 0 && self.ranges[idx - 1].end > range.start;
        let overlaps_next = idx < self.ranges.len() && self.ranges[idx].start < range.end;
        assert!(
            !overlaps_prev && !overlaps_next,
            "vmm: overlapping range inserted at {:#x}..{:#x}",
            range.start,
            range.end
        );
        self.ranges.insert(idx, range);
    }

    /// The reservation containing `addr`, if any.
    #[must_use]
    pub fn find_containing(&self, addr: u64) -> Option<&MemoryRange> {
        let idx = self.ranges.partition_point(|r| r.end <= addr);
        self.ranges.get(idx).filter(|r| r.contains(addr))
    }

    /// Remove the reservation spanning exactly `[start, end)`.
    pub fn remove_exact(&mut self, start: u64, end: u64) -> Option<MemoryRange> {
        let idx = self
            .ranges
            .iter()
            .position(|r| r.start == start && r.end == end)?;
        Some(self.ranges.remove(idx))
    }

    /// Carve `[start, end)` out of the single reservation containing it,
    /// reinserting the remainders. Returns the carved piece, or `None` when
    /// no single reservation covers the whole interval.
    pub fn split_remove(&mut self, start: u64, end: u64) -> Option<MemoryRange> {
        let idx = self
            .ranges
            .iter()
            .position(|r| r.start <= start && r.end >= end)?;
        let original = self.ranges.remove(idx);

        if original.start < start {
            let mut left = original.clone();
            left.end = start;
            self.insert(left);
        }
        if original.end > end {
            let mut right = original.clone();
            right.start = end;
            // Keep file pages aligned with their old virtual addresses.
            if let Some(file) = &mut right.file {
                file.offset += end - original.start;
            }
            self.insert(right);
        }

        let mut carved = original;
        if let Some(file) = &mut carved.file {
            file.offset += start - carved.start;
        }
        carved.start = start;
        carved.end = end;
        Some(carved)
    }

    /// Remove and return an arbitrary reservation; used for teardown.
    pub fn pop(&mut self) -> Option<MemoryRange> {
        self.ranges.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(start: u64, end: u64) -> MemoryRange {
        MemoryRange {
            start,
            end,
            vm_flags: VmFlags::empty(),
            protection: PageFlags::kernel_data(),
            file: None,
        }
    }

    const LO: u64 = 0x1_0000;
    const HI: u64 = 0x10_0000;

    #[test]
    fn find_free_prefers_the_hint() {
        let set = RangeSet::new(LO, HI);
        assert_eq!(set.find_free(LO + 0x4000, 0x2000), Some(LO + 0x4000));
    }

    #[test]
    fn find_free_clamps_low_hints_to_the_floor() {
        let set = RangeSet::new(LO, HI);
        assert_eq!(set.find_free(0, 0x1000), Some(LO));
    }

    #[test]
    fn find_free_skips_collisions_first_fit() {
        let mut set = RangeSet::new(LO, HI);
        set.insert(anon(LO, LO + 0x2000));
        set.insert(anon(LO + 0x3000, LO + 0x5000));
        // Hole between the two reservations fits a single page.
        assert_eq!(set.find_free(LO, 0x1000), Some(LO + 0x2000));
        // Two pages only fit after the second reservation.
        assert_eq!(set.find_free(LO, 0x2000), Some(LO + 0x5000));
    }

    #[test]
    fn find_free_fails_when_the_space_is_exhausted() {
        let mut set = RangeSet::new(LO, LO + 0x3000);
        set.insert(anon(LO, LO + 0x2000));
        assert_eq!(set.find_free(LO, 0x1000), Some(LO + 0x2000));
        assert_eq!(set.find_free(LO, 0x2000), None);
    }

    #[test]
    fn inserted_ranges_stay_sorted() {
        let mut set = RangeSet::new(LO, HI);
        set.insert(anon(LO + 0x5000, LO + 0x6000));
        set.insert(anon(LO, LO + 0x1000));
        set.insert(anon(LO + 0x2000, LO + 0x3000));
        let starts: Vec<u64> = set.iter().map(|r| r.start).collect();
        assert_eq!(starts, [LO, LO + 0x2000, LO + 0x5000]);
    }

    #[test]
    #[should_panic(expected = "overlapping range")]
    fn overlapping_insert_panics() {
        let mut set = RangeSet::new(LO, HI);
        set.insert(anon(LO, LO + 0x3000));
        set.insert(anon(LO + 0x2000, LO + 0x4000));
    }

    #[test]
    fn containment_lookup() {
        let mut set = RangeSet::new(LO, HI);
        set.insert(anon(LO + 0x2000, LO + 0x4000));
        assert!(set.find_containing(LO + 0x2000).is_some());
        assert!(set.find_containing(LO + 0x3fff).is_some());
        assert!(set.find_containing(LO + 0x4000).is_none());
        assert!(set.find_containing(LO).is_none());
    }

    #[test]
    fn remove_exact_requires_exact_bounds() {
        let mut set = RangeSet::new(LO, HI);
        set.insert(anon(LO, LO + 0x4000));
        assert!(set.remove_exact(LO, LO + 0x2000).is_none());
        assert!(set.remove_exact(LO, LO + 0x4000).is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn split_remove_leaves_both_remainders() {
        let mut set = RangeSet::new(LO, HI);
        set.insert(anon(LO, LO + 0x4000));
        let carved = set.split_remove(LO + 0x1000, LO + 0x3000).unwrap();
        assert_eq!((carved.start, carved.end), (LO + 0x1000, LO + 0x3000));
        let bounds: Vec<(u64, u64)> = set.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(bounds, [(LO, LO + 0x1000), (LO + 0x3000, LO + 0x4000)]);
    }

    #[test]
    fn split_remove_adjusts_file_offsets() {
        struct Nothing;
        impl PageProvider for Nothing {
            fn fill_page(&self, _offset: u64, _buf: &mut [u8]) -> Result<(), VmmError> {
                Ok(())
            }
        }

        let mut set = RangeSet::new(LO, HI);
        let mut range = anon(LO, LO + 0x4000);
        range.vm_flags = VmFlags::FILE;
        range.file = Some(FileBacking {
            provider: Arc::new(Nothing),
            offset: 0x8000,
        });
        set.insert(range);

        let carved = set.split_remove(LO + 0x2000, LO + 0x3000).unwrap();
        assert_eq!(carved.file.unwrap().offset, 0x8000 + 0x2000);

        let right = set.find_containing(LO + 0x3000).unwrap();
        assert_eq!(right.file.as_ref().unwrap().offset, 0x8000 + 0x3000);
        assert_eq!(right.file_offset(LO + 0x3000), Some(0x8000 + 0x3000));

        let left = set.find_containing(LO).unwrap();
        assert_eq!(left.file.as_ref().unwrap().offset, 0x8000);
    }

    #[test]
    fn split_remove_fails_across_reservations() {
        let mut set = RangeSet::new(LO, HI);
        set.insert(anon(LO, LO + 0x2000));
        set.insert(anon(LO + 0x2000, LO + 0x4000));
        assert!(set.split_remove(LO + 0x1000, LO + 0x3000).is_none());
    }
}
