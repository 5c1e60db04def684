//! Page-table entry and table layout for the 4-level paged backend.

use bitfield_struct::bitfield;
use kernel_addresses::PhysicalAddress;

use crate::PageFlags;

/// Entries per table at every level (9 index bits).
pub const TABLE_ENTRIES: usize = 512;

/// One 64-bit translation entry. The same layout is used at every level;
/// large-page bits are unused (the backend maps 4 KiB pages only).
#[bitfield(u64)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,

    /// Page-size bit; always zero here.
    #[bits(1)]
    __ps_must_be_0: u8,

    pub global: bool,

    #[bits(3)]
    __avl_8_11: u8,

    /// Physical frame number (bits 12..52 of the frame address).
    #[bits(40)]
    pub frame: u64,

    #[bits(11)]
    __avl_52_62: u16,

    pub no_execute: bool,
}

impl PageEntry {
    /// Build a leaf entry for `phys` with `flags`.
    #[must_use]
    pub fn from_parts(phys: PhysicalAddress, flags: PageFlags) -> Self {
        Self::new()
            .with_present(flags.contains(PageFlags::PRESENT))
            .with_writable(flags.contains(PageFlags::WRITABLE))
            .with_user(flags.contains(PageFlags::USER))
            .with_write_through(flags.contains(PageFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(PageFlags::NO_CACHE))
            .with_global(flags.contains(PageFlags::GLOBAL))
            .with_no_execute(flags.contains(PageFlags::NO_EXECUTE))
            .with_frame(phys.as_u64() >> 12)
    }

    /// The protection bits as portable flags.
    #[must_use]
    pub fn protection(self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::PRESENT, self.present());
        flags.set(PageFlags::WRITABLE, self.writable());
        flags.set(PageFlags::USER, self.user());
        flags.set(PageFlags::WRITE_THROUGH, self.write_through());
        flags.set(PageFlags::NO_CACHE, self.cache_disable());
        flags.set(PageFlags::GLOBAL, self.global());
        flags.set(PageFlags::NO_EXECUTE, self.no_execute());
        flags
    }

    /// Base address of the referenced frame.
    #[must_use]
    pub fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }
}

/// One table frame: 512 entries, page sized and page aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageEntry; TABLE_ENTRIES],
}

impl PageTable {
    pub const ZERO: Self = Self {
        entries: [PageEntry::new(); TABLE_ENTRIES],
    };
}
