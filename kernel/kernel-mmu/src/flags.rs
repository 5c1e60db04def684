//! Flag and fault types shared across the MMU seam.

use kernel_addresses::VirtualAddress;

bitflags::bitflags! {
    /// Hardware-facing page protection bits. The bit positions follow the
    /// long-mode page-table-entry layout so conversion is a mask, but
    /// nothing outside the backend relies on that.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Baseline for kernel data pages.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::NO_EXECUTE)
    }

    /// Baseline for user data pages.
    #[must_use]
    pub const fn user_data() -> Self {
        Self::PRESENT
            .union(Self::WRITABLE)
            .union(Self::USER)
            .union(Self::NO_EXECUTE)
    }

    /// Uncached mapping for device registers.
    #[must_use]
    pub const fn device() -> Self {
        Self::PRESENT
            .union(Self::WRITABLE)
            .union(Self::NO_CACHE)
            .union(Self::NO_EXECUTE)
    }
}

bitflags::bitflags! {
    /// What a faulting (or validated) access was trying to do. An empty set
    /// is a plain read.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Access: u8 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
    }
}

/// CPU mode at the time of an access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Privilege {
    User,
    Kernel,
}

/// Everything the fault resolver needs to know about a page fault, decoded
/// from the architecture's trap frame by the entry stub.
#[derive(Copy, Clone, Debug)]
pub struct FaultInfo {
    /// The address that was touched (not page aligned).
    pub address: VirtualAddress,
    pub access: Access,
    pub privilege: Privilege,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_flag_combinations() {
        assert!(PageFlags::kernel_data().contains(PageFlags::WRITABLE));
        assert!(!PageFlags::kernel_data().contains(PageFlags::USER));
        assert!(PageFlags::user_data().contains(PageFlags::USER));
        assert!(PageFlags::device().contains(PageFlags::NO_CACHE));
    }

    #[test]
    fn read_access_is_the_empty_set() {
        let read = Access::empty();
        assert!(!read.contains(Access::WRITE));
        assert!(!read.contains(Access::EXECUTE));
    }
}
