//! Error taxonomy of the virtual memory manager.
//!
//! Resource exhaustion and losing a race for an exact address are the
//! caller's problem and come back as `Err`. Corrupted bookkeeping (an
//! overlapping range, an unmap of something never mapped under the fatal
//! policy) is a kernel bug and panics instead.

use kernel_mmu::MmuError;
use kernel_pmm::PmmError;
use kernel_slab::SlabError;

#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfMemory,

    #[error("no free virtual address space for a {0:#x} byte request")]
    NoVirtualSpace(u64),

    #[error("requested exact address is already in use")]
    ExactUnavailable,

    #[error("invalid address range")]
    InvalidRange,

    #[error("address belongs to no managed address space")]
    NoSpace,

    #[error("backing provider failed to supply a page")]
    FillFailed,
}

impl From<PmmError> for VmmError {
    fn from(_: PmmError) -> Self {
        Self::OutOfMemory
    }
}

impl From<MmuError> for VmmError {
    fn from(err: MmuError) -> Self {
        match err {
            MmuError::OutOfMemory(_) => Self::OutOfMemory,
        }
    }
}

impl From<SlabError> for VmmError {
    fn from(_: SlabError) -> Self {
        Self::OutOfMemory
    }
}
