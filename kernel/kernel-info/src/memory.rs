//! # Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │      (first 64 KiB unmapped)    │
//! USERSPACE_START       ├─────────────────────────────────┤
//!                       │        User space               │
//!                       │  (lazily backed process ranges) │
//! USERSPACE_END         ├─────────────────────────────────┤
//!                       │     non-canonical hole          │
//! HHDM_BASE             ├─────────────────────────────────┤
//!                       │   Higher Half Direct Map        │
//!                       │  (kernel window onto phys mem)  │
//! KERNEL_SPACE_START    ├─────────────────────────────────┤
//!                       │   Kernel-managed mappings       │
//!                       │  (eagerly backed VMM ranges)    │
//! KERNEL_SPACE_END      ├─────────────────────────────────┤
//!                       │   Kernel image, stacks, …       │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

/// First virtual address handed to user mappings. The zero page (and a bit
/// more) stays unmapped so null dereferences always fault.
pub const USERSPACE_START: u64 = 0x0000_0000_0001_0000;

/// Exclusive end of the user VA range.
pub const USERSPACE_END: u64 = 0x0000_7fff_ffff_f000;

/// Base of the Higher Half Direct Map. Anything mapped at
/// [`HHDM_BASE`] + `pa` lets the kernel reach physical memory via a fixed
/// offset; the MMU backend hands out window addresses from here.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the interval the kernel VMM hands out mappings from
/// (slabs, MMIO windows, DMA buffers).
pub const KERNEL_SPACE_START: u64 = 0xffff_c900_0000_0000;

/// Exclusive end of the kernel-managed interval (64 GiB window).
pub const KERNEL_SPACE_END: u64 = 0xffff_c910_0000_0000;

const _: () = {
    assert!(USERSPACE_START < USERSPACE_END);
    assert!(USERSPACE_END <= HHDM_BASE);
    assert!(HHDM_BASE < KERNEL_SPACE_START);
    assert!(KERNEL_SPACE_START < KERNEL_SPACE_END);
    assert!(USERSPACE_START % kernel_addresses::PAGE_SIZE == 0);
    assert!(USERSPACE_END % kernel_addresses::PAGE_SIZE == 0);
    assert!(KERNEL_SPACE_START % kernel_addresses::PAGE_SIZE == 0);
    assert!(KERNEL_SPACE_END % kernel_addresses::PAGE_SIZE == 0);
};
