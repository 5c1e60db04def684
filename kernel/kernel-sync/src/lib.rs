//! # Kernel Locking Primitives
//!
//! A raw-lock seam plus the two lock shapes the memory subsystem needs:
//!
//! - [`SpinLock`] — short critical sections (PMM section bitmaps, slab
//!   magazine state). Busy-waits, never sleeps.
//! - [`Mutex`] — generic over a [`RawLock`]/[`RawUnlock`] implementation.
//!   VMM spaces use `Mutex<_, RawSpin>` today; when a scheduler exists, a
//!   sleeping raw lock plugs into the same seam without touching callers.
//!
//! There is deliberately no reader/writer split: every VMM access path,
//! including read-only lookups during fault resolution, takes the exclusive
//! lock (see the concurrency notes in the VMM crate).

#![cfg_attr(not(test), no_std)]

mod lock;

pub use lock::{Mutex, MutexGuard, RawLock, RawSpin, RawUnlock, SpinLock};
