//! Magazine layer: per-CPU stacks of recently freed objects, exchanged
//! wholesale with a shared depot.

use core::ptr;

use kernel_sync::SpinLock;

/// Objects per magazine. Small enough that a stranded magazine wastes
/// little memory, large enough to amortize depot traffic.
pub const MAGAZINE_ROUNDS: usize = 8;

/// A fixed-capacity LIFO of object pointers. Lives in backing memory and is
/// linked through `next` while parked in the depot.
pub(crate) struct Magazine {
    pub(crate) next: *mut Magazine,
    pub(crate) rounds: usize,
    pub(crate) objects: [*mut u8; MAGAZINE_ROUNDS],
}

impl Magazine {
    pub(crate) fn init(&mut self) {
        self.next = ptr::null_mut();
        self.rounds = 0;
        self.objects = [ptr::null_mut(); MAGAZINE_ROUNDS];
    }

    pub(crate) const fn is_full(&self) -> bool {
        self.rounds == MAGAZINE_ROUNDS
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.rounds == 0
    }

    pub(crate) fn push(&mut self, obj: *mut u8) {
        debug_assert!(!self.is_full());
        self.objects[self.rounds] = obj;
        self.rounds += 1;
    }

    pub(crate) fn pop(&mut self) -> *mut u8 {
        debug_assert!(!self.is_empty());
        self.rounds -= 1;
        self.objects[self.rounds]
    }
}

/// One CPU's pair of magazines. `loaded` serves the fast path; `previous`
/// is the spare swapped in when `loaded` runs dry (or fills up on free),
/// halving depot round trips for ping-pong workloads.
pub(crate) struct CpuMagazines {
    pub(crate) loaded: *mut Magazine,
    pub(crate) previous: *mut Magazine,
}

pub(crate) struct CpuCache {
    pub(crate) mags: SpinLock<CpuMagazines>,
}

impl CpuCache {
    pub(crate) const fn new() -> Self {
        Self {
            mags: SpinLock::new(CpuMagazines {
                loaded: ptr::null_mut(),
                previous: ptr::null_mut(),
            }),
        }
    }
}

/// Shared store of full and empty magazines, singly linked through
/// [`Magazine::next`].
pub(crate) struct Depot {
    pub(crate) full: *mut Magazine,
    pub(crate) empty: *mut Magazine,
}

impl Depot {
    pub(crate) const fn new() -> Self {
        Self {
            full: ptr::null_mut(),
            empty: ptr::null_mut(),
        }
    }
}

/// Push `mag` onto an intrusive depot list.
///
/// # Safety
/// `mag` must be a live magazine not currently on any list.
pub(crate) unsafe fn depot_push(list: &mut *mut Magazine, mag: *mut Magazine) {
    // Safety: caller guarantees `mag` is live and unlinked.
    unsafe {
        (*mag).next = *list;
    }
    *list = mag;
}

/// Pop from an intrusive depot list, or null when empty.
pub(crate) fn depot_pop(list: &mut *mut Magazine) -> *mut Magazine {
    let mag = *list;
    if !mag.is_null() {
        // Safety: non-null list entries are live magazines.
        unsafe {
            *list = (*mag).next;
            (*mag).next = ptr::null_mut();
        }
    }
    mag
}
