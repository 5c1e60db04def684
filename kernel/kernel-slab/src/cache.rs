//! Slab layer: block geometry, free-list threading and the cache front-end
//! that stitches the magazine layer on top.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use kernel_addresses::PAGE_SIZE;
use kernel_sync::SpinLock;

use crate::magazine::{CpuCache, Depot, Magazine, depot_pop, depot_push};
use crate::{SLAB_MAX_FREE, SlabBacking, SlabError};

/// Header at the start of every slab block. Objects follow at
/// `obj_offset`; `free()` finds this header by masking the object address
/// down to the block boundary.
pub(crate) struct SlabHeader {
    next: *mut SlabHeader,
    prev: *mut SlabHeader,
    free_list: *mut FreeSlot,
    free_count: usize,
}

/// Free objects double as list nodes; no side allocation needed.
struct FreeSlot {
    next: *mut FreeSlot,
}

/// Push onto a doubly-linked slab list.
///
/// # Safety
/// `slab` must be live and not on any list.
unsafe fn list_push(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    // Safety: caller guarantees `slab` is live and unlinked.
    unsafe {
        (*slab).prev = ptr::null_mut();
        (*slab).next = *head;
        if !(*head).is_null() {
            (**head).prev = slab;
        }
    }
    *head = slab;
}

/// Unlink from a doubly-linked slab list.
///
/// # Safety
/// `slab` must be on the list headed by `head`.
unsafe fn list_unlink(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    // Safety: caller guarantees membership; neighbors are live.
    unsafe {
        let prev = (*slab).prev;
        let next = (*slab).next;
        if prev.is_null() {
            *head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*slab).next = ptr::null_mut();
        (*slab).prev = ptr::null_mut();
    }
}

/// Slab-layer state, guarded by one lock per cache. The magazine layer in
/// front keeps this lock off the fast path.
struct CacheInner {
    partial: *mut SlabHeader,
    full: *mut SlabHeader,
    free: *mut SlabHeader,
    free_slabs: usize,
    total_slabs: usize,
    total_objects: usize,
    in_use: usize,
}

/// Cache counters. `in_use` counts objects checked out of the slab layer,
/// which includes objects parked in magazines.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabStats {
    pub total_objects: usize,
    pub in_use: usize,
    pub total_slabs: usize,
    pub free_slabs: usize,
}

/// An object cache for values of type `T`.
pub struct SlabCache<T, B = crate::HeapBacking> {
    name: &'static str,
    obj_size: usize,
    obj_offset: usize,
    objs_per_slab: usize,
    /// Power of two; blocks are allocated at this alignment so object
    /// pointers mask down to their header.
    slab_size: usize,
    ctor: Option<fn(NonNull<T>)>,
    dtor: Option<fn(NonNull<T>)>,
    inner: SpinLock<CacheInner>,
    cpus: Vec<CpuCache>,
    depot: SpinLock<Depot>,
    backing: B,
    _marker: PhantomData<T>,
}

// Safety: all shared state is behind spin locks; raw pointers never leave
// the cache except as handed-out objects.
unsafe impl<T: Send, B: SlabBacking> Send for SlabCache<T, B> {}
unsafe impl<T: Send, B: SlabBacking> Sync for SlabCache<T, B> {}

impl<T> SlabCache<T, crate::HeapBacking> {
    /// Heap-backed cache; `cpus` sizes the per-CPU magazine array.
    #[must_use]
    pub fn new(name: &'static str, cpus: usize) -> Self {
        Self::with_backing(name, cpus, crate::HeapBacking)
    }
}

impl<T, B: SlabBacking> SlabCache<T, B> {
    #[must_use]
    pub fn with_backing(name: &'static str, cpus: usize, backing: B) -> Self {
        Self::with_hooks(name, cpus, backing, None, None)
    }

    /// Cache with construct/destruct hooks. `ctor` runs on every object a
    /// caller receives, `dtor` on every object a caller returns.
    #[must_use]
    pub fn with_hooks(
        name: &'static str,
        cpus: usize,
        backing: B,
        ctor: Option<fn(NonNull<T>)>,
        dtor: Option<fn(NonNull<T>)>,
    ) -> Self {
        assert!(cpus > 0, "slab cache needs at least one CPU slot");

        let obj_align = mem::align_of::<T>().max(mem::align_of::<FreeSlot>());
        let obj_size = mem::size_of::<T>()
            .max(mem::size_of::<FreeSlot>())
            .next_multiple_of(obj_align);
        let obj_offset = mem::size_of::<SlabHeader>().next_multiple_of(obj_align);

        let mut slab_size = PAGE_SIZE as usize;
        while slab_size < obj_offset + obj_size {
            slab_size *= 2;
        }
        // Favor a handful of objects per slab, within reason.
        while (slab_size - obj_offset) / obj_size < 8 && slab_size < 8 * PAGE_SIZE as usize {
            slab_size *= 2;
        }
        let objs_per_slab = (slab_size - obj_offset) / obj_size;
        assert!(obj_align <= slab_size);

        log::debug!(
            "slab: cache '{name}' obj_size={obj_size} slab_size={slab_size} \
             objs_per_slab={objs_per_slab}"
        );

        Self {
            name,
            obj_size,
            obj_offset,
            objs_per_slab,
            slab_size,
            ctor,
            dtor,
            inner: SpinLock::new(CacheInner {
                partial: ptr::null_mut(),
                full: ptr::null_mut(),
                free: ptr::null_mut(),
                free_slabs: 0,
                total_slabs: 0,
                total_objects: 0,
                in_use: 0,
            }),
            cpus: (0..cpus).map(|_| CpuCache::new()).collect(),
            depot: SpinLock::new(Depot::new()),
            backing,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocate one object on behalf of `cpu`. Contents are uninitialized
    /// unless a ctor was installed.
    pub fn allocate(&self, cpu: usize) -> Result<NonNull<T>, SlabError> {
        let raw = self.magazine_allocate(cpu)?;
        // Safety: every internal path yields a non-null object pointer.
        let obj = unsafe { NonNull::new_unchecked(raw.cast::<T>()) };
        if let Some(ctor) = self.ctor {
            ctor(obj);
        }
        Ok(obj)
    }

    /// Return an object to the cache.
    ///
    /// # Safety
    /// `obj` must come from `allocate` on this cache and must not be used
    /// afterwards. The caller is responsible for having dropped any owned
    /// contents (the dtor hook may do this).
    pub unsafe fn free(&self, cpu: usize, obj: NonNull<T>) {
        if let Some(dtor) = self.dtor {
            dtor(obj);
        }
        self.magazine_free(cpu, obj.as_ptr().cast::<u8>());
    }

    /// Flush depot magazines back into the slab layer, letting fully free
    /// slabs return to the backing. Called under memory pressure.
    pub fn reap(&self) {
        loop {
            let mag = {
                let mut depot = self.depot.lock();
                depot_pop(&mut depot.full)
            };
            if mag.is_null() {
                break;
            }
            // Safety: popped magazines are live and owned by us now.
            unsafe { self.drain_magazine(mag) };
        }
    }

    #[must_use]
    pub fn stats(&self) -> SlabStats {
        let inner = self.inner.lock();
        SlabStats {
            total_objects: inner.total_objects,
            in_use: inner.in_use,
            total_slabs: inner.total_slabs,
            free_slabs: inner.free_slabs,
        }
    }

    /// Tear the cache down, returning every block to the backing.
    ///
    /// # Safety
    /// All objects must have been freed back to the cache.
    pub unsafe fn destroy(self) {
        // Safety: by contract no objects are live; magazines and slabs are
        // exclusively ours (`self` is owned).
        unsafe {
            for cpu in &self.cpus {
                let (loaded, previous) = {
                    let mut mags = cpu.mags.lock();
                    (
                        mem::replace(&mut mags.loaded, ptr::null_mut()),
                        mem::replace(&mut mags.previous, ptr::null_mut()),
                    )
                };
                self.drain_magazine(loaded);
                self.drain_magazine(previous);
            }
            loop {
                let mag = {
                    let mut depot = self.depot.lock();
                    depot_pop(&mut depot.full)
                };
                if mag.is_null() {
                    break;
                }
                self.drain_magazine(mag);
            }
            loop {
                let mag = {
                    let mut depot = self.depot.lock();
                    depot_pop(&mut depot.empty)
                };
                if mag.is_null() {
                    break;
                }
                self.release_magazine(mag);
            }

            let (free, partial, full, in_use) = {
                let inner = self.inner.lock();
                (inner.free, inner.partial, inner.full, inner.in_use)
            };
            debug_assert_eq!(
                in_use, 0,
                "slab cache '{}' destroyed with live objects",
                self.name
            );
            for head in [free, partial, full] {
                let mut slab = head;
                while !slab.is_null() {
                    let next = (*slab).next;
                    self.backing.release(
                        NonNull::new_unchecked(slab.cast::<u8>()),
                        self.slab_size,
                        self.slab_size,
                    );
                    slab = next;
                }
            }
        }
    }

    // ---- magazine layer ----------------------------------------------

    fn magazine_allocate(&self, cpu: usize) -> Result<*mut u8, SlabError> {
        let cache = &self.cpus[cpu];
        {
            let mut mags = cache.mags.lock();
            // Safety: non-null magazine pointers are live magazines owned by
            // this CPU slot while its lock is held.
            unsafe {
                if !mags.loaded.is_null() && !(*mags.loaded).is_empty() {
                    return Ok((*mags.loaded).pop());
                }
                if !mags.previous.is_null() && !(*mags.previous).is_empty() {
                    let mags = &mut *mags;
                    mem::swap(&mut mags.loaded, &mut mags.previous);
                    return Ok((*mags.loaded).pop());
                }
                // Lock order is CPU cache, then depot; same on the free side.
                let mut depot = self.depot.lock();
                let full = depot_pop(&mut depot.full);
                if !full.is_null() {
                    if !mags.loaded.is_null() {
                        depot_push(&mut depot.empty, mags.loaded);
                    }
                    drop(depot);
                    mags.loaded = full;
                    return Ok((*mags.loaded).pop());
                }
            }
        }
        self.slab_allocate()
    }

    fn magazine_free(&self, cpu: usize, obj: *mut u8) {
        let cache = &self.cpus[cpu];
        let mut mags = cache.mags.lock();
        // Safety: see `magazine_allocate`.
        unsafe {
            if !mags.loaded.is_null() && !(*mags.loaded).is_full() {
                (*mags.loaded).push(obj);
                return;
            }
            if !mags.previous.is_null() && !(*mags.previous).is_full() {
                let mags = &mut *mags;
                mem::swap(&mut mags.loaded, &mut mags.previous);
                (*mags.loaded).push(obj);
                return;
            }

            let mut empty = {
                let mut depot = self.depot.lock();
                depot_pop(&mut depot.empty)
            };
            if empty.is_null() {
                empty = self.allocate_magazine();
            }
            if empty.is_null() {
                // No buffering possible; bypass straight to the slab layer.
                drop(mags);
                self.slab_free(obj);
                return;
            }

            // The just-filled magazine becomes the spare; the old spare is
            // full (or it would have been swapped in above) and retires.
            if !mags.previous.is_null() {
                let retired = mem::replace(&mut mags.previous, ptr::null_mut());
                let mut depot = self.depot.lock();
                depot_push(&mut depot.full, retired);
            }
            let mags = &mut *mags;
            mags.previous = mem::replace(&mut mags.loaded, empty);
            (*mags.loaded).push(obj);
        }
    }

    fn allocate_magazine(&self) -> *mut Magazine {
        match self
            .backing
            .allocate(mem::size_of::<Magazine>(), mem::align_of::<Magazine>())
        {
            Some(block) => {
                let mag = block.as_ptr().cast::<Magazine>();
                // Safety: freshly allocated, properly sized and aligned.
                unsafe { (*mag).init() };
                mag
            }
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    /// `mag` must be live, owned by the caller, and off every list.
    unsafe fn drain_magazine(&self, mag: *mut Magazine) {
        if mag.is_null() {
            return;
        }
        // Safety: caller owns the magazine.
        unsafe {
            while !(*mag).is_empty() {
                self.slab_free((*mag).pop());
            }
            self.release_magazine(mag);
        }
    }

    /// # Safety
    /// `mag` must be empty, live, and off every list.
    unsafe fn release_magazine(&self, mag: *mut Magazine) {
        // Safety: allocated in `allocate_magazine` with this exact layout.
        unsafe {
            self.backing.release(
                NonNull::new_unchecked(mag.cast::<u8>()),
                mem::size_of::<Magazine>(),
                mem::align_of::<Magazine>(),
            );
        }
    }

    // ---- slab layer --------------------------------------------------

    fn slab_allocate(&self) -> Result<*mut u8, SlabError> {
        let mut inner = self.inner.lock();
        if inner.partial.is_null() {
            let spare = inner.free;
            if spare.is_null() {
                self.grow(&mut inner)?;
            } else {
                // Safety: `spare` heads the free list.
                unsafe {
                    list_unlink(&mut inner.free, spare);
                    list_push(&mut inner.partial, spare);
                }
                inner.free_slabs -= 1;
            }
        }

        let slab = inner.partial;
        // Safety: `slab` is a live partial slab with a non-empty free list.
        unsafe {
            let slot = (*slab).free_list;
            debug_assert!(!slot.is_null());
            (*slab).free_list = (*slot).next;
            (*slab).free_count -= 1;
            if (*slab).free_count == 0 {
                list_unlink(&mut inner.partial, slab);
                list_push(&mut inner.full, slab);
            }
            inner.in_use += 1;
            Ok(slot.cast::<u8>())
        }
    }

    fn slab_free(&self, obj: *mut u8) {
        let slab = obj
            .map_addr(|a| a & !(self.slab_size - 1))
            .cast::<SlabHeader>();
        let mut inner = self.inner.lock();
        // Safety: `obj` came out of this cache, so masking to the slab
        // boundary lands on its header.
        unsafe {
            let slot = obj.cast::<FreeSlot>();
            (*slot).next = (*slab).free_list;
            (*slab).free_list = slot;
            let was_full = (*slab).free_count == 0;
            (*slab).free_count += 1;
            inner.in_use -= 1;

            if was_full {
                list_unlink(&mut inner.full, slab);
                list_push(&mut inner.partial, slab);
            }
            if (*slab).free_count == self.objs_per_slab {
                list_unlink(&mut inner.partial, slab);
                if inner.free_slabs < SLAB_MAX_FREE {
                    list_push(&mut inner.free, slab);
                    inner.free_slabs += 1;
                } else {
                    inner.total_slabs -= 1;
                    inner.total_objects -= self.objs_per_slab;
                    drop(inner);
                    self.backing.release(
                        NonNull::new_unchecked(slab.cast::<u8>()),
                        self.slab_size,
                        self.slab_size,
                    );
                }
            }
        }
    }

    fn grow(&self, inner: &mut CacheInner) -> Result<(), SlabError> {
        let Some(block) = self.backing.allocate(self.slab_size, self.slab_size) else {
            log::error!("slab: cache '{}' failed to grow", self.name);
            return Err(SlabError::OutOfMemory { cache: self.name });
        };

        let header = block.as_ptr().cast::<SlabHeader>();
        // Safety: the block is exclusively ours, sized for the header plus
        // `objs_per_slab` objects.
        unsafe {
            header.write(SlabHeader {
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                free_list: ptr::null_mut(),
                free_count: self.objs_per_slab,
            });
            let base = block.as_ptr().add(self.obj_offset);
            let mut head: *mut FreeSlot = ptr::null_mut();
            for i in (0..self.objs_per_slab).rev() {
                let slot = base.add(i * self.obj_size).cast::<FreeSlot>();
                (*slot).next = head;
                head = slot;
            }
            (*header).free_list = head;
            list_push(&mut inner.partial, header);
        }

        inner.total_slabs += 1;
        inner.total_objects += self.objs_per_slab;
        Ok(())
    }
}
