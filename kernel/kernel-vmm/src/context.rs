//! Address spaces, per-process contexts and the per-CPU view of them.

use core::cell::Cell;
use core::ptr::NonNull;

use kernel_addresses::VirtualAddress;
use kernel_info::memory::{USERSPACE_END, USERSPACE_START};
use kernel_mmu::{Directory, MmuBackend, PageFlags};
use kernel_sync::{MutexGuard, RawSpin, SpinLock};

use crate::range::RangeSet;
use crate::{VmFlags, Vmm, VmmError};

/// One address space: fixed bounds plus its reservation list. All access to
/// the reservations goes through the single lock, including read-only
/// lookups during fault resolution.
pub struct Space {
    start: u64,
    end: u64,
    ranges: SpinLock<RangeSet>,
}

impl Space {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ranges: SpinLock::new(RangeSet::new(start, end)),
        }
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RangeSet, RawSpin> {
        self.ranges.lock()
    }
}

/// A process's memory image: its user address space and the directory that
/// realizes it. Lives in the VMM's context slab.
pub struct VmmContext {
    pub(crate) space: Space,
    pub(crate) dir: Directory,
}

/// Owning handle to a slab-resident [`VmmContext`]. The process table holds
/// one per process; the VMM consumes it again in
/// [`Vmm::destroy_context`].
pub struct ContextHandle(pub(crate) NonNull<VmmContext>);

// Safety: the pointee is internally synchronized (space lock) and the
// directory handle is plain data; handles may travel between CPUs.
unsafe impl Send for ContextHandle {}
unsafe impl Sync for ContextHandle {}

impl ContextHandle {
    pub(crate) fn get(&self) -> &VmmContext {
        // Safety: the handle owns a live slab allocation until
        // `destroy_context` consumes it.
        unsafe { self.0.as_ref() }
    }

    /// The translation root backing this context.
    #[must_use]
    pub fn directory(&self) -> Directory {
        self.get().dir
    }
}

/// Per-CPU state. Not shareable between CPUs; each CPU owns exactly one.
pub struct Processor {
    id: usize,
    /// `None` while running in the bare kernel context.
    pub(crate) current: Cell<Option<NonNull<VmmContext>>>,
}

impl Processor {
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self {
            id,
            current: Cell::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn current_ctx(&self) -> Option<&VmmContext> {
        // Safety: a context stays live while any CPU has it current;
        // `destroy_context` switches away first.
        self.current.get().map(|ptr| unsafe { ptr.as_ref() })
    }
}

impl<B: MmuBackend> Vmm<'_, B> {
    /// Build a fresh user context: empty user space, new directory with the
    /// kernel half shared in.
    pub fn create_context(&self, proc: &Processor) -> Result<ContextHandle, VmmError> {
        let slot = self.contexts.allocate(proc.id())?;
        let dir = match self.backend.new_directory() {
            Ok(dir) => dir,
            Err(err) => {
                // Safety: uninitialized slot going straight back.
                unsafe { self.contexts.free(proc.id(), slot) };
                return Err(err.into());
            }
        };
        self.backend.copy_kernel_mappings(dir);

        // Safety: the slot is uninitialized memory owned by us.
        unsafe {
            slot.as_ptr().write(VmmContext {
                space: Space::new(USERSPACE_START, USERSPACE_END),
                dir,
            });
        }
        log::debug!("vmm: created context with directory {}", dir.address());
        Ok(ContextHandle(slot))
    }

    /// Tear a context down: release every backed page, free the directory's
    /// tables and return the context to the slab. Switches to the kernel
    /// context first if `handle` is current on this CPU.
    pub fn destroy_context(&self, proc: &Processor, handle: ContextHandle) {
        if proc.current.get() == Some(handle.0) {
            self.switch(proc, None);
        }

        let ctx = handle.get();
        let dir = Some(ctx.dir);
        {
            let mut ranges = ctx.space.lock();
            while let Some(range) = ranges.pop() {
                for page in range.pages() {
                    let va = VirtualAddress::new(page);
                    if !self.backend.read_flags(dir, va).contains(PageFlags::PRESENT) {
                        continue;
                    }
                    if let Some(pa) = self.backend.physical_of(dir, va) {
                        self.backend.unmap(dir, va);
                        if !range.vm_flags.contains(VmFlags::DEVICE) {
                            self.pmm.release(pa);
                        }
                    }
                }
            }
        }
        self.backend.destroy_directory(ctx.dir);
        log::debug!("vmm: destroyed context with directory {}", ctx.dir.address());

        // Safety: the handle is consumed; nothing can reach the context
        // after this point.
        unsafe {
            core::ptr::drop_in_place(handle.0.as_ptr());
            self.contexts.free(proc.id(), handle.0);
        }
    }
}
