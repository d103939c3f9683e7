use std::ptr::{self, NonNull};

use super::allocator::{AllocOptions, Allocator};
use super::error::AllocError;
use super::fixed::{FixedLenAllocator, FreeNode};
use super::stats::AllocStatsSnapshot;
use crate::sync::Arc;
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// [`FixedLenAllocator`] that accepts frees from any thread.
///
/// With [`AllocOptions::FREE_LATER`] set, [`free`](Allocator::free) never
/// touches the slab: the element is pushed onto a lock-free side list and
/// folded back into the free list by the allocating thread, either when the
/// free list runs dry or on an explicit [`really_free`](Self::really_free).
/// The side list is only ever drained as a whole with a single swap, so
/// there is no ABA window.
///
/// A deferred free is checked on the spot when the slab is not busy, so a
/// double free is refused right away. Frees pushed while the owner holds
/// the slab are checked when they are reconciled instead; a bad pointer is
/// logged and dropped at that point.
pub struct BytePool {
    inner: FixedLenAllocator,
    free_later: AtomicPtr<FreeNode>,
    pending: AtomicUsize,
}

// Safety: the side list only holds elements of `inner`, and is accessed
// through atomics.
unsafe impl Send for BytePool {}
// Safety: see above.
unsafe impl Sync for BytePool {}

impl BytePool {
    /// # Errors
    /// `InvalidConfig` when either size is zero.
    pub fn new(element_size: usize, block_size: usize, options: AllocOptions) -> Result<Self, AllocError> {
        Self::with_block_allocator(element_size, block_size, options, None)
    }

    /// # Errors
    /// `InvalidConfig` when either size is zero.
    pub fn with_block_allocator(
        element_size: usize,
        block_size: usize,
        options: AllocOptions,
        block_alloc: Option<Arc<dyn Allocator>>,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            inner: FixedLenAllocator::with_options(element_size, block_size, options, block_alloc)?,
            free_later: AtomicPtr::new(ptr::null_mut()),
            pending: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn element_size(&self) -> usize {
        self.inner.element_size()
    }

    /// Elements handed out, including deferred frees not yet reconciled.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.live_count()
    }

    /// Frees waiting on the side list.
    #[must_use]
    pub fn pending_frees(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Fold every deferred free back into the free list. Returns the number
    /// of elements reclaimed.
    pub fn really_free(&self) -> usize {
        let mut core = self.inner.enter();
        self.reconcile(&mut core)
    }

    fn reconcile(&self, core: &mut super::fixed::FixedLenCore) -> usize {
        let mut node = NonNull::new(self.free_later.swap(ptr::null_mut(), Ordering::Acquire));
        let mut visited = 0;
        let mut reclaimed = 0;
        while let Some(n) = node {
            // Safety: pushed by `free`; the link was written before the
            // release CAS that published it.
            node = unsafe { n.as_ptr().read().next };
            visited += 1;
            // Safety: the element came off the side list and is not used again.
            match unsafe { self.inner.free_in(core, n.cast()) } {
                Ok(()) => reclaimed += 1,
                Err(e @ AllocError::DoubleFree { .. }) => {
                    // A node queued twice has had its link rewritten; the
                    // rest of the list cannot be trusted.
                    log::error!("BytePool: deferred list corrupted at {n:p}: {e}");
                    break;
                }
                Err(e) => log::error!("BytePool: dropping deferred free: {e}"),
            }
        }
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(visited)));
        if reclaimed > 0 {
            log::trace!("BytePool: reclaimed {reclaimed} deferred frees");
        }
        reclaimed
    }

    /// Queue `ptr` for a deferred free, checking it first unless the slab
    /// is busy.
    fn defer_free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        if let Some(mut core) = self.inner.try_enter() {
            core.defer(ptr)?;
        }
        self.push_later(ptr);
        Ok(())
    }

    fn push_later(&self, ptr: NonNull<u8>) {
        // Counted first so reconcile never sees a node it was not told of.
        self.pending.fetch_add(1, Ordering::AcqRel);
        let node = ptr.cast::<FreeNode>();
        let mut head = self.free_later.load(Ordering::Relaxed);
        loop {
            // Safety: the caller gave up the element; its first word is ours.
            unsafe { node.as_ptr().write(FreeNode { next: NonNull::new(head) }) };
            match self
                .free_later
                .compare_exchange_weak(head, node.as_ptr(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }
}

impl Allocator for BytePool {
    fn name(&self) -> &'static str {
        "BytePool"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut core = self.inner.enter();
        if core.free_list_is_empty() && self.options().contains(AllocOptions::FREE_LATER) {
            self.reconcile(&mut core);
        }
        self.inner.alloc_in(&mut core, size)
    }

    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        // Safety: upheld by caller.
        unsafe { self.inner.grow(ptr, new_size) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        if self.options().contains(AllocOptions::FREE_LATER) {
            self.defer_free(ptr)
        } else {
            // Safety: upheld by caller.
            unsafe { self.inner.free(ptr) }
        }
    }

    fn free_all(&self) {
        self.free_later.store(ptr::null_mut(), Ordering::Release);
        self.pending.store(0, Ordering::Release);
        self.inner.free_all();
    }

    fn options(&self) -> AllocOptions {
        self.inner.options()
    }

    fn set_options(&self, options: AllocOptions) {
        if !options.contains(AllocOptions::FREE_LATER) {
            self.really_free();
        }
        self.inner.set_options(options);
    }

    fn block_allocator(&self) -> Option<Arc<dyn Allocator>> {
        self.inner.block_allocator()
    }

    fn set_block_allocator(&self, alloc: Option<Arc<dyn Allocator>>) {
        self.inner.set_block_allocator(alloc);
    }

    fn stats(&self) -> AllocStatsSnapshot {
        self.inner.stats()
    }

    fn reset_stats(&self) {
        self.inner.reset_stats();
    }
}
