use std::cell::RefCell;
use std::ptr::NonNull;

use super::allocator::{AllocOptions, Allocator};
use super::error::AllocError;
use super::os_heap::{OS_HEAP_HEADER, OsHeap};
use super::pool::{ALLOC_MAX_POOLS, PoolAllocator, PoolConfig};
use super::stats::{AllocStatsSnapshot, THREAD_HEAPS_LIVE};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::thread::{self, ThreadId};

/// Default size of each thread's private heap.
pub const DEFAULT_TLS_HEAP_SIZE: usize = 64 * 1024;

crate::sync::static_atomic! {
    static TLS_HEAP_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_TLS_HEAP_SIZE);
}

/// Heap size used by threads that create their allocator after this call.
pub(crate) fn set_default_heap_size(bytes: usize) {
    TLS_HEAP_SIZE.store(bytes, Ordering::Relaxed);
}

/// Per-thread allocator over a private OS heap.
///
/// Size-class pools without locking, carved from the thread's own mappings.
/// Only the creating thread may allocate or free; other threads get
/// [`AllocError::WrongThread`]. The heap is released when the thread exits.
pub struct ThreadAllocator {
    owner: ThreadId,
    heap_size: usize,
    heap: Arc<OsHeap>,
    pools: PoolAllocator,
}

impl ThreadAllocator {
    /// Allocator owned by the calling thread. The heap is split evenly
    /// between the size-class pools.
    ///
    /// # Errors
    /// `InvalidConfig` when `heap_size` is too small to hold a block per pool.
    pub fn new(heap_size: usize) -> Result<Self, AllocError> {
        let heap = Arc::new(OsHeap::new());
        let config = PoolConfig {
            block_bytes: (heap_size / ALLOC_MAX_POOLS).saturating_sub(OS_HEAP_HEADER),
            ..PoolConfig::default()
        };
        let pools = PoolAllocator::with_block_allocator(config, heap.clone())?;
        Ok(Self {
            owner: thread::current().id(),
            heap_size,
            heap,
            pools,
        })
    }

    /// The calling thread's allocator, created on first use.
    ///
    /// # Errors
    /// Propagates construction failures.
    pub fn current() -> Result<Arc<Self>, AllocError> {
        THREAD_HEAP.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(alloc) = &slot.0 {
                return Ok(Arc::clone(alloc));
            }
            let alloc = Arc::new(Self::new(TLS_HEAP_SIZE.load(Ordering::Relaxed))?);
            THREAD_HEAPS_LIVE.add(1);
            log::debug!("ThreadAllocator: created {} byte heap for {:?}", alloc.heap_size, alloc.owner);
            slot.0 = Some(Arc::clone(&alloc));
            Ok(alloc)
        })
    }

    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Statistics of the underlying OS heap.
    #[must_use]
    pub fn heap_stats(&self) -> AllocStatsSnapshot {
        self.heap.stats()
    }

    fn check_owner(&self) -> Result<(), AllocError> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(AllocError::WrongThread)
        }
    }
}

impl Allocator for ThreadAllocator {
    fn name(&self) -> &'static str {
        "ThreadAllocator"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.check_owner()?;
        self.pools.alloc(size)
    }

    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        self.check_owner()?;
        // Safety: upheld by caller.
        unsafe { self.pools.grow(ptr, new_size) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.check_owner()?;
        // Safety: upheld by caller.
        unsafe { self.pools.free(ptr) }
    }

    fn free_all(&self) {
        self.pools.free_all();
    }

    fn options(&self) -> AllocOptions {
        self.pools.options()
    }

    fn set_options(&self, options: AllocOptions) {
        self.pools.set_options(options);
    }

    fn block_allocator(&self) -> Option<Arc<dyn Allocator>> {
        self.pools.block_allocator()
    }

    fn set_block_allocator(&self, alloc: Option<Arc<dyn Allocator>>) {
        self.pools.set_block_allocator(Some(alloc.unwrap_or_else(|| self.heap.clone())));
    }

    fn stats(&self) -> AllocStatsSnapshot {
        self.pools.stats()
    }

    fn reset_stats(&self) {
        self.pools.reset_stats();
    }
}

struct ThreadHeap(Option<Arc<ThreadAllocator>>);

impl Drop for ThreadHeap {
    fn drop(&mut self) {
        if let Some(alloc) = self.0.take() {
            log::debug!("ThreadAllocator: releasing heap of exiting thread {:?}", alloc.owner);
            alloc.free_all();
            THREAD_HEAPS_LIVE.sub(1);
        }
    }
}

thread_local! {
    static THREAD_HEAP: RefCell<ThreadHeap> = const { RefCell::new(ThreadHeap(None)) };
}
