use std::ptr::NonNull;

use super::allocator::{AllocOptions, Allocator, MAX_ALIGN};
use super::error::AllocError;
use super::stats::{AllocStats, AllocStatsSnapshot, SYSTEM_HEAP_BYTES};
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::{Arc, OnceLock};

/// Every block carries its size in a header this long, keeping the user
/// pointer at `MAX_ALIGN`.
const HEADER: usize = MAX_ALIGN;

/// Root of the allocator hierarchy: thin wrapper over the system heap.
///
/// The process has one shared instance ([`GlobalAllocator::get`]) which every
/// other allocator uses as its default block allocator. The system heap is
/// itself thread-safe, so the wrapper never locks.
pub struct GlobalAllocator {
    options: AtomicU32,
    stats: AllocStats,
}

static GLOBAL: OnceLock<Arc<GlobalAllocator>> = OnceLock::new();

impl GlobalAllocator {
    /// The process-wide instance, created on first use.
    #[must_use]
    pub fn get() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::detached())))
    }

    /// A separate instance over the same system heap with its own statistics.
    /// Used by isolated [`CoreContext`](crate::CoreContext)s.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            options: AtomicU32::new(0),
            stats: AllocStats::new(),
        }
    }

    /// Size requested for a live allocation.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of a `GlobalAllocator`.
    #[must_use]
    pub unsafe fn size_of_ptr(&self, ptr: NonNull<u8>) -> usize {
        // Safety: upheld by caller; the header precedes every user pointer.
        unsafe { ptr.as_ptr().sub(HEADER).cast::<usize>().read() }
    }

    fn total(size: usize) -> Result<usize, AllocError> {
        size.checked_add(HEADER).ok_or(AllocError::OutOfMemory { size })
    }
}

/// The process default block allocator.
#[must_use]
pub fn default_block_allocator() -> Arc<dyn Allocator> {
    GlobalAllocator::get()
}

impl Allocator for GlobalAllocator {
    fn name(&self) -> &'static str {
        "GlobalAllocator"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = Self::total(size)?;
        // Safety: plain C heap calls; the result is checked for null.
        let raw = unsafe {
            if self.options().contains(AllocOptions::ZERO_MEM) {
                libc::calloc(1, total)
            } else {
                libc::malloc(total)
            }
        };
        let raw = NonNull::new(raw.cast::<u8>()).ok_or(AllocError::OutOfMemory { size })?;
        // Safety: `raw` spans `total >= HEADER` bytes aligned for usize.
        unsafe { raw.cast::<usize>().write(size) };
        self.stats.record_alloc(size);
        SYSTEM_HEAP_BYTES.add(total);
        log::trace!("GlobalAllocator: alloc {size} bytes at {raw:p}");
        // Safety: HEADER < total.
        Ok(unsafe { raw.add(HEADER) })
    }

    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = Self::total(new_size)?;
        // Safety: upheld by caller.
        let old = unsafe { self.size_of_ptr(ptr) };
        // Safety: the base pointer came from malloc/calloc/realloc.
        let raw = unsafe { libc::realloc(ptr.as_ptr().sub(HEADER).cast(), total) };
        let raw = NonNull::new(raw.cast::<u8>()).ok_or(AllocError::OutOfMemory { size: new_size })?;
        // Safety: `raw` spans `total` bytes.
        unsafe {
            raw.cast::<usize>().write(new_size);
            if new_size > old && self.options().contains(AllocOptions::ZERO_MEM) {
                raw.add(HEADER + old).write_bytes(0, new_size - old);
            }
        }
        self.stats.record_resize(old, new_size);
        SYSTEM_HEAP_BYTES.add(new_size);
        SYSTEM_HEAP_BYTES.sub(old);
        // Safety: HEADER < total.
        Ok(unsafe { raw.add(HEADER) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        // Safety: upheld by caller.
        let size = unsafe { self.size_of_ptr(ptr) };
        // Safety: the base pointer came from malloc/calloc/realloc.
        unsafe { libc::free(ptr.as_ptr().sub(HEADER).cast()) };
        self.stats.record_free(size);
        SYSTEM_HEAP_BYTES.sub(size + HEADER);
        log::trace!("GlobalAllocator: free {size} bytes at {ptr:p}");
        Ok(())
    }

    fn free_all(&self) {
        // The system heap cannot be released wholesale.
        log::trace!("GlobalAllocator: free_all ignored");
    }

    fn options(&self) -> AllocOptions {
        AllocOptions::from_bits_truncate(self.options.load(Ordering::Relaxed))
    }

    fn set_options(&self, options: AllocOptions) {
        self.options.store(options.bits(), Ordering::Relaxed);
    }

    fn block_allocator(&self) -> Option<Arc<dyn Allocator>> {
        None
    }

    fn set_block_allocator(&self, _alloc: Option<Arc<dyn Allocator>>) {
        log::warn!("GlobalAllocator has no block allocator; ignoring");
    }

    fn stats(&self) -> AllocStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl Drop for GlobalAllocator {
    fn drop(&mut self) {
        self.stats.log(self.name());
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn process_instance_is_shared() {
        let a = GlobalAllocator::get();
        let b = GlobalAllocator::get();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn alloc_grow_free_tracks_sizes() {
        let global = GlobalAllocator::detached();
        let p = global.alloc(40).unwrap();
        assert_eq!(p.as_ptr().addr() % MAX_ALIGN, 0);
        unsafe {
            // Safety: Test code.
            assert_eq!(global.size_of_ptr(p), 40);
            p.as_ptr().write_bytes(0xAB, 40);
            let q = global.grow(p, 4000).unwrap();
            assert_eq!(global.size_of_ptr(q), 4000);
            assert_eq!(*q.as_ptr().add(39), 0xAB);
            assert_eq!(global.stats().live_bytes, 4000);
            global.free(q).unwrap();
        }
        let s = global.stats();
        assert_eq!(s.live_allocs(), 0);
        assert_eq!(s.live_bytes, 0);
        assert_eq!(s.peak_bytes, 4000);
    }

    #[test]
    fn zero_mem_clears_new_and_grown_bytes() {
        let global = GlobalAllocator::detached();
        global.set_options(AllocOptions::ZERO_MEM);
        let p = global.alloc(64).unwrap();
        unsafe {
            // Safety: Test code.
            assert!(std::slice::from_raw_parts(p.as_ptr(), 64).iter().all(|&b| b == 0));
            p.as_ptr().write_bytes(0xFF, 64);
            let q = global.grow(p, 256).unwrap();
            let bytes = std::slice::from_raw_parts(q.as_ptr(), 256);
            assert!(bytes[..64].iter().all(|&b| b == 0xFF));
            assert!(bytes[64..].iter().all(|&b| b == 0));
            global.free(q).unwrap();
        }
    }

    #[test]
    fn root_has_no_block_allocator() {
        let global = GlobalAllocator::detached();
        assert!(global.block_allocator().is_none());
        global.free_all();
    }
}
