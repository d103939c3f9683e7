use std::io;
use std::ptr::NonNull;

use super::allocator::{AllocOptions, Allocator, MAX_ALIGN};
use super::error::AllocError;
use super::stats::{AllocStats, AllocStatsSnapshot, OS_HEAP_MAPPED};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicU32, Ordering};

/// Prefix of every mapping, recording its length.
pub const OS_HEAP_HEADER: usize = MAX_ALIGN;

/// Page-granular memory straight from the OS.
pub(crate) trait PageOps {
    /// Map `size` bytes of zeroed read/write memory.
    unsafe fn map(size: usize) -> io::Result<NonNull<u8>>;

    /// Unmap a range returned by `map`.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()>;

    fn page_size() -> usize;
}

pub(crate) struct PlatformPages;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageOps, PlatformPages};
    use std::io;

    impl PageOps for PlatformPages {
        unsafe fn map(size: usize) -> io::Result<NonNull<u8>> {
            // Safety: FFI call to mmap with an anonymous private mapping.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            // Safety: upheld by caller.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call without preconditions.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed pages under loom/Miri and on platforms without mmap.
// The memory is zeroed like a fresh mapping.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(any(target_os = "macos", target_os = "linux"))))]
impl PageOps for PlatformPages {
    unsafe fn map(size: usize) -> io::Result<NonNull<u8>> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-size mapping"));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size()).map_err(io::Error::other)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null"))
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size()).map_err(io::Error::other)?;
        // Safety: upheld by caller; same layout as `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// Block allocator over anonymous OS mappings.
///
/// Every request is rounded up to whole pages and returned to the OS on
/// free, so memory never lingers in a shared heap. Per-thread allocators use
/// it as their private heap.
pub struct OsHeap {
    options: AtomicU32,
    stats: AllocStats,
}

impl Default for OsHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl OsHeap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: AtomicU32::new(0),
            stats: AllocStats::new(),
        }
    }

    #[must_use]
    pub fn page_size() -> usize {
        PlatformPages::page_size()
    }

    fn mapping_len(size: usize) -> Result<usize, AllocError> {
        let page = PlatformPages::page_size();
        let padded = size
            .checked_add(OS_HEAP_HEADER + page - 1)
            .ok_or(AllocError::OutOfMemory { size })?;
        Ok(padded & !(page - 1))
    }

    /// Mapping base and length behind a user pointer.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of an `OsHeap`.
    unsafe fn mapping(ptr: NonNull<u8>) -> (NonNull<u8>, usize) {
        // Safety: upheld by caller.
        let base = unsafe { ptr.sub(OS_HEAP_HEADER) };
        // Safety: the header holds the mapping length.
        (base, unsafe { base.cast::<usize>().read() })
    }
}

impl Allocator for OsHeap {
    fn name(&self) -> &'static str {
        "OsHeap"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let len = Self::mapping_len(size)?;
        // Safety: `len` is a non-zero multiple of the page size.
        let base = unsafe { PlatformPages::map(len)? };
        // Safety: the mapping is at least one page.
        unsafe { base.cast::<usize>().write(len) };
        self.stats.record_alloc(len - OS_HEAP_HEADER);
        self.stats.record_block(len);
        OS_HEAP_MAPPED.add(len);
        log::trace!("OsHeap: mapped {len} bytes at {base:p}");
        // Safety: the mapping is longer than the header.
        Ok(unsafe { base.add(OS_HEAP_HEADER) })
    }

    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        // Safety: upheld by caller.
        let (_, len) = unsafe { Self::mapping(ptr) };
        if new_size <= len - OS_HEAP_HEADER {
            return Ok(ptr);
        }
        let fresh = self.alloc(new_size)?;
        // Safety: the old mapping holds `len - OS_HEAP_HEADER` user bytes and
        // the new one is larger.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), len - OS_HEAP_HEADER);
            self.free(ptr)?;
        }
        Ok(fresh)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        // Safety: upheld by caller.
        let (base, len) = unsafe { Self::mapping(ptr) };
        // Safety: `base`/`len` describe a live mapping.
        unsafe { PlatformPages::unmap(base, len)? };
        self.stats.record_free(len - OS_HEAP_HEADER);
        self.stats.record_block_release(len);
        OS_HEAP_MAPPED.sub(len);
        log::trace!("OsHeap: unmapped {len} bytes at {base:p}");
        Ok(())
    }

    fn free_all(&self) {
        // Mappings are owned by the allocators built on top.
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
        log::warn!("OsHeap maps pages directly; ignoring block allocator");
    }

    fn stats(&self) -> AllocStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn mappings_are_page_rounded_and_zeroed() {
        let heap = OsHeap::new();
        let page = OsHeap::page_size();
        let p = heap.alloc(100).unwrap();
        assert_eq!(p.as_ptr().addr() % MAX_ALIGN, 0);
        // Safety: Test code.
        unsafe {
            assert!(std::slice::from_raw_parts(p.as_ptr(), 100).iter().all(|&b| b == 0));
            let (base, len) = OsHeap::mapping(p);
            assert_eq!(base.as_ptr().addr() % page, 0);
            assert_eq!(len, page);
            heap.free(p).unwrap();
        }
        assert_eq!(heap.stats().blocks, 0);
    }

    #[test]
    fn exact_page_requests_fit_one_page_with_the_header() {
        let page = OsHeap::page_size();
        assert_eq!(OsHeap::mapping_len(page - OS_HEAP_HEADER).unwrap(), page);
        assert_eq!(OsHeap::mapping_len(page - OS_HEAP_HEADER + 1).unwrap(), 2 * page);
    }

    #[test]
    fn grow_remaps_and_keeps_contents() {
        let heap = OsHeap::new();
        let page = OsHeap::page_size();
        let p = heap.alloc(64).unwrap();
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(9, 64);
            assert_eq!(heap.grow(p, 128).unwrap(), p);
            let q = heap.grow(p, 3 * page).unwrap();
            assert!(std::slice::from_raw_parts(q.as_ptr(), 64).iter().all(|&b| b == 9));
            heap.free(q).unwrap();
        }
        let s = heap.stats();
        assert_eq!(s.live_allocs(), 0);
        assert_eq!(s.blocks, 0);
    }
}
