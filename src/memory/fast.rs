use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::allocator::{AllocOptions, Allocator, acquire, align_up};
use super::chain::ChainList;
use super::error::AllocError;
use super::global::default_block_allocator;
use super::stats::{AllocStats, AllocStatsSnapshot};
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::{Arc, Mutex, MutexGuard, RwLock, unpoison};

/// Size of the first block a [`FastAllocator`] acquires.
pub const FAST_INITIAL_SIZE: usize = 8192;
/// Size of every later block. Requests at least this large get a block of
/// their own.
pub const FAST_INCREMENT_SIZE: usize = 4096;

#[derive(Clone, Copy)]
struct Region {
    base: NonNull<u8>,
    cap: usize,
}

impl Region {
    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr().addr();
        let base = self.base.as_ptr().addr();
        addr >= base && addr < base + self.cap
    }

    /// Bytes from `ptr` to the end of the region.
    fn tail(&self, ptr: NonNull<u8>) -> usize {
        self.base.as_ptr().addr() + self.cap - ptr.as_ptr().addr()
    }
}

struct FastCore {
    initial: usize,
    increment: usize,
    chains: ChainList,
    current: Option<Region>,
    used: usize,
    /// Offset and size of the latest bump allocation in `current`.
    last: Option<(usize, usize)>,
    /// Regular blocks that filled up.
    full: Vec<Region>,
    /// Dedicated blocks for large requests.
    big: Vec<Region>,
    /// Regular blocks kept by `free_all` for reuse.
    spare: Vec<Region>,
}

// Safety: the core exclusively owns every block it points into.
unsafe impl Send for FastCore {}

impl FastCore {
    fn new(initial: usize, increment: usize) -> Self {
        Self {
            initial,
            increment,
            chains: ChainList::new(),
            current: None,
            used: 0,
            last: None,
            full: Vec::new(),
            big: Vec::new(),
            spare: Vec::new(),
        }
    }

    fn region_of(&self, ptr: NonNull<u8>) -> Option<Region> {
        self.current
            .iter()
            .chain(&self.full)
            .chain(&self.big)
            .find(|r| r.contains(ptr))
            .copied()
    }

    /// Move to a regular block with at least `size` bytes free.
    fn advance(&mut self, size: usize, delegate: &Arc<dyn Allocator>, stats: &AllocStats) -> Result<(), AllocError> {
        if let Some(done) = self.current.take() {
            self.full.push(done);
        }
        let region = if let Some(i) = self.spare.iter().position(|r| r.cap >= size) {
            self.spare.swap_remove(i)
        } else {
            let first = self.full.is_empty() && self.spare.is_empty();
            let cap = if first { self.initial } else { self.increment }.max(size);
            let base = self.chains.push(delegate, cap)?;
            stats.record_block(cap);
            Region { base, cap }
        };
        self.current = Some(region);
        self.used = 0;
        self.last = None;
        Ok(())
    }

    fn bump(&mut self, size: usize) -> Option<NonNull<u8>> {
        let region = self.current?;
        if region.cap - self.used < size {
            return None;
        }
        // Safety: `used + size <= cap`.
        let ptr = unsafe { region.base.add(self.used) };
        self.last = Some((self.used, size));
        self.used += size;
        Some(ptr)
    }
}

/// Arena allocator: bump allocation from a chain of blocks.
///
/// Individual frees are no-ops; memory comes back in bulk through
/// [`free_all`](Allocator::free_all), which keeps regular blocks for reuse and
/// releases the dedicated ones acquired for large requests.
/// Without [`AllocOptions::LOCK`] it is meant for a single thread.
pub struct FastAllocator {
    state: Mutex<FastCore>,
    options: AtomicU32,
    block_alloc: RwLock<Arc<dyn Allocator>>,
    stats: AllocStats,
}

impl Default for FastAllocator {
    fn default() -> Self {
        Self {
            state: Mutex::new(FastCore::new(FAST_INITIAL_SIZE, FAST_INCREMENT_SIZE)),
            options: AtomicU32::new(0),
            block_alloc: RwLock::new(default_block_allocator()),
            stats: AllocStats::new(),
        }
    }
}

impl FastAllocator {
    /// Arena whose first block holds `initial` bytes and later blocks
    /// `increment` bytes. Zero selects the default for either size.
    #[must_use]
    pub fn new(initial: usize, increment: usize) -> Self {
        let this = Self::default();
        {
            let mut core = this.enter();
            core.initial = if initial == 0 { FAST_INITIAL_SIZE } else { initial };
            core.increment = if increment == 0 { FAST_INCREMENT_SIZE } else { increment };
        }
        this
    }

    #[must_use]
    pub fn with_block_allocator(initial: usize, increment: usize, block_alloc: Arc<dyn Allocator>) -> Self {
        let this = Self::new(initial, increment);
        this.set_block_allocator(Some(block_alloc));
        this
    }

    #[must_use]
    pub fn initial_size(&self) -> usize {
        self.enter().initial
    }

    #[must_use]
    pub fn increment_size(&self) -> usize {
        self.enter().increment
    }

    /// Release every block, including the ones kept for reuse.
    pub fn empty(&self) {
        let mut core = self.enter();
        let regions: Vec<Region> = core
            .current
            .iter()
            .chain(&core.full)
            .chain(&core.big)
            .chain(&core.spare)
            .copied()
            .collect();
        for region in &regions {
            self.stats.record_block_release(region.cap);
        }
        core.chains.release_all();
        let (initial, increment) = (core.initial, core.increment);
        *core = FastCore::new(initial, increment);
        drop(core);
        self.stats.record_free_all();
    }

    /// The innermost [`FastContext`] allocator of the calling thread.
    #[must_use]
    pub fn current() -> Option<Arc<Self>> {
        FAST_STACK.with(|stack| stack.borrow().last().cloned())
    }

    fn enter(&self) -> MutexGuard<'_, FastCore> {
        acquire(&self.state, self.options().contains(AllocOptions::LOCK), "FastAllocator")
    }

    fn delegate(&self) -> Arc<dyn Allocator> {
        Arc::clone(&*unpoison(self.block_alloc.read()))
    }

    fn alloc_in(&self, core: &mut FastCore, size: usize) -> Result<NonNull<u8>, AllocError> {
        let options = self.options();
        let aligned = align_up(size.max(1), options.alignment()).ok_or(AllocError::OutOfMemory { size })?;

        let ptr = if aligned >= core.increment {
            let base = core.chains.push_second(&self.delegate(), aligned)?;
            self.stats.record_block(aligned);
            core.big.push(Region { base, cap: aligned });
            base
        } else if let Some(ptr) = core.bump(aligned) {
            ptr
        } else {
            core.advance(aligned, &self.delegate(), &self.stats)?;
            core.bump(aligned).ok_or(AllocError::OutOfMemory { size })?
        };

        if options.contains(AllocOptions::ZERO_MEM) {
            // Safety: `ptr` spans `aligned` bytes.
            unsafe { ptr.as_ptr().write_bytes(0, aligned) };
        }
        self.stats.record_alloc(size);
        log::trace!("FastAllocator: alloc {size} bytes at {ptr:p}");
        Ok(ptr)
    }
}

impl Allocator for FastAllocator {
    fn name(&self) -> &'static str {
        "FastAllocator"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut core = self.enter();
        self.alloc_in(&mut core, size)
    }

    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut core = self.enter();
        let region = core.region_of(ptr).ok_or_else(|| AllocError::not_owned(ptr.as_ptr(), self.name()))?;

        // The latest allocation can be extended in place.
        if let (Some(cur), Some((offset, size))) = (core.current, core.last)
            && cur.base.as_ptr().addr() + offset == ptr.as_ptr().addr()
        {
            let aligned = align_up(new_size.max(1), self.options().alignment())
                .ok_or(AllocError::OutOfMemory { size: new_size })?;
            if offset.checked_add(aligned).is_some_and(|end| end <= cur.cap) {
                core.used = offset + aligned;
                core.last = Some((offset, aligned));
                self.stats.record_resize(size, aligned);
                return Ok(ptr);
            }
        }

        // Bytes that may belong to the old allocation.
        let limit = match core.current {
            Some(cur) if cur.contains(ptr) => cur.base.as_ptr().addr() + core.used - ptr.as_ptr().addr(),
            _ => region.tail(ptr),
        };
        let copy = new_size.min(limit);
        let fresh = self.alloc_in(&mut core, new_size)?;
        // Safety: both ranges lie in blocks owned by this arena and are
        // distinct allocations.
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), copy) };
        Ok(fresh)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let core = self.enter();
        if core.region_of(ptr).is_none() {
            return Err(AllocError::not_owned(ptr.as_ptr(), self.name()));
        }
        self.stats.record_free(0);
        Ok(())
    }

    fn free_all(&self) {
        let mut core = self.enter();
        let big = std::mem::take(&mut core.big);
        for region in big {
            if core.chains.remove(region.base).is_some() {
                self.stats.record_block_release(region.cap);
            }
        }
        let mut kept = std::mem::take(&mut core.full);
        kept.extend(core.current.take());
        core.spare.extend(kept);
        core.used = 0;
        core.last = None;
        drop(core);
        self.stats.record_free_all();
    }

    fn options(&self) -> AllocOptions {
        AllocOptions::from_bits_truncate(self.options.load(Ordering::Relaxed))
    }

    fn set_options(&self, options: AllocOptions) {
        self.options.store(options.bits(), Ordering::Relaxed);
    }

    fn block_allocator(&self) -> Option<Arc<dyn Allocator>> {
        Some(self.delegate())
    }

    fn set_block_allocator(&self, alloc: Option<Arc<dyn Allocator>>) {
        *unpoison(self.block_alloc.write()) = alloc.unwrap_or_else(default_block_allocator);
    }

    fn stats(&self) -> AllocStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl Drop for FastAllocator {
    fn drop(&mut self) {
        self.stats.log(self.name());
    }
}

thread_local! {
    static FAST_STACK: RefCell<Vec<Arc<FastAllocator>>> = const { RefCell::new(Vec::new()) };
}

/// Scope that makes a fresh [`FastAllocator`] current for the calling thread.
///
/// Contexts nest; dropping one restores the previous allocator.
pub struct FastContext {
    alloc: Arc<FastAllocator>,
    depth: usize,
    // Bound to the thread whose stack it pushed onto.
    _not_send: PhantomData<*const ()>,
}

impl Default for FastContext {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl FastContext {
    #[must_use]
    pub fn new(initial: usize, increment: usize) -> Self {
        Self::push(Arc::new(FastAllocator::new(initial, increment)))
    }

    /// Make an existing arena current for this scope.
    #[must_use]
    pub fn push(alloc: Arc<FastAllocator>) -> Self {
        let depth = FAST_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Arc::clone(&alloc));
            stack.len()
        });
        Self {
            alloc,
            depth,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<FastAllocator> {
        &self.alloc
    }
}

impl Drop for FastContext {
    fn drop(&mut self) {
        let _ = FAST_STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() != self.depth {
                log::error!(
                    "FastContext dropped out of order (depth {} of {})",
                    self.depth,
                    stack.len()
                );
            }
            stack.truncate(self.depth - 1);
        });
    }
}
