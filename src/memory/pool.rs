use std::collections::HashMap;
use std::ptr::NonNull;

use super::allocator::{AllocOptions, Allocator, MAX_ALIGN, acquire};
use super::chain::CHAIN_HEADER;
use super::error::AllocError;
use super::fixed::FixedLenAllocator;
use super::global::default_block_allocator;
use super::stats::{AllocStats, AllocStatsSnapshot};
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::{Arc, Mutex, RwLock, unpoison};

/// Most size classes a [`PoolAllocator`] can have.
pub const ALLOC_MAX_POOLS: usize = 8;

/// Bytes per block requested for each pool.
pub const POOL_BLOCK_BYTES: usize = 8192;

/// Prefix written in front of every allocation.
const POOL_HEADER: usize = MAX_ALIGN;

/// Header class of allocations serviced by the block allocator.
const LARGE_CLASS: usize = usize::MAX;

#[repr(C)]
struct PoolHeader {
    class: usize,
    size: usize,
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() == POOL_HEADER);

/// How pool sizes grow from the smallest one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SizeProgression {
    /// Pool `i` holds `smallest * (i + 1)` bytes.
    #[default]
    Linear,
    /// Pool `i` holds `smallest << i` bytes.
    Doubling,
}

/// Construction parameters for a [`PoolAllocator`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Size of the smallest pool, in user bytes.
    pub smallest: usize,
    /// Number of pools, at most [`ALLOC_MAX_POOLS`].
    pub num_pools: usize,
    pub progression: SizeProgression,
    /// Bytes requested from the block allocator per pool block.
    pub block_bytes: usize,
    pub options: AllocOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            smallest: 32,
            num_pools: ALLOC_MAX_POOLS,
            progression: SizeProgression::Linear,
            block_bytes: POOL_BLOCK_BYTES,
            options: AllocOptions::empty(),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), AllocError> {
        if self.smallest == 0 || self.num_pools == 0 || self.num_pools > ALLOC_MAX_POOLS {
            return Err(AllocError::InvalidConfig(format!(
                "pool sizes need smallest > 0 and 1..={ALLOC_MAX_POOLS} pools, got {} and {}",
                self.smallest, self.num_pools
            )));
        }
        let largest = self
            .checked_class_size(self.num_pools - 1)
            .and_then(|n| n.checked_add(POOL_HEADER));
        if largest.is_none() {
            return Err(AllocError::InvalidConfig(format!(
                "{} pools starting at {} bytes overflow the address space",
                self.num_pools, self.smallest
            )));
        }
        if self.block_bytes <= CHAIN_HEADER {
            return Err(AllocError::InvalidConfig(format!(
                "pool block of {} bytes cannot hold a block header",
                self.block_bytes
            )));
        }
        Ok(())
    }

    /// User bytes held by pool `i`. Saturates for configurations that
    /// would not validate.
    #[must_use]
    pub fn class_size(&self, i: usize) -> usize {
        self.checked_class_size(i).unwrap_or(usize::MAX)
    }

    fn checked_class_size(&self, i: usize) -> Option<usize> {
        match self.progression {
            SizeProgression::Linear => self.smallest.checked_mul(i.checked_add(1)?),
            SizeProgression::Doubling => self.smallest.checked_mul(1usize.checked_shl(u32::try_from(i).ok()?)?),
        }
    }
}

/// Where a [`PoolAllocator`] allocation was serviced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolOwner {
    Pool(usize),
    BlockAllocator,
}

struct LargeBlocks(HashMap<usize, (NonNull<u8>, Arc<dyn Allocator>)>);

// Safety: the map exclusively tracks blocks owned by the pool allocator.
unsafe impl Send for LargeBlocks {}

/// Size-class allocator: a fixed set of [`FixedLenAllocator`] pools with
/// increasing element sizes.
///
/// A request goes to the first pool large enough for it; anything bigger
/// than the largest pool goes straight to the block allocator. Each
/// allocation carries a small header naming where it came from, so `free`
/// can send it back without being told the size.
pub struct PoolAllocator {
    config: PoolConfig,
    /// Empty after `free_all` until the next allocation.
    pools: RwLock<Vec<FixedLenAllocator>>,
    large: Mutex<LargeBlocks>,
    options: AtomicU32,
    block_alloc: RwLock<Arc<dyn Allocator>>,
    stats: AllocStats,
}

impl PoolAllocator {
    /// # Errors
    /// `InvalidConfig` when the configuration is out of range.
    pub fn new(config: PoolConfig) -> Result<Self, AllocError> {
        Self::with_block_allocator(config, default_block_allocator())
    }

    /// # Errors
    /// `InvalidConfig` when the configuration is out of range.
    pub fn with_block_allocator(config: PoolConfig, block_alloc: Arc<dyn Allocator>) -> Result<Self, AllocError> {
        config.validate()?;
        let this = Self {
            options: AtomicU32::new(config.options.bits()),
            config,
            pools: RwLock::new(Vec::new()),
            large: Mutex::new(LargeBlocks(HashMap::new())),
            block_alloc: RwLock::new(block_alloc),
            stats: AllocStats::new(),
        };
        *unpoison(this.pools.write()) = this.build_pools()?;
        Ok(this)
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn num_pools(&self) -> usize {
        self.config.num_pools
    }

    /// Largest request serviced by a pool.
    #[must_use]
    pub fn max_pooled_size(&self) -> usize {
        self.config.class_size(self.config.num_pools - 1)
    }

    /// Index of the pool servicing `size` byte requests, `None` when the
    /// block allocator takes them.
    #[must_use]
    pub fn pool_for(&self, size: usize) -> Option<usize> {
        (0..self.config.num_pools).find(|&i| size <= self.config.class_size(i))
    }

    /// Statistics of pool `i`, `None` while the pools are torn down.
    #[must_use]
    pub fn pool_stats(&self, i: usize) -> Option<AllocStatsSnapshot> {
        unpoison(self.pools.read()).get(i).map(Allocator::stats)
    }

    /// Where a live allocation was serviced.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    #[must_use]
    pub unsafe fn owner_of(&self, ptr: NonNull<u8>) -> PoolOwner {
        // Safety: upheld by caller.
        let header = unsafe { Self::header(ptr).as_ptr().read() };
        if header.class == LARGE_CLASS {
            PoolOwner::BlockAllocator
        } else {
            PoolOwner::Pool(header.class)
        }
    }

    /// Requested size of a live allocation.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    #[must_use]
    pub unsafe fn size_of_ptr(&self, ptr: NonNull<u8>) -> usize {
        // Safety: upheld by caller.
        unsafe { Self::header(ptr).as_ptr().read().size }
    }

    /// # Safety
    /// `ptr` must point `POOL_HEADER` bytes into an allocation.
    unsafe fn header(ptr: NonNull<u8>) -> NonNull<PoolHeader> {
        // Safety: upheld by caller.
        unsafe { ptr.sub(POOL_HEADER) }.cast()
    }

    fn delegate(&self) -> Arc<dyn Allocator> {
        Arc::clone(&*unpoison(self.block_alloc.read()))
    }

    fn build_pools(&self) -> Result<Vec<FixedLenAllocator>, AllocError> {
        let delegate = self.delegate();
        let options = self.options();
        (0..self.config.num_pools)
            .map(|i| {
                let element = self.config.class_size(i) + POOL_HEADER;
                let per_block = ((self.config.block_bytes - CHAIN_HEADER) / element).max(1);
                log::trace!("PoolAllocator: pool {i} holds {element} byte elements, {per_block} per block");
                FixedLenAllocator::with_options(element, per_block, options, Some(Arc::clone(&delegate)))
            })
            .collect()
    }

    fn alloc_pooled(&self, class: usize) -> Result<NonNull<u8>, AllocError> {
        let element = self.config.class_size(class) + POOL_HEADER;
        {
            let pools = unpoison(self.pools.read());
            if let Some(pool) = pools.get(class) {
                return pool.alloc(element);
            }
        }
        let mut pools = unpoison(self.pools.write());
        if pools.is_empty() {
            log::debug!("PoolAllocator: recreating {} pools", self.config.num_pools);
            *pools = self.build_pools()?;
        }
        pools[class].alloc(element)
    }

    fn alloc_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = size
            .checked_add(POOL_HEADER)
            .ok_or(AllocError::OutOfMemory { size })?;
        let delegate = self.delegate();
        let base = delegate.alloc(total)?;
        if self.options().contains(AllocOptions::ZERO_MEM) {
            // Safety: `base` spans `total` bytes.
            unsafe { base.as_ptr().write_bytes(0, total) };
        }
        acquire(&self.large, self.locking(), "PoolAllocator")
            .0
            .insert(base.as_ptr().addr(), (base, delegate));
        Ok(base)
    }

    fn locking(&self) -> bool {
        self.options().contains(AllocOptions::LOCK)
    }

    /// Find which pool holds `base` by address.
    fn pool_owning(&self, base: NonNull<u8>) -> Option<usize> {
        unpoison(self.pools.read()).iter().position(|p| p.owns(base))
    }
}

impl Allocator for PoolAllocator {
    fn name(&self) -> &'static str {
        "PoolAllocator"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = self.pool_for(size);
        let base = match class {
            Some(i) => self.alloc_pooled(i)?,
            None => self.alloc_large(size)?,
        };
        // Safety: every base spans POOL_HEADER + size bytes, word aligned.
        unsafe {
            base.cast::<PoolHeader>().as_ptr().write(PoolHeader {
                class: class.unwrap_or(LARGE_CLASS),
                size,
            });
        }
        self.stats.record_alloc(size);
        // Safety: as above.
        let ptr = unsafe { base.add(POOL_HEADER) };
        log::trace!("PoolAllocator: alloc {size} bytes at {ptr:p} from {class:?}");
        Ok(ptr)
    }

    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        // Safety: upheld by caller.
        let header = unsafe { Self::header(ptr) };
        // Safety: as above.
        let PoolHeader { class, size } = unsafe { header.as_ptr().read() };
        if class < self.config.num_pools && new_size <= self.config.class_size(class) {
            if new_size > size && self.options().contains(AllocOptions::ZERO_MEM) {
                // Safety: the element has room for `new_size` bytes.
                unsafe { ptr.add(size).as_ptr().write_bytes(0, new_size - size) };
            }
            // Safety: as above.
            unsafe { (*header.as_ptr()).size = new_size };
            self.stats.record_resize(size, new_size);
            return Ok(ptr);
        }
        let fresh = self.alloc(new_size)?;
        // Safety: both are live allocations of at least `min` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), size.min(new_size));
            self.free(ptr)?;
        }
        Ok(fresh)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        // Safety: upheld by caller.
        let base = unsafe { Self::header(ptr) }.cast::<u8>();
        // Safety: as above.
        let PoolHeader { class, size } = unsafe { base.cast::<PoolHeader>().as_ptr().read() };

        if class == LARGE_CLASS {
            let entry = acquire(&self.large, self.locking(), "PoolAllocator")
                .0
                .remove(&base.as_ptr().addr());
            let Some((block, delegate)) = entry else {
                return Err(AllocError::not_owned(ptr.as_ptr(), self.name()));
            };
            // Safety: the block came from `delegate` and is now unlinked.
            unsafe { delegate.free(block)? };
        } else {
            // A freed element's header is overwritten by the free-list link,
            // so an unknown class is resolved by address.
            let class = if class < self.config.num_pools {
                class
            } else {
                self.pool_owning(base)
                    .ok_or_else(|| AllocError::not_owned(ptr.as_ptr(), self.name()))?
            };
            let pools = unpoison(self.pools.read());
            let pool = pools
                .get(class)
                .ok_or_else(|| AllocError::not_owned(ptr.as_ptr(), self.name()))?;
            // Safety: upheld by caller; the pool validates ownership.
            unsafe { pool.free(base)? };
        }
        self.stats.record_free(size);
        log::trace!("PoolAllocator: free {ptr:p}");
        Ok(())
    }

    fn free_all(&self) {
        let pools = std::mem::take(&mut *unpoison(self.pools.write()));
        for pool in &pools {
            pool.free_all();
        }
        drop(pools);

        let large = std::mem::take(&mut acquire(&self.large, self.locking(), "PoolAllocator").0);
        for (_, (block, delegate)) in large {
            // Safety: every tracked block is live and owned by this allocator.
            if let Err(e) = unsafe { delegate.free(block) } {
                log::error!("PoolAllocator: releasing large block {block:p}: {e}");
            }
        }
        self.stats.record_free_all();
    }

    fn options(&self) -> AllocOptions {
        AllocOptions::from_bits_truncate(self.options.load(Ordering::Relaxed))
    }

    fn set_options(&self, options: AllocOptions) {
        self.options.store(options.bits(), Ordering::Relaxed);
        for pool in unpoison(self.pools.read()).iter() {
            pool.set_options(options);
        }
    }

    fn block_allocator(&self) -> Option<Arc<dyn Allocator>> {
        Some(self.delegate())
    }

    fn set_block_allocator(&self, alloc: Option<Arc<dyn Allocator>>) {
        let alloc = alloc.unwrap_or_else(default_block_allocator);
        *unpoison(self.block_alloc.write()) = Arc::clone(&alloc);
        for pool in unpoison(self.pools.read()).iter() {
            pool.set_block_allocator(Some(Arc::clone(&alloc)));
        }
    }

    fn stats(&self) -> AllocStatsSnapshot {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.stats.log(self.name());
        self.free_all();
    }
}
