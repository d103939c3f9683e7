use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use super::allocator::{AllocOptions, Allocator, WORD_ALIGN, acquire, align_up};
use super::chain::ChainList;
use super::error::AllocError;
use super::global::default_block_allocator;
use super::stats::{AllocStats, AllocStatsSnapshot};
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError, unpoison};

/// Link stored in the first word of every free element.
pub(crate) struct FreeNode {
    pub(crate) next: Option<NonNull<FreeNode>>,
}

struct Block {
    base: NonNull<u8>,
    /// Elements currently handed out.
    live: FixedBitSet,
    /// Live elements already queued for a deferred free.
    deferred: FixedBitSet,
}

/// Slab state, always accessed under the allocator's state lock.
pub(crate) struct FixedLenCore {
    element_size: usize,
    /// Distance between elements: element size rounded up to the alignment.
    stride: usize,
    block_size: usize,
    free_list: Option<NonNull<FreeNode>>,
    chains: ChainList,
    /// Sorted by base address.
    blocks: Vec<Block>,
    live: usize,
}

// Safety: the core exclusively owns its blocks and every free element.
unsafe impl Send for FixedLenCore {}

impl FixedLenCore {
    fn new(element_size: usize, block_size: usize, options: AllocOptions) -> Result<Self, AllocError> {
        if element_size == 0 || block_size == 0 {
            return Err(AllocError::InvalidConfig(format!(
                "element size {element_size} and block size {block_size} must be non-zero"
            )));
        }
        let stride = align_up(element_size.max(WORD_ALIGN), options.alignment())
            .filter(|stride| stride.checked_mul(block_size).is_some())
            .ok_or_else(|| {
                AllocError::InvalidConfig(format!(
                    "{block_size} elements of {element_size} bytes overflow the address space"
                ))
            })?;
        Ok(Self {
            element_size,
            stride,
            block_size,
            free_list: None,
            chains: ChainList::new(),
            blocks: Vec::new(),
            live: 0,
        })
    }

    pub(crate) fn free_list_is_empty(&self) -> bool {
        self.free_list.is_none()
    }

    fn block_bytes(&self) -> usize {
        self.stride * self.block_size
    }

    /// Acquire one block from `delegate` and thread its elements onto the
    /// free list so the lowest address is handed out first.
    fn refill(&mut self, delegate: &Arc<dyn Allocator>, stats: &AllocStats) -> Result<(), AllocError> {
        let bytes = self.block_bytes();
        let base = self.chains.push(delegate, bytes)?;
        stats.record_block(bytes);

        for i in (0..self.block_size).rev() {
            // Safety: `i * stride` lies inside the freshly acquired block.
            let node = unsafe { base.add(i * self.stride) }.cast::<FreeNode>();
            // Safety: every element is at least one word and word aligned.
            unsafe { node.as_ptr().write(FreeNode { next: self.free_list }) };
            self.free_list = Some(node);
        }

        let at = self.blocks.partition_point(|b| b.base < base);
        self.blocks.insert(
            at,
            Block {
                base,
                live: FixedBitSet::with_capacity(self.block_size),
                deferred: FixedBitSet::with_capacity(self.block_size),
            },
        );
        Ok(())
    }

    /// Find the block and element index for `ptr`.
    fn locate(&self, ptr: NonNull<u8>) -> Result<(usize, usize), AllocError> {
        let at = self.blocks.partition_point(|b| b.base <= ptr);
        let Some(block_index) = at.checked_sub(1) else {
            return Err(AllocError::not_owned(ptr.as_ptr(), "FixedLenAllocator"));
        };
        let offset = ptr.as_ptr().addr() - self.blocks[block_index].base.as_ptr().addr();
        if offset >= self.block_bytes() {
            return Err(AllocError::not_owned(ptr.as_ptr(), "FixedLenAllocator"));
        }
        if offset % self.stride != 0 {
            return Err(AllocError::Misaligned {
                addr: ptr.as_ptr().addr(),
            });
        }
        Ok((block_index, offset / self.stride))
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.free_list?;
        // Safety: free elements always hold a valid link.
        self.free_list = unsafe { node.as_ptr().read().next };
        Some(node.cast())
    }

    /// # Safety
    /// `ptr` must be a live element of this core; it may not be used again.
    unsafe fn push(&mut self, ptr: NonNull<u8>) {
        let node = ptr.cast::<FreeNode>();
        // Safety: upheld by caller.
        unsafe { node.as_ptr().write(FreeNode { next: self.free_list }) };
        self.free_list = Some(node);
    }

    fn mark_live(&mut self, ptr: NonNull<u8>) {
        if let Ok((block, index)) = self.locate(ptr) {
            self.blocks[block].live.insert(index);
            self.live += 1;
        }
    }

    /// Validate `ptr` and mark it free. The element is not yet linked.
    pub(crate) fn retire(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let (block, index) = self.locate(ptr)?;
        if !self.blocks[block].live.contains(index) {
            log::error!("double free of {ptr:p} in FixedLenAllocator");
            return Err(AllocError::DoubleFree {
                addr: ptr.as_ptr().addr(),
            });
        }
        self.blocks[block].live.set(index, false);
        self.blocks[block].deferred.set(index, false);
        self.live -= 1;
        Ok(())
    }

    /// Validate `ptr` and mark it queued for a deferred free. The element
    /// stays live until it is retired.
    pub(crate) fn defer(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let (block, index) = self.locate(ptr)?;
        let b = &mut self.blocks[block];
        if !b.live.contains(index) || b.deferred.contains(index) {
            log::error!("double free of {ptr:p} in FixedLenAllocator");
            return Err(AllocError::DoubleFree {
                addr: ptr.as_ptr().addr(),
            });
        }
        b.deferred.insert(index);
        Ok(())
    }

    fn release_all(&mut self, stats: &AllocStats) {
        for _ in 0..self.blocks.len() {
            stats.record_block_release(self.block_bytes());
        }
        self.chains.release_all();
        self.blocks.clear();
        self.free_list = None;
        self.live = 0;
    }

    fn recycle_all(&mut self) {
        self.free_list = None;
        self.live = 0;
        for b in (0..self.blocks.len()).rev() {
            let base = self.blocks[b].base;
            self.blocks[b].live.clear();
            self.blocks[b].deferred.clear();
            for i in (0..self.block_size).rev() {
                // Safety: the element lies inside a block this core owns.
                let node = unsafe { base.add(i * self.stride) }.cast::<FreeNode>();
                // Safety: as above; no element is live any more.
                unsafe { node.as_ptr().write(FreeNode { next: self.free_list }) };
                self.free_list = Some(node);
            }
        }
    }
}

/// Slab allocator for equal-sized elements.
///
/// Elements are carved from blocks of `block_size` elements obtained from the
/// block allocator and recycled through an intrusive LIFO free list, so the
/// most recently freed element is the next one handed out. Blocks are only
/// returned by [`free_all`](Allocator::free_all) or on drop.
///
/// Every free is checked: pointers outside the allocator's blocks, pointers
/// off an element boundary and double frees are rejected.
pub struct FixedLenAllocator {
    state: Mutex<FixedLenCore>,
    options: AtomicU32,
    block_alloc: RwLock<Arc<dyn Allocator>>,
    stats: AllocStats,
}

impl FixedLenAllocator {
    /// Allocator for `element_size` byte elements, `block_size` per block,
    /// using the process block allocator.
    ///
    /// # Errors
    /// `InvalidConfig` when either size is zero.
    pub fn new(element_size: usize, block_size: usize) -> Result<Self, AllocError> {
        Self::with_options(element_size, block_size, AllocOptions::empty(), None)
    }

    /// # Errors
    /// `InvalidConfig` when either size is zero or a block would not fit
    /// in the address space.
    pub fn with_options(
        element_size: usize,
        block_size: usize,
        options: AllocOptions,
        block_alloc: Option<Arc<dyn Allocator>>,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            state: Mutex::new(FixedLenCore::new(element_size, block_size, options)?),
            options: AtomicU32::new(options.bits()),
            block_alloc: RwLock::new(block_alloc.unwrap_or_else(default_block_allocator)),
            stats: AllocStats::new(),
        })
    }

    #[must_use]
    pub fn element_size(&self) -> usize {
        self.enter().element_size
    }

    /// Elements per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.enter().block_size
    }

    /// Elements currently handed out.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.enter().live
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.enter().blocks.len()
    }

    /// Change the element and block size. Existing blocks are released.
    ///
    /// # Errors
    /// `InUse` while any element is live; `InvalidConfig` for zero sizes.
    pub fn set_element_and_block_size(&self, element_size: usize, block_size: usize) -> Result<(), AllocError> {
        let mut core = self.enter();
        if core.live > 0 {
            return Err(AllocError::InUse { live: core.live });
        }
        let fresh = FixedLenCore::new(element_size, block_size, self.options())?;
        core.release_all(&self.stats);
        *core = fresh;
        Ok(())
    }

    /// Make every element available again while keeping the blocks.
    /// All outstanding pointers become invalid.
    pub fn recycle_all(&self) {
        self.enter().recycle_all();
        self.stats.record_free_all();
    }

    /// Whether `ptr` is an element boundary inside one of this allocator's
    /// blocks.
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.enter().locate(ptr).is_ok()
    }

    /// The state lock if nobody holds it right now.
    pub(crate) fn try_enter(&self) -> Option<MutexGuard<'_, FixedLenCore>> {
        match self.state.try_lock() {
            Ok(core) => Some(core),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub(crate) fn enter(&self) -> MutexGuard<'_, FixedLenCore> {
        acquire(
            &self.state,
            self.options().contains(AllocOptions::LOCK),
            "FixedLenAllocator",
        )
    }

    fn delegate(&self) -> Arc<dyn Allocator> {
        Arc::clone(&*unpoison(self.block_alloc.read()))
    }

    /// Allocate with the state lock already held.
    pub(crate) fn alloc_in(&self, core: &mut FixedLenCore, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size > core.element_size {
            return Err(AllocError::TooLarge {
                size,
                limit: core.element_size,
            });
        }
        if core.free_list.is_none() {
            core.refill(&self.delegate(), &self.stats)?;
        }
        let ptr = core.pop().ok_or(AllocError::OutOfMemory { size })?;
        core.mark_live(ptr);
        if self.options().contains(AllocOptions::ZERO_MEM) {
            // Safety: `ptr` spans one stride.
            unsafe { ptr.as_ptr().write_bytes(0, core.stride) };
        }
        self.stats.record_alloc(core.element_size);
        log::trace!("FixedLenAllocator: alloc {size} bytes at {ptr:p}");
        Ok(ptr)
    }

    /// Free with the state lock already held.
    ///
    /// # Safety
    /// `ptr` may not be used after a successful call.
    pub(crate) unsafe fn free_in(&self, core: &mut FixedLenCore, ptr: NonNull<u8>) -> Result<(), AllocError> {
        core.retire(ptr)?;
        // Safety: `retire` proved `ptr` is an element of this core.
        unsafe { core.push(ptr) };
        self.stats.record_free(core.element_size);
        log::trace!("FixedLenAllocator: free {ptr:p}");
        Ok(())
    }
}

impl Allocator for FixedLenAllocator {
    fn name(&self) -> &'static str {
        "FixedLenAllocator"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut core = self.enter();
        self.alloc_in(&mut core, size)
    }

    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        let core = self.enter();
        core.locate(ptr)?;
        if new_size <= core.element_size {
            Ok(ptr)
        } else {
            Err(AllocError::CannotGrow {
                allocator: self.name(),
                size: new_size,
                limit: core.element_size,
            })
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut core = self.enter();
        // Safety: upheld by caller.
        unsafe { self.free_in(&mut core, ptr) }
    }

    fn free_all(&self) {
        self.enter().release_all(&self.stats);
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

impl Drop for FixedLenAllocator {
    fn drop(&mut self) {
        self.stats.log(self.name());
    }
}
