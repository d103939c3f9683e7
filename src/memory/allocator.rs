use std::fmt;
use std::ptr::NonNull;

use super::error::AllocError;
use super::stats::AllocStatsSnapshot;
use crate::sync::{Arc, Mutex, MutexGuard, TryLockError};

/// Strictest alignment any allocator in the hierarchy hands out.
pub const MAX_ALIGN: usize = 16;

/// Natural word alignment, used unless [`AllocOptions::DEFAULT_ALIGN`] is set.
pub const WORD_ALIGN: usize = std::mem::size_of::<usize>();

bitflags::bitflags! {
    /// Option bits shared by every allocator.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AllocOptions: u32 {
        /// Zero memory when it is handed out.
        const ZERO_MEM = 1;
        /// Serialize access so several threads may share the allocator.
        const LOCK = 2;
        /// Defer frees onto a side list reconciled by the owning thread.
        const FREE_LATER = 4;
        /// Align every allocation to [`MAX_ALIGN`] instead of the word size.
        const DEFAULT_ALIGN = 8;
    }
}

impl AllocOptions {
    /// Alignment applied to element sizes and bump offsets.
    #[must_use]
    pub const fn alignment(self) -> usize {
        if self.contains(Self::DEFAULT_ALIGN) {
            MAX_ALIGN
        } else {
            WORD_ALIGN
        }
    }
}

/// Common contract of every allocator in the hierarchy.
///
/// Allocators that sub-allocate from larger blocks obtain those blocks from
/// their *block allocator*, which defaults to the process
/// [`GlobalAllocator`](super::global::GlobalAllocator).
pub trait Allocator: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Allocate at least `size` bytes.
    ///
    /// # Errors
    /// `OutOfMemory` when the backing memory is exhausted, or an
    /// allocator-specific error when the request cannot be serviced.
    fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Resize an allocation, preserving its contents. May return a new
    /// address, after which `ptr` is invalid.
    ///
    /// # Errors
    /// `CannotGrow` when the allocator has a fixed capacity smaller than
    /// `new_size`; any error `alloc` can return.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed.
    unsafe fn grow(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Return an allocation.
    ///
    /// # Errors
    /// Allocators that can identify their own memory report foreign pointers
    /// and double frees.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed, and must
    /// not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError>;

    /// Release everything this allocator has handed out. Every pointer it
    /// returned becomes invalid.
    fn free_all(&self);

    fn options(&self) -> AllocOptions;

    fn set_options(&self, options: AllocOptions);

    /// Delegate used to acquire blocks, `None` for the root allocator.
    fn block_allocator(&self) -> Option<Arc<dyn Allocator>>;

    /// Replace the delegate. `None` restores the process default.
    /// Blocks already acquired are returned to the delegate they came from.
    fn set_block_allocator(&self, alloc: Option<Arc<dyn Allocator>>);

    fn stats(&self) -> AllocStatsSnapshot;

    fn reset_stats(&self);
}

impl fmt::Debug for dyn Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.name())
            .field("options", &self.options())
            .finish_non_exhaustive()
    }
}

/// Round `n` up to a multiple of the power of two `align`. `None` on
/// overflow.
#[inline]
#[must_use]
pub const fn align_up(n: usize, align: usize) -> Option<usize> {
    match n.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Take the state lock of an allocator.
///
/// With `locking` requested (and locking enabled process-wide) this blocks.
/// Otherwise the allocator is single-threaded and a busy lock means two
/// threads are inside it at once, which is a usage error.
///
/// # Panics
/// When an allocator without locking is entered concurrently.
pub(crate) fn acquire<'a, T>(state: &'a Mutex<T>, locking: bool, who: &str) -> MutexGuard<'a, T> {
    if locking && crate::threading::lock::locking_enabled() {
        return crate::sync::unpoison(state.lock());
    }
    match state.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(p)) => p.into_inner(),
        Err(TryLockError::WouldBlock) => {
            panic!("{who} entered concurrently without locking; set AllocOptions::LOCK")
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn options_combine_and_align() {
        let opts = AllocOptions::ZERO_MEM | AllocOptions::LOCK;
        assert!(opts.contains(AllocOptions::ZERO_MEM));
        assert!(opts.contains(AllocOptions::LOCK));
        assert!(!opts.contains(AllocOptions::FREE_LATER));
        assert_eq!(opts.bits(), 3);
        assert_eq!(opts.alignment(), WORD_ALIGN);
        assert_eq!((opts | AllocOptions::DEFAULT_ALIGN).alignment(), MAX_ALIGN);
        assert_eq!(opts.difference(AllocOptions::LOCK), AllocOptions::ZERO_MEM);
        assert_eq!(format!("{opts:?}"), "AllocOptions(ZERO_MEM | LOCK)");
        assert_eq!(AllocOptions::from_bits_truncate(0xFF), AllocOptions::all());
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(17, 8), Some(24));
        assert_eq!(align_up(usize::MAX, 16), None);
        assert_eq!(align_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
    }

    #[test]
    #[should_panic(expected = "entered concurrently without locking")]
    fn unlocked_reentry_is_detected() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let state = Mutex::new(0u32);
        let _held = acquire(&state, false, "TestAlloc");
        let _again = acquire(&state, false, "TestAlloc");
    }
}
