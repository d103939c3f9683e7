//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., live bytes may briefly disagree with the allocation
//! count). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn fetch_add(&self, val: usize, ordering: Ordering) -> usize {
        self.0.fetch_add(Self::delta(val), ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

// Bytes currently held from the system heap by every `GlobalAllocator`
crate::sync::static_atomic! {
    pub static SYSTEM_HEAP_BYTES: Counter = Counter::new();
}
// Bytes currently mapped from the OS by per-thread heaps
crate::sync::static_atomic! {
    pub static OS_HEAP_MAPPED: Counter = Counter::new();
}
// Per-thread allocators currently alive
crate::sync::static_atomic! {
    pub static THREAD_HEAPS_LIVE: Counter = Counter::new();
}

/// Per-allocator statistics, always collected.
pub struct AllocStats {
    num_allocs: AtomicUsize,
    num_frees: AtomicUsize,
    live_bytes: Counter,
    peak_bytes: AtomicUsize,
    total_bytes: AtomicUsize,
    blocks: Counter,
    block_bytes: Counter,
}

/// Point-in-time copy of an allocator's [`AllocStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocStatsSnapshot {
    /// Allocations serviced since creation or the last reset.
    pub num_allocs: usize,
    /// Frees accepted since creation or the last reset.
    pub num_frees: usize,
    /// Bytes handed out and not yet freed.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Bytes handed out in total.
    pub total_bytes: usize,
    /// Blocks currently held from the block allocator.
    pub blocks: usize,
    pub block_bytes: usize,
}

impl AllocStatsSnapshot {
    /// Allocations not yet matched by a free.
    #[must_use]
    pub fn live_allocs(&self) -> usize {
        self.num_allocs.saturating_sub(self.num_frees)
    }
}

impl Default for AllocStats {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_allocs: AtomicUsize::new(0),
            num_frees: AtomicUsize::new(0),
            live_bytes: Counter::new(),
            peak_bytes: AtomicUsize::new(0),
            total_bytes: AtomicUsize::new(0),
            blocks: Counter::new(),
            block_bytes: Counter::new(),
        }
    }

    #[inline]
    pub fn record_alloc(&self, bytes: usize) {
        self.num_allocs.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_free(&self, bytes: usize) {
        self.num_frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.sub(bytes);
    }

    /// A resize that did not move the allocation.
    #[inline]
    pub fn record_resize(&self, old: usize, new: usize) {
        if new >= old {
            let live = self.live_bytes.fetch_add(new - old, Ordering::Relaxed) + (new - old);
            self.peak_bytes.fetch_max(live, Ordering::Relaxed);
            self.total_bytes.fetch_add(new - old, Ordering::Relaxed);
        } else {
            self.live_bytes.sub(old - new);
        }
    }

    #[inline]
    pub fn record_block(&self, bytes: usize) {
        self.blocks.add(1);
        self.block_bytes.add(bytes);
    }

    #[inline]
    pub fn record_block_release(&self, bytes: usize) {
        self.blocks.sub(1);
        self.block_bytes.sub(bytes);
    }

    /// Forget every outstanding allocation (after a bulk release).
    pub fn record_free_all(&self) {
        let live = self.num_allocs.load(Ordering::Relaxed);
        self.num_frees.store(live, Ordering::Relaxed);
        self.live_bytes.reset();
    }

    #[must_use]
    pub fn snapshot(&self) -> AllocStatsSnapshot {
        AllocStatsSnapshot {
            num_allocs: self.num_allocs.load(Ordering::Relaxed),
            num_frees: self.num_frees.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.get(),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            blocks: self.blocks.get(),
            block_bytes: self.block_bytes.get(),
        }
    }

    /// Clear the cumulative counters. Live gauges are kept so later frees
    /// still balance.
    pub fn reset(&self) {
        let live = self.snapshot().live_allocs();
        self.num_allocs.store(live, Ordering::Relaxed);
        self.num_frees.store(0, Ordering::Relaxed);
        self.peak_bytes.store(self.live_bytes.get(), Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn log(&self, name: &str) {
        let s = self.snapshot();
        log::debug!(
            "{name}: {} allocs, {} frees, {} live bytes (peak {}), {} bytes total, {} blocks ({} bytes)",
            s.num_allocs,
            s.num_frees,
            s.live_bytes,
            s.peak_bytes,
            s.total_bytes,
            s.blocks,
            s.block_bytes
        );
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn counter_clamps_negative_transients() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0);
        c.add(25);
        assert_eq!(c.get(), 15);
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let stats = AllocStats::new();
        stats.record_alloc(100);
        stats.record_alloc(50);
        stats.record_free(100);
        stats.record_alloc(20);

        let s = stats.snapshot();
        assert_eq!(s.num_allocs, 3);
        assert_eq!(s.num_frees, 1);
        assert_eq!(s.live_allocs(), 2);
        assert_eq!(s.live_bytes, 70);
        assert_eq!(s.peak_bytes, 150);
        assert_eq!(s.total_bytes, 170);
    }

    #[test]
    fn reset_keeps_live_gauges() {
        let stats = AllocStats::new();
        stats.record_alloc(64);
        stats.record_alloc(64);
        stats.record_free(64);
        stats.reset();

        let s = stats.snapshot();
        assert_eq!(s.live_allocs(), 1);
        assert_eq!(s.live_bytes, 64);
        assert_eq!(s.total_bytes, 0);

        stats.record_free(64);
        assert_eq!(stats.snapshot().live_allocs(), 0);
    }
}
