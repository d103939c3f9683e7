use std::cell::RefCell;

use super::BufferError;
use super::buffer::Buffer;
use super::queue::{BufferQueue, Iter};
use crate::memory::{AllocOptions, Allocator, BytePool};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Most producer threads a [`ThreadQueue`] serves.
pub const MAX_THREADS: usize = 8;
/// Buffer size used when zero is requested.
pub const DEFAULT_THREAD_BUF_SIZE: usize = 4096;
/// Smallest block a per-thread pool asks for.
const MIN_CHUNK: usize = 4096;

crate::sync::static_atomic! {
    static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Assignment {
    queue: u64,
    generation: u64,
    slot: usize,
}

thread_local! {
    /// Pool slot this thread was given by each queue it produced for.
    static ASSIGNED: RefCell<Vec<Assignment>> = const { RefCell::new(Vec::new()) };
}

/// [`BufferQueue`] whose producers each allocate from their own pool.
///
/// The first [`new_buffer`](Self::new_buffer) on a thread claims one of
/// [`MAX_THREADS`] [`BytePool`]s and remembers the claim thread-locally, so
/// producers never contend with each other. A buffer's `id` is the slot of
/// the pool it came from. Consumers may free buffers on any thread; the
/// pools defer those frees until their producer next runs dry.
pub struct ThreadQueue {
    base: BufferQueue,
    pools: Vec<Arc<BytePool>>,
    num_threads: AtomicUsize,
    id: u64,
    /// Bumped by `empty` to invalidate every thread's slot.
    generation: AtomicU64,
}

impl ThreadQueue {
    /// Queues for `buf_size` byte buffers (0 picks
    /// [`DEFAULT_THREAD_BUF_SIZE`]).
    ///
    /// # Errors
    /// As for [`BufferQueue::new`].
    pub fn new(buf_size: usize, num_queues: usize) -> Result<Self, BufferError> {
        let buf_size = if buf_size == 0 { DEFAULT_THREAD_BUF_SIZE } else { buf_size };
        let base = BufferQueue::unallocated(buf_size, num_queues)?;
        let per_block = MIN_CHUNK.max(buf_size * 4) / buf_size;
        let pools = (0..MAX_THREADS)
            .map(|_| {
                BytePool::new(buf_size, per_block, AllocOptions::FREE_LATER | AllocOptions::LOCK).map(Arc::new)
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            base,
            pools,
            num_threads: AtomicUsize::new(0),
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
        })
    }

    /// Producer threads that have claimed a pool.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Acquire).min(MAX_THREADS)
    }

    #[must_use]
    pub fn get_buf_size(&self) -> usize {
        self.base.get_buf_size()
    }

    #[must_use]
    pub fn get_data_size(&self) -> usize {
        self.base.get_data_size()
    }

    #[must_use]
    pub fn get_num_queues(&self) -> usize {
        self.base.get_num_queues()
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.base.outstanding()
    }

    /// Pool owned by the calling thread, claiming one on first use.
    fn thread_pool(&self) -> Result<(usize, Arc<BytePool>), BufferError> {
        let generation = self.generation.load(Ordering::Acquire);
        let cached = ASSIGNED.with(|a| {
            a.borrow()
                .iter()
                .find(|x| x.queue == self.id && x.generation == generation)
                .map(|x| x.slot)
        });
        let slot = match cached {
            Some(slot) => slot,
            None => {
                let slot = self
                    .num_threads
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < MAX_THREADS).then_some(n + 1))
                    .map_err(|_| BufferError::TooManyThreads(MAX_THREADS))?;
                ASSIGNED.with(|a| {
                    let mut a = a.borrow_mut();
                    a.retain(|x| x.queue != self.id);
                    a.push(Assignment {
                        queue: self.id,
                        generation,
                        slot,
                    });
                });
                log::debug!("ThreadQueue {}: thread claimed pool {slot}", self.id);
                slot
            }
        };
        Ok((slot, Arc::clone(&self.pools[slot])))
    }

    /// Take a fresh buffer from the calling thread's pool. Its `id` is the
    /// pool slot.
    ///
    /// # Errors
    /// `TooManyThreads` once [`MAX_THREADS`] threads have claimed pools;
    /// allocation failures.
    pub fn new_buffer(&self) -> Result<Buffer, BufferError> {
        // Claims and `empty` resets are serialised on the object lock.
        let _guard = self.base.obj_lock();
        let (slot, pool) = self.thread_pool()?;
        let mut buf = self.base.new_buffer_in(pool)?;
        buf.set_id(slot as u16);
        Ok(buf)
    }

    /// # Errors
    /// As for [`BufferQueue::submit`].
    pub fn submit(&self, buf: Buffer) -> Result<(), (BufferError, Buffer)> {
        self.base.submit(buf)
    }

    /// # Errors
    /// As for [`BufferQueue::process`].
    pub fn process(&self, queue: usize) -> Result<Option<Buffer>, BufferError> {
        self.base.process(queue)
    }

    /// Return `buf` to the pool of the thread that made it.
    pub fn free(&self, buf: Buffer) {
        self.base.free(buf);
    }

    /// # Errors
    /// As for [`BufferQueue::ready_len`].
    pub fn ready_len(&self, queue: usize) -> Result<usize, BufferError> {
        self.base.ready_len(queue)
    }

    /// # Errors
    /// As for [`BufferQueue::iter`].
    pub fn iter(&self, queue: usize) -> Result<Iter<'_>, BufferError> {
        self.base.iter(queue)
    }

    /// Reconcile every pool's deferred frees. Returns the number reclaimed.
    pub fn really_free(&self) -> usize {
        self.pools[..self.num_threads()].iter().map(|p| p.really_free()).sum()
    }

    /// Free every queued buffer. When nothing is outstanding afterwards the
    /// pools release their memory and every thread's claim is dropped.
    /// Returns the number of buffers freed.
    pub fn empty(&self) -> usize {
        let _guard = self.base.obj_lock();
        let freed = self.base.drain_ready();
        let outstanding = self.outstanding();
        if outstanding > 0 {
            log::debug!("ThreadQueue {}: {outstanding} buffers outstanding, keeping pools", self.id);
            return freed;
        }
        for pool in &self.pools[..self.num_threads()] {
            pool.free_all();
        }
        self.num_threads.store(0, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        freed
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        let _ = ASSIGNED.try_with(|a| a.borrow_mut().retain(|x| x.queue != self.id));
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::bufq::BufState;

    #[test]
    fn pools_are_sized_from_the_buffer_size() {
        let tq = ThreadQueue::new(64, 1).unwrap();
        assert_eq!(tq.pools[0].element_size(), 64);
        let big = ThreadQueue::new(2048, 1).unwrap();
        let b = big.new_buffer().unwrap();
        assert_eq!(b.capacity(), 2048 - crate::bufq::BUFFER_HEADER);
        assert_eq!(big.pools[0].stats().block_bytes, 2048 * 4);
    }

    #[test]
    fn one_pool_per_producer_thread() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let tq = Arc::new(ThreadQueue::new(128, 1).unwrap());
        let a = tq.new_buffer().unwrap();
        let b = tq.new_buffer().unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(tq.num_threads(), 1);

        let other = tq.clone();
        let id = std::thread::spawn(move || other.new_buffer().unwrap().id()).join().unwrap();
        assert_ne!(id, a.id());
        assert_eq!(tq.num_threads(), 2);
    }

    #[test]
    fn ninth_producer_is_refused() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let tq = Arc::new(ThreadQueue::new(128, 1).unwrap());
        for _ in 0..MAX_THREADS {
            let tq = tq.clone();
            std::thread::spawn(move || drop(tq.new_buffer().unwrap())).join().unwrap();
        }
        assert!(matches!(tq.new_buffer(), Err(BufferError::TooManyThreads(MAX_THREADS))));
    }

    #[test]
    fn consumer_frees_are_reclaimed_by_the_producer() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let tq = Arc::new(ThreadQueue::new(128, 1).unwrap());
        let b = tq.new_buffer().unwrap();
        b.set_state(BufState::Ready);
        tq.submit(b).unwrap();

        let consumer = tq.clone();
        std::thread::spawn(move || {
            let b = consumer.process(0).unwrap().unwrap();
            consumer.free(b);
        })
        .join()
        .unwrap();

        assert_eq!(tq.pools[0].pending_frees(), 1);
        assert_eq!(tq.really_free(), 1);
        assert_eq!(tq.outstanding(), 0);
    }

    #[test]
    fn empty_resets_thread_claims() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let tq = ThreadQueue::new(128, 1).unwrap();
        let b = tq.new_buffer().unwrap();
        b.set_state(BufState::Ready);
        tq.submit(b).unwrap();
        let held = tq.new_buffer().unwrap();

        assert_eq!(tq.empty(), 1);
        assert_eq!(tq.num_threads(), 1);
        drop(held);
        assert_eq!(tq.empty(), 0);
        assert_eq!(tq.num_threads(), 0);

        let again = tq.new_buffer().unwrap();
        assert_eq!(again.id(), 0);
        assert_eq!(tq.num_threads(), 1);
    }

    #[test]
    fn empty_racing_producers_keeps_live_buffers_intact() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let tq = Arc::new(ThreadQueue::new(256, 1).unwrap());
        let producers: Vec<_> = (0..4u8)
            .map(|p| {
                let tq = tq.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let mut b = tq.new_buffer().unwrap();
                        b.data_mut().fill(p);
                        std::thread::yield_now();
                        assert!(b.data().iter().all(|&x| x == p));
                        tq.free(b);
                    }
                })
            })
            .collect();
        while !producers.iter().all(|p| p.is_finished()) {
            tq.empty();
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(tq.outstanding(), 0);
        assert!(tq.num_threads() <= 4);
    }
}
