use std::collections::VecDeque;

use super::BufferError;
use super::buffer::{BUFFER_HEADER, BufState, Buffer};
use crate::memory::{AllocOptions, Allocator, FixedLenAllocator};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::{Arc, unsafe_cell_get_mut};
use crate::threading::{LockObj, ObjLock};

/// Most ready queues a [`BufferQueue`] can have.
pub const MAX_QUEUES: usize = 4;
/// Buffer size used when zero is requested.
pub const DEFAULT_BUF_SIZE: usize = 1024;
/// Buffers per block of the default buffer allocator.
const BUFFERS_PER_BLOCK: usize = 16;

type ReadyQueues = [VecDeque<Buffer>; MAX_QUEUES];

/// Thread-safe ready queues of fixed-size [`Buffer`]s.
///
/// Producers take a buffer with [`new_buffer`](Self::new_buffer), fill it,
/// stamp it `Ready` (or `Pending`) and [`submit`](Self::submit) it to the
/// queue named by its `queue` field. Consumers [`process`](Self::process) a
/// queue to take the oldest `Ready` buffer. Every list operation holds the
/// queue's object lock.
///
/// Buffers come from a single locking allocator shared by all producers.
pub struct BufferQueue {
    lock: LockObj,
    ready: UnsafeCell<ReadyQueues>,
    buf_size: usize,
    num_queues: usize,
    alloc: Option<Arc<dyn Allocator>>,
    /// Whether `alloc` was created here and may be emptied.
    owns_alloc: bool,
    outstanding: Arc<AtomicUsize>,
}

// Safety: the ready lists are only touched under `lock`.
unsafe impl Sync for BufferQueue {}

impl BufferQueue {
    /// Queues for `buf_size` byte buffers (0 picks [`DEFAULT_BUF_SIZE`])
    /// backed by a locking fixed-length allocator.
    ///
    /// # Errors
    /// `BadQueue` when `num_queues` is 0 or above [`MAX_QUEUES`], `BadBufSize`
    /// when the buffer has no room for data.
    pub fn new(buf_size: usize, num_queues: usize) -> Result<Self, BufferError> {
        let buf_size = if buf_size == 0 { DEFAULT_BUF_SIZE } else { buf_size };
        let alloc = FixedLenAllocator::with_options(buf_size, BUFFERS_PER_BLOCK, AllocOptions::LOCK, None)?;
        let mut q = Self::unallocated(buf_size, num_queues)?;
        q.alloc = Some(Arc::new(alloc));
        q.owns_alloc = true;
        Ok(q)
    }

    /// Queues whose buffers come from `alloc`. The allocator must accept
    /// requests of `buf_size` bytes and frees from any thread.
    ///
    /// # Errors
    /// As for [`new`](Self::new).
    pub fn with_allocator(
        buf_size: usize,
        num_queues: usize,
        alloc: Arc<dyn Allocator>,
    ) -> Result<Self, BufferError> {
        let buf_size = if buf_size == 0 { DEFAULT_BUF_SIZE } else { buf_size };
        let mut q = Self::unallocated(buf_size, num_queues)?;
        q.alloc = Some(alloc);
        Ok(q)
    }

    /// Queues without a buffer allocator; buffers are minted through
    /// [`new_buffer_in`](Self::new_buffer_in).
    pub(crate) fn unallocated(buf_size: usize, num_queues: usize) -> Result<Self, BufferError> {
        if num_queues == 0 || num_queues > MAX_QUEUES {
            return Err(BufferError::BadQueue {
                queue: num_queues,
                num_queues: MAX_QUEUES,
            });
        }
        if buf_size <= BUFFER_HEADER {
            return Err(BufferError::BadBufSize { size: buf_size });
        }
        Ok(Self {
            lock: LockObj::new(),
            ready: UnsafeCell::new(Default::default()),
            buf_size,
            num_queues,
            alloc: None,
            owns_alloc: false,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Byte size of each buffer, header included.
    #[must_use]
    pub fn get_buf_size(&self) -> usize {
        self.buf_size
    }

    /// Size of each buffer's data area.
    #[must_use]
    pub fn get_data_size(&self) -> usize {
        self.buf_size - BUFFER_HEADER
    }

    #[must_use]
    pub fn get_num_queues(&self) -> usize {
        self.num_queues
    }

    /// Buffers minted by this queue that still exist, queued or not.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Take a fresh buffer in state `New`, with id and queue 0 and
    /// `num_bytes` set to the full data size.
    ///
    /// # Errors
    /// `NoAllocator` for queues built without one; allocation failures.
    pub fn new_buffer(&self) -> Result<Buffer, BufferError> {
        let alloc = self.alloc.clone().ok_or(BufferError::NoAllocator)?;
        self.new_buffer_in(alloc)
    }

    /// Mint a buffer from `alloc` with the object lock held, so `empty`
    /// cannot release the allocator's blocks mid-construction.
    pub(crate) fn new_buffer_in(&self, alloc: Arc<dyn Allocator>) -> Result<Buffer, BufferError> {
        let _guard = ObjLock::new(&self.lock);
        Buffer::new_in(alloc, self.buf_size, Arc::clone(&self.outstanding))
    }

    fn check_queue(&self, queue: usize) -> Result<(), BufferError> {
        if queue < self.num_queues {
            Ok(())
        } else {
            Err(BufferError::BadQueue {
                queue,
                num_queues: self.num_queues,
            })
        }
    }

    /// Run `f` on the ready lists with the object lock held.
    fn with_ready<R>(&self, f: impl FnOnce(&mut ReadyQueues) -> R) -> R {
        let _guard = ObjLock::new(&self.lock);
        // Safety: the object lock is held and no reference escapes `f`.
        let ready = unsafe_cell_get_mut!(self.ready);
        f(ready)
    }

    /// Append `buf` to the tail of the ready queue named by its `queue`
    /// field. The buffer must be at least `Used`.
    ///
    /// # Errors
    /// `NotSubmittable` or `BadQueue`; the buffer is handed back with the
    /// error so it is not lost.
    pub fn submit(&self, buf: Buffer) -> Result<(), (BufferError, Buffer)> {
        let state = buf.state();
        if state < BufState::Used {
            return Err((BufferError::NotSubmittable(state), buf));
        }
        let queue = buf.queue() as usize;
        if let Err(e) = self.check_queue(queue) {
            return Err((e, buf));
        }
        log::debug!("BufferQueue::submit {queue}:{} {:?}", buf.id(), state);
        self.with_ready(|ready| ready[queue].push_back(buf));
        Ok(())
    }

    /// Unlink and return the oldest `Ready` buffer in queue `queue`, or
    /// `None` when none is ready.
    ///
    /// # Errors
    /// `BadQueue`.
    pub fn process(&self, queue: usize) -> Result<Option<Buffer>, BufferError> {
        self.check_queue(queue)?;
        let buf = self.with_ready(|ready| {
            let list = &mut ready[queue];
            let pos = list.iter().position(|b| b.state() == BufState::Ready)?;
            list.remove(pos)
        });
        if let Some(b) = &buf {
            log::debug!("BufferQueue::process {}:{} {} bytes", b.queue(), b.id(), b.num_bytes());
        }
        Ok(buf)
    }

    /// Mark `buf` free and return its memory.
    pub fn free(&self, buf: Buffer) {
        log::trace!("BufferQueue::free {}:{}", buf.queue(), buf.id());
        drop(buf);
    }

    /// Buffers waiting in queue `queue`, ready or not.
    ///
    /// # Errors
    /// `BadQueue`.
    pub fn ready_len(&self, queue: usize) -> Result<usize, BufferError> {
        self.check_queue(queue)?;
        Ok(self.with_ready(|ready| ready[queue].len()))
    }

    /// Free every queued buffer. When no buffer is outstanding afterwards
    /// an allocator created by this queue also releases its blocks.
    /// Returns the number of buffers freed.
    pub fn empty(&self) -> usize {
        let _guard = ObjLock::new(&self.lock);
        let freed = self.drain_ready();
        if let Some(alloc) = self.alloc.as_ref().filter(|_| self.owns_alloc) {
            if self.outstanding() == 0 {
                alloc.free_all();
            } else {
                log::debug!(
                    "BufferQueue::empty: {} buffers outstanding, keeping allocator blocks",
                    self.outstanding()
                );
            }
        }
        freed
    }

    /// Drop every queued buffer.
    pub(crate) fn drain_ready(&self) -> usize {
        let drained: Vec<Buffer> = self.with_ready(|ready| ready.iter_mut().flat_map(|q| q.drain(..)).collect());
        drained.len()
    }

    pub(crate) fn obj_lock(&self) -> ObjLock<'_> {
        ObjLock::new(&self.lock)
    }

    /// Walk queue `queue` in order without removing anything.
    ///
    /// # Errors
    /// `BadQueue`.
    pub fn iter(&self, queue: usize) -> Result<Iter<'_>, BufferError> {
        self.check_queue(queue)?;
        Ok(Iter {
            _guard: ObjLock::new(&self.lock),
            bq: self,
            queue,
            next: 0,
            current: None,
        })
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        let freed = self.drain_ready();
        if freed > 0 {
            log::debug!("BufferQueue dropped {freed} queued buffers");
        }
    }
}

/// Copy of a queued buffer's header, as seen by [`Iter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: u16,
    pub queue: u16,
    pub state: BufState,
    pub num_bytes: usize,
}

impl From<&Buffer> for BufferInfo {
    fn from(b: &Buffer) -> Self {
        Self {
            id: b.id(),
            queue: b.queue(),
            state: b.state(),
            num_bytes: b.num_bytes(),
        }
    }
}

/// Cursor over one ready queue. Holds the queue's object lock, so
/// producers and consumers on other threads wait until it is dropped.
pub struct Iter<'a> {
    _guard: ObjLock<'a>,
    bq: &'a BufferQueue,
    queue: usize,
    next: usize,
    /// Position of the buffer most recently returned by `next`.
    current: Option<usize>,
}

impl Iter<'_> {
    /// Advance to the next buffer in queue order.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<BufferInfo> {
        let (queue, at) = (self.queue, self.next);
        let info = self.bq.with_ready(|ready| ready[queue].get(at).map(BufferInfo::from));
        let Some(info) = info else {
            self.current = None;
            return None;
        };
        self.current = Some(at);
        self.next += 1;
        Some(info)
    }

    /// Change the state of the buffer most recently returned by `next`.
    pub fn set_state(&mut self, state: BufState) -> bool {
        let (queue, Some(at)) = (self.queue, self.current) else {
            return false;
        };
        self.bq.with_ready(|ready| ready[queue].get(at).map(|b| b.set_state(state)).is_some())
    }

    /// Remove and free the buffer most recently returned by `next`.
    pub fn free(&mut self) -> bool {
        let (queue, Some(at)) = (self.queue, self.current.take()) else {
            return false;
        };
        let Some(buf) = self.bq.with_ready(|ready| ready[queue].remove(at)) else {
            return false;
        };
        self.next = at;
        self.bq.free(buf);
        true
    }
}

impl std::fmt::Debug for Iter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("queue", &self.queue)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}
