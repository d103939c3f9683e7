//! Fixed-size buffers handed between producer and consumer threads.

mod buffer;
mod queue;
mod thread_queue;

use thiserror::Error;

use crate::memory::AllocError;

pub use buffer::{BUFFER_HEADER, BufState, Buffer};
pub use queue::{BufferInfo, BufferQueue, DEFAULT_BUF_SIZE, Iter, MAX_QUEUES};
pub use thread_queue::{DEFAULT_THREAD_BUF_SIZE, MAX_THREADS, ThreadQueue};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("queue {queue} out of range, {num_queues} queues")]
    BadQueue { queue: usize, num_queues: usize },
    #[error("buffer in state {0:?} cannot be submitted")]
    NotSubmittable(BufState),
    #[error("{requested} bytes exceed the {capacity} byte data area")]
    BufferSize { requested: usize, capacity: usize },
    #[error("buffer size {size} leaves no data area")]
    BadBufSize { size: usize },
    #[error("all {0} producer pools are taken")]
    TooManyThreads(usize),
    #[error("buffer queue has no allocator")]
    NoAllocator,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}
