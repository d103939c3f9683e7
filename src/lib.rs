#[cfg(not(target_pointer_width = "64"))]
compile_error!("vcore supports only 64-bit targets.");

pub(crate) mod sync;

pub mod bufq;
pub mod context;
pub mod memory;
pub mod threading;

// allocators
pub use memory::{
    AllocError, AllocOptions, Allocator, BytePool, FastAllocator, FastContext, FixedLenAllocator, GlobalAllocator,
    OsHeap, PoolAllocator, PoolConfig, SizeProgression, ThreadAllocator,
};

// locks and threads
pub use threading::{
    CritSec, Lock, LockError, LockObj, ObjLock, Semaphore, Thread, ThreadError, ThreadFunc, ThreadPool, WaitResult,
};

// buffer queues
pub use bufq::{BufState, Buffer, BufferError, BufferQueue, ThreadQueue};

// process context
pub use context::{CoreConfig, CoreContext, CoreError, MemoryStats};

// Serializes tests that flip process-wide switches (writers) against tests
// that rely on them (readers).
#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
