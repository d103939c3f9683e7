//! Locks, semaphores and worker threads.

pub mod lock;
pub mod pool;
pub mod semaphore;
pub mod thread;

pub use lock::{CritSec, Lock, LockError, LockObj, ObjLock, locking_enabled, set_locking};
pub use pool::{ALL_THREADS, ExitSignal, ThreadPool};
pub use semaphore::{DEFAULT_TIMEOUT, Semaphore, WaitResult};
pub use thread::{MAX_PRIORITY, NORMAL_PRIORITY, Thread, ThreadError, ThreadFunc};
