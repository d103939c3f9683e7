pub(crate) mod allocator;
pub(crate) mod byte_pool;
pub(crate) mod chain;
pub(crate) mod error;
pub(crate) mod fast;
pub(crate) mod fixed;
pub(crate) mod global;
pub(crate) mod integration;
pub(crate) mod os_heap;
pub(crate) mod pool;
pub mod stats;
pub(crate) mod thread_alloc;

pub use allocator::{AllocOptions, Allocator, MAX_ALIGN, WORD_ALIGN};
pub use byte_pool::BytePool;
pub use chain::CHAIN_HEADER;
pub use error::AllocError;
pub use fast::{FAST_INCREMENT_SIZE, FAST_INITIAL_SIZE, FastAllocator, FastContext};
pub use fixed::FixedLenAllocator;
pub use global::{GlobalAllocator, default_block_allocator};
pub use os_heap::{OS_HEAP_HEADER, OsHeap};
pub use pool::{ALLOC_MAX_POOLS, POOL_BLOCK_BYTES, PoolAllocator, PoolConfig, PoolOwner, SizeProgression};
pub use stats::{AllocStats, AllocStatsSnapshot, Counter};
pub use thread_alloc::{DEFAULT_TLS_HEAP_SIZE, ThreadAllocator};
