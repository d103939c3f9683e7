use std::time::Duration;

use thiserror::Error;

use crate::memory::stats::{OS_HEAP_MAPPED, SYSTEM_HEAP_BYTES, THREAD_HEAPS_LIVE};
use crate::memory::thread_alloc::set_default_heap_size;
use crate::memory::{
    AllocError, AllocOptions, AllocStatsSnapshot, Allocator, DEFAULT_TLS_HEAP_SIZE, GlobalAllocator, PoolAllocator,
    PoolConfig,
};
use crate::sync::{Arc, OnceLock};
use crate::threading::{DEFAULT_TIMEOUT, ThreadPool, set_locking};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("the process context is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Process-level settings applied by [`CoreContext::init`].
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Whether shared allocators and locks may be used from several threads.
    pub threaded: bool,
    /// Layout of the shared pool allocator.
    pub pool: PoolConfig,
    /// Timeout for thread pools made by the context.
    pub wait_timeout: Duration,
    /// Private heap size of each thread's [`ThreadAllocator`](crate::memory::ThreadAllocator).
    pub tls_heap_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            pool: PoolConfig::default(),
            wait_timeout: DEFAULT_TIMEOUT,
            tls_heap_size: DEFAULT_TLS_HEAP_SIZE,
        }
    }
}

/// Memory counters across the context's allocators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub global: AllocStatsSnapshot,
    pub pool: AllocStatsSnapshot,
    /// Bytes held from the system heap by every `GlobalAllocator`.
    pub system_heap_bytes: usize,
    /// Bytes mapped by OS heaps.
    pub os_heap_mapped: usize,
    pub thread_heaps_live: usize,
}

/// The root allocators of one runtime.
///
/// A process normally has exactly one, set up with [`init`](Self::init) and
/// reached through [`global`](Self::global). Isolated contexts from
/// [`new`](Self::new) have their own global allocator instance and leave
/// process-wide settings alone.
pub struct CoreContext {
    config: CoreConfig,
    global: Arc<GlobalAllocator>,
    pool: Arc<PoolAllocator>,
}

static CONTEXT: OnceLock<CoreContext> = OnceLock::new();

impl CoreContext {
    /// An isolated context.
    ///
    /// # Errors
    /// `Alloc` when the pool configuration is invalid.
    pub fn new(config: CoreConfig) -> Result<Self, CoreError> {
        Self::build(config, Arc::new(GlobalAllocator::detached()))
    }

    fn build(config: CoreConfig, global: Arc<GlobalAllocator>) -> Result<Self, CoreError> {
        let mut pool_config = config.pool.clone();
        if config.threaded {
            pool_config.options |= AllocOptions::LOCK;
        }
        let pool = PoolAllocator::with_block_allocator(pool_config, global.clone())?;
        Ok(Self {
            config,
            global,
            pool: Arc::new(pool),
        })
    }

    /// Set up the process context: the shared global allocator, the process
    /// locking switch and the default thread heap size.
    ///
    /// # Errors
    /// `AlreadyInitialized` on a second call; `Alloc` for an invalid pool
    /// configuration.
    pub fn init(config: CoreConfig) -> Result<&'static Self, CoreError> {
        if CONTEXT.get().is_some() {
            return Err(CoreError::AlreadyInitialized);
        }
        let threaded = config.threaded;
        let tls_heap_size = config.tls_heap_size;
        let ctx = Self::build(config, GlobalAllocator::get())?;
        CONTEXT.set(ctx).map_err(|_| CoreError::AlreadyInitialized)?;
        set_locking(threaded);
        set_default_heap_size(tls_heap_size);
        log::info!("core context initialized (threaded: {threaded}, thread heap: {tls_heap_size} bytes)");
        CONTEXT.get().ok_or(CoreError::AlreadyInitialized)
    }

    /// The process context, if [`init`](Self::init) has run.
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        CONTEXT.get()
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub fn global_allocator(&self) -> Arc<GlobalAllocator> {
        Arc::clone(&self.global)
    }

    /// The shared size-class allocator.
    #[must_use]
    pub fn pool_allocator(&self) -> Arc<PoolAllocator> {
        Arc::clone(&self.pool)
    }

    /// An empty thread pool using the configured wait timeout.
    #[must_use]
    pub fn thread_pool(&self) -> ThreadPool {
        ThreadPool::with_timeout(self.config.wait_timeout)
    }

    /// Switch locking on or off for the process and the shared pool.
    pub fn set_threading(&self, threaded: bool) {
        set_locking(threaded);
        let options = self.pool.options();
        self.pool.set_options(if threaded {
            options | AllocOptions::LOCK
        } else {
            options.difference(AllocOptions::LOCK)
        });
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            global: self.global.stats(),
            pool: self.pool.stats(),
            system_heap_bytes: SYSTEM_HEAP_BYTES.get(),
            os_heap_mapped: OS_HEAP_MAPPED.get(),
            thread_heaps_live: THREAD_HEAPS_LIVE.get(),
        }
    }

    /// Release everything the shared pool holds and log the final counters.
    /// Pointers from the pool become invalid.
    pub fn exit(&self) {
        self.pool.free_all();
        let stats = self.stats();
        log::info!(
            "core context exit: global {} live allocs / {} bytes, peak pool {} bytes",
            stats.global.live_allocs(),
            stats.global.live_bytes,
            stats.pool.peak_bytes
        );
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn isolated_contexts_do_not_share_counters() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let a = CoreContext::new(CoreConfig::default()).unwrap();
        let b = CoreContext::new(CoreConfig::default()).unwrap();

        let pool = a.pool_allocator();
        let p = pool.alloc(48).unwrap();
        assert_eq!(a.stats().pool.live_allocs(), 1);
        assert!(a.stats().global.live_allocs() > 0);
        assert_eq!(b.stats().global.live_allocs(), 0);

        // Safety: Test code.
        unsafe { pool.free(p).unwrap() };
        a.exit();
        assert_eq!(a.stats().global.live_allocs(), 0);
    }

    #[test]
    fn threaded_contexts_lock_the_pool() {
        let ctx = CoreContext::new(CoreConfig::default()).unwrap();
        assert!(ctx.pool_allocator().options().contains(AllocOptions::LOCK));

        let single = CoreContext::new(CoreConfig {
            threaded: false,
            ..CoreConfig::default()
        })
        .unwrap();
        assert!(!single.pool_allocator().options().contains(AllocOptions::LOCK));
    }

    #[test]
    fn set_threading_flips_process_locking() {
        let _g = crate::TEST_MUTEX.write().unwrap();
        let ctx = CoreContext::new(CoreConfig::default()).unwrap();
        ctx.set_threading(false);
        assert!(!crate::threading::locking_enabled());
        assert!(!ctx.pool_allocator().options().contains(AllocOptions::LOCK));
        ctx.set_threading(true);
        assert!(crate::threading::locking_enabled());
        assert!(ctx.pool_allocator().options().contains(AllocOptions::LOCK));
    }

    #[test]
    fn invalid_pool_config_is_reported() {
        let config = CoreConfig {
            pool: PoolConfig {
                num_pools: 0,
                ..PoolConfig::default()
            },
            ..CoreConfig::default()
        };
        assert!(matches!(CoreContext::new(config), Err(CoreError::Alloc(_))));
    }

    #[test]
    fn process_context_initializes_once() {
        let _g = crate::TEST_MUTEX.write().unwrap();
        let ctx = CoreContext::init(CoreConfig::default()).unwrap();
        assert!(std::ptr::eq(ctx, CoreContext::global().unwrap()));
        assert!(matches!(
            CoreContext::init(CoreConfig::default()),
            Err(CoreError::AlreadyInitialized)
        ));
        assert!(CoreContext::global().is_some());
    }
}
