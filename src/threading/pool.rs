use std::time::{Duration, Instant};

use super::semaphore::{DEFAULT_TIMEOUT, Semaphore};
use super::thread::{Thread, ThreadError, ThreadFunc};
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, unpoison};

/// Thread-type mask matching every thread regardless of its options.
pub const ALL_THREADS: u32 = u32::MAX;

const FINISH_POLL: Duration = Duration::from_millis(1);

/// Cloneable view of a pool's exit flag, for use inside thread functions.
#[derive(Clone, Debug)]
pub struct ExitSignal(Arc<AtomicBool>);

impl ExitSignal {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A set of [`Thread`]s started, resumed, awaited and torn down together.
pub struct ThreadPool {
    threads: Mutex<Vec<Arc<Thread>>>,
    /// Threads started by the last `run_all`.
    num_threads: AtomicUsize,
    /// Thread functions that have not returned yet.
    active: Arc<AtomicUsize>,
    do_exit: Arc<AtomicBool>,
    timeout: Duration,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Pool whose waits give up after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            num_threads: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            do_exit: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn add(&self, thread: Arc<Thread>) {
        unpoison(self.threads.lock()).push(thread);
    }

    /// Thread with the given index.
    #[must_use]
    pub fn find(&self, index: usize) -> Option<Arc<Thread>> {
        unpoison(self.threads.lock())
            .iter()
            .find(|t| t.index() == index)
            .cloned()
    }

    /// Number of threads added to the pool.
    #[must_use]
    pub fn get_num_threads(&self) -> usize {
        unpoison(self.threads.lock()).len()
    }

    /// Thread functions still executing.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn should_exit(&self) -> bool {
        self.do_exit.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn exit_signal(&self) -> ExitSignal {
        ExitSignal(Arc::clone(&self.do_exit))
    }

    /// Start every thread that is not running yet. `func` overrides each
    /// thread's own function when given.
    ///
    /// # Errors
    /// The first thread that fails to start; threads before it keep running.
    pub fn run_all(&self, func: Option<ThreadFunc>) -> Result<(), ThreadError> {
        let threads = unpoison(self.threads.lock()).clone();
        self.num_threads.store(0, Ordering::Release);
        for t in threads {
            if !t.is_running() {
                let inner = func
                    .clone()
                    .or_else(|| t.thread_func())
                    .ok_or(ThreadError::NoThreadFunc(t.index()))?;
                let active = Arc::clone(&self.active);
                active.fetch_add(1, Ordering::AcqRel);
                let wrapped: ThreadFunc = Arc::new(move |me: &Arc<Thread>| {
                    let _active = Active(&active);
                    inner(me);
                });
                if let Err(e) = t.run(Some(wrapped)) {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    return Err(e);
                }
            }
            self.num_threads.fetch_add(1, Ordering::AcqRel);
        }
        log::debug!("thread pool: {} threads running", self.num_threads.load(Ordering::Acquire));
        Ok(())
    }

    fn matching(&self, mask: u32) -> Vec<Arc<Thread>> {
        unpoison(self.threads.lock())
            .iter()
            .filter(|t| mask == ALL_THREADS || t.options() & mask != 0)
            .cloned()
            .collect()
    }

    /// Matching threads that were started and not joined yet. A thread
    /// whose function already returned still owes its done signal.
    fn started(&self, mask: u32) -> Vec<Arc<Thread>> {
        let mut v = self.matching(mask);
        v.retain(|t| t.is_started());
        v
    }

    /// Wait until each thread has signaled done or stopped running.
    fn wait_finished(&self, threads: &[Arc<Thread>]) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut pending: Vec<&Arc<Thread>> = threads.iter().collect();
        loop {
            pending.retain(|t| t.is_running() && !t.done_event().try_wait());
            let Some(first) = pending.first() else {
                return true;
            };
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            if first.done_event().wait_timeout(left.min(FINISH_POLL)).is_signaled() {
                pending.remove(0);
            }
        }
    }

    /// Resume the threads whose options intersect `mask`. Returns `false`
    /// when nothing was started by [`run_all`](Self::run_all).
    pub fn resume_all(&self, mask: u32) -> bool {
        if self.num_threads.load(Ordering::Acquire) == 0 {
            return false;
        }
        for t in self.matching(mask) {
            t.resume();
        }
        true
    }

    /// Wait until every started thread matching `mask` signals done.
    /// Returns `false` when none was started or the wait timed out.
    pub fn wait_all(&self, mask: u32) -> bool {
        let threads = self.started(mask);
        if threads.is_empty() {
            return false;
        }
        let events: Vec<&Semaphore> = threads.iter().map(|t| t.done_event()).collect();
        Semaphore::wait_all(&events, self.timeout)
    }

    /// Wait until any started thread matching `mask` signals done.
    pub fn wait_any(&self, mask: u32) -> bool {
        let threads = self.started(mask);
        if threads.is_empty() {
            return false;
        }
        let events: Vec<&Semaphore> = threads.iter().map(|t| t.done_event()).collect();
        Semaphore::wait_any(&events, self.timeout).is_some()
    }

    /// Ask every thread to exit. With `wait`, resume them all, wait for
    /// their done signals, join them and drop them from the pool.
    pub fn kill_all(&self, wait: bool) {
        if self.should_exit() {
            return;
        }
        if self.num_threads.load(Ordering::Acquire) == 0 || !wait {
            self.do_exit.store(true, Ordering::Release);
            return;
        }

        let threads = self.started(ALL_THREADS);
        if self.do_exit.swap(true, Ordering::AcqRel) {
            return;
        }
        if !threads.is_empty() {
            self.resume_all(ALL_THREADS);
            if !self.wait_finished(&threads) {
                log::warn!(
                    "thread pool: {} threads did not finish within {:?}",
                    threads.len(),
                    self.timeout
                );
                return;
            }
            for t in &threads {
                t.join();
            }
        }
        self.num_threads.store(0, Ordering::Release);
        self.empty();
    }

    /// Drop every thread when none was started. Returns whether the pool
    /// was cleared.
    pub fn empty(&self) -> bool {
        if self.num_threads.load(Ordering::Acquire) != 0 {
            return false;
        }
        unpoison(self.threads.lock()).clear();
        true
    }

    /// Set the priority of every thread in the pool.
    ///
    /// # Errors
    /// `BadPriority` when out of range.
    pub fn set_priority(&self, priority: u32) -> Result<(), ThreadError> {
        for t in unpoison(self.threads.lock()).iter() {
            t.set_priority(priority)?;
        }
        Ok(())
    }
}

/// Counts a thread function out when it returns or unwinds.
struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.kill_all(true);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const FAST: Duration = Duration::from_secs(5);

    fn worker(exit: ExitSignal) -> ThreadFunc {
        Arc::new(move |me: &Arc<Thread>| {
            while me.suspend() {
                me.signal_done();
                if exit.is_set() {
                    break;
                }
            }
        })
    }

    #[test]
    fn find_and_count() {
        let pool = ThreadPool::new();
        for i in 0..3 {
            pool.add(Thread::new(i, 1 << i));
        }
        assert_eq!(pool.get_num_threads(), 3);
        assert_eq!(pool.find(2).unwrap().options(), 4);
        assert!(pool.find(9).is_none());
    }

    #[test]
    fn nothing_started_means_nothing_to_resume_or_wait_for() {
        let pool = ThreadPool::with_timeout(FAST);
        pool.add(Thread::new(0, 1));
        assert!(!pool.resume_all(ALL_THREADS));
        assert!(!pool.wait_all(ALL_THREADS));
        assert!(!pool.wait_any(ALL_THREADS));
        assert!(pool.empty());
        assert_eq!(pool.get_num_threads(), 0);
    }

    #[test]
    fn run_resume_wait_kill() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let pool = ThreadPool::with_timeout(FAST);
        for i in 0..4 {
            pool.add(Thread::new(i, 1));
        }
        pool.run_all(Some(worker(pool.exit_signal()))).unwrap();
        assert_eq!(pool.active_threads(), 4);

        assert!(pool.resume_all(ALL_THREADS));
        assert!(pool.wait_all(ALL_THREADS));

        pool.kill_all(true);
        assert!(pool.should_exit());
        assert_eq!(pool.get_num_threads(), 0);
        assert_eq!(pool.active_threads(), 0);

        // second call is a no-op
        pool.kill_all(true);
    }

    #[test]
    fn masks_select_threads() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let pool = ThreadPool::with_timeout(FAST);
        pool.add(Thread::new(0, 0b01));
        pool.add(Thread::new(1, 0b10));
        pool.run_all(Some(worker(pool.exit_signal()))).unwrap();

        pool.resume_all(0b10);
        assert!(pool.wait_any(0b10));
        let t0 = pool.find(0).unwrap();
        assert_eq!(t0.done_event().count(), 0);
        assert!(!pool.wait_all(0b100));

        pool.kill_all(true);
        assert_eq!(pool.get_num_threads(), 0);
    }

    #[test]
    fn wait_all_returns_after_the_last_thread() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = ThreadPool::with_timeout(FAST);
        let finished = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let t = Thread::new(i, 1);
            let finished = finished.clone();
            t.set_thread_func(Arc::new(move |me: &Arc<Thread>| {
                if me.suspend() {
                    std::thread::sleep(Duration::from_millis(10 * (me.index() as u64 + 1)));
                    finished.fetch_add(1, Ordering::SeqCst);
                    me.signal_done();
                }
            }));
            pool.add(t);
        }
        pool.run_all(None).unwrap();
        pool.resume_all(ALL_THREADS);
        assert!(pool.wait_all(ALL_THREADS));
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        for i in 0..3 {
            assert!(pool.find(i).unwrap().join());
        }
    }

    fn wait_until_idle(pool: &ThreadPool) {
        let deadline = Instant::now() + FAST;
        while pool.active_threads() > 0 || (0..4).any(|i| pool.find(i).is_some_and(|t| t.is_running())) {
            assert!(Instant::now() < deadline, "threads did not finish");
            std::thread::yield_now();
        }
    }

    #[test]
    fn wait_all_counts_threads_that_already_exited() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let pool = ThreadPool::with_timeout(FAST);
        for i in 0..4 {
            pool.add(Thread::new(i, 1));
        }
        pool.run_all(Some(Arc::new(|me: &Arc<Thread>| me.signal_done())))
            .unwrap();
        wait_until_idle(&pool);

        assert!(pool.wait_all(ALL_THREADS));
        pool.kill_all(true);
        assert_eq!(pool.get_num_threads(), 0);
    }

    fn failing_worker(_: &Arc<Thread>) {
        panic!("worker failure");
    }

    #[test]
    fn panicking_workers_are_counted_out() {
        let _g = crate::TEST_MUTEX.read().unwrap();
        let pool = ThreadPool::with_timeout(FAST);
        pool.add(Thread::new(0, 1));
        pool.add(Thread::new(1, 1));
        pool.run_all(Some(Arc::new(failing_worker))).unwrap();
        wait_until_idle(&pool);

        assert_eq!(pool.active_threads(), 0);
        let start = Instant::now();
        pool.kill_all(true);
        assert!(start.elapsed() < FAST);
        assert_eq!(pool.get_num_threads(), 0);
    }

    #[test]
    fn priority_applies_to_all_threads() {
        let pool = ThreadPool::new();
        pool.add(Thread::new(0, 0));
        pool.add(Thread::new(1, 0));
        pool.set_priority(4).unwrap();
        assert_eq!(pool.find(1).unwrap().priority(), 4);
        assert!(pool.set_priority(9).is_err());
    }
}
