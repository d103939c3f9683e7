use std::cell::RefCell;
use std::io;

use thiserror::Error;

use super::semaphore::{Semaphore, WaitResult};
use crate::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use crate::sync::thread::{self, Builder, JoinHandle};
use crate::sync::{Arc, Mutex, unpoison};

/// Body of a worker thread. Receives the thread's own handle.
pub type ThreadFunc = Arc<dyn Fn(&Arc<Thread>) + Send + Sync>;

/// Highest value accepted by [`Thread::set_priority`].
pub const MAX_PRIORITY: u32 = 4;
/// Priority threads start with.
pub const NORMAL_PRIORITY: u32 = 2;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("thread {0} has no thread function")]
    NoThreadFunc(usize),
    #[error("failed to spawn thread {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("priority {0} is outside 0..={MAX_PRIORITY}")]
    BadPriority(u32),
}

/// A worker thread with resume and done signals.
///
/// The thread is created idle; [`run`](Thread::run) starts the OS thread.
/// Inside its function a worker typically calls [`suspend`](Thread::suspend)
/// to wait for work and [`signal_done`](Thread::signal_done) when finished.
pub struct Thread {
    index: usize,
    options: u32,
    running: AtomicBool,
    priority: AtomicU32,
    /// OS thread id once started, 0 before.
    os_id: AtomicU64,
    done: Semaphore,
    resume: Semaphore,
    func: Mutex<Option<ThreadFunc>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

impl Thread {
    /// Idle thread with the given index and type bits.
    #[must_use]
    pub fn new(index: usize, options: u32) -> Arc<Self> {
        Arc::new(Self {
            index,
            options,
            running: AtomicBool::new(false),
            priority: AtomicU32::new(NORMAL_PRIORITY),
            os_id: AtomicU64::new(0),
            done: Semaphore::new(0),
            resume: Semaphore::new(0),
            func: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Type bits matched by the pool's thread-type masks.
    #[must_use]
    pub fn options(&self) -> u32 {
        self.options
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Running, or finished but not joined yet.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.is_running() || unpoison(self.handle.lock()).is_some()
    }

    #[must_use]
    pub fn thread_func(&self) -> Option<ThreadFunc> {
        unpoison(self.func.lock()).clone()
    }

    pub fn set_thread_func(&self, func: ThreadFunc) {
        *unpoison(self.func.lock()) = Some(func);
    }

    /// The [`Thread`] running the calling code, if it was started by
    /// [`run`](Thread::run).
    #[must_use]
    pub fn current_handle() -> Option<Arc<Self>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Start the OS thread. `func` replaces the thread function when given.
    /// Returns `false` when the thread is already running.
    ///
    /// # Errors
    /// `NoThreadFunc` when no function was ever set, `Spawn` when the OS
    /// refuses a new thread.
    pub fn run(self: &Arc<Self>, func: Option<ThreadFunc>) -> Result<bool, ThreadError> {
        if let Some(func) = func {
            self.set_thread_func(func);
        }
        let func = self.thread_func().ok_or(ThreadError::NoThreadFunc(self.index))?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        // A previous run has returned from its function; reap it.
        if let Some(old) = unpoison(self.handle.lock()).take() {
            if old.join().is_err() {
                log::error!("thread {} panicked", self.index);
            }
        }

        let me = Arc::clone(self);
        let spawned = Builder::new()
            .name(format!("vcore-worker-{}", self.index))
            .spawn(move || {
                let _finished = Finished(&me);
                me.os_id.store(os_thread_id(), Ordering::Release);
                me.apply_priority();
                CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&me)));
                log::debug!("thread {} started", me.index);
                func(&me);
                log::debug!("thread {} finished", me.index);
            });
        match spawned {
            Ok(handle) => {
                *unpoison(self.handle.lock()) = Some(handle);
                Ok(true)
            }
            Err(source) => {
                self.running.store(false, Ordering::Release);
                Err(ThreadError::Spawn {
                    index: self.index,
                    source,
                })
            }
        }
    }

    /// Wait for [`resume`](Thread::resume), up to the default timeout.
    /// Returns `false` when the thread is not running or the wait timed out.
    pub fn suspend(&self) -> bool {
        self.is_running() && self.resume.wait() == WaitResult::Signaled
    }

    pub fn resume(&self) {
        self.resume.release();
    }

    /// Mark the thread stopped and signal completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.signal_done();
    }

    pub fn signal_done(&self) {
        self.done.release();
    }

    #[must_use]
    pub fn done_event(&self) -> &Semaphore {
        &self.done
    }

    /// Wait for the OS thread to exit. Returns `false` when it was never
    /// started, already joined, or is the calling thread.
    pub fn join(&self) -> bool {
        let mut slot = unpoison(self.handle.lock());
        let Some(handle) = slot.take() else {
            return false;
        };
        if handle.thread().id() == thread::current().id() {
            *slot = Some(handle);
            return false;
        }
        drop(slot);
        let joined = handle.join().is_ok();
        if !joined {
            log::error!("thread {} panicked", self.index);
        }
        self.running.store(false, Ordering::Release);
        joined
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Set the scheduling priority, `0` (lowest) to [`MAX_PRIORITY`].
    /// Takes effect immediately on a running thread where the platform
    /// supports it.
    ///
    /// # Errors
    /// `BadPriority` when out of range.
    pub fn set_priority(&self, priority: u32) -> Result<(), ThreadError> {
        if priority > MAX_PRIORITY {
            return Err(ThreadError::BadPriority(priority));
        }
        self.priority.store(priority, Ordering::Relaxed);
        self.apply_priority();
        Ok(())
    }

    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    fn apply_priority(&self) {
        let tid = self.os_id.load(Ordering::Acquire);
        if tid == 0 {
            return;
        }
        // 0..=4 maps onto nice 10, 5, 0, -5, -10.
        let nice = 10 - 5 * self.priority() as libc::c_int;
        // Safety: FFI call; the id names a thread of this process.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) } != 0 {
            log::debug!(
                "thread {}: setpriority({nice}) failed: {}",
                self.index,
                io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
    fn apply_priority(&self) {
        log::trace!("thread {}: priority {} recorded only", self.index, self.priority());
    }
}

/// Marks the thread stopped when its function returns or unwinds.
struct Finished<'a>(&'a Thread);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        let _ = CURRENT.try_with(|c| c.borrow_mut().take());
    }
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
fn os_thread_id() -> u64 {
    // Safety: gettid takes no arguments and cannot fail.
    u64::try_from(unsafe { libc::syscall(libc::SYS_gettid) }).unwrap_or(0)
}

#[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
fn os_thread_id() -> u64 {
    1
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("index", &self.index)
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn run_without_a_function_fails() {
        let t = Thread::new(3, 0);
        assert!(matches!(t.run(None), Err(ThreadError::NoThreadFunc(3))));
        assert!(!t.is_running());
    }

    #[test]
    fn run_is_idempotent_while_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let t = Thread::new(0, 1);
        let counter = calls.clone();
        let func: ThreadFunc = Arc::new(move |me: &Arc<Thread>| {
            counter.fetch_add(1, Ordering::SeqCst);
            me.suspend();
            me.signal_done();
        });
        assert!(t.run(Some(func)).unwrap());
        assert!(!t.run(None).unwrap());

        t.resume();
        assert!(t.done_event().wait().is_signaled());
        assert!(t.join());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!t.is_running());
    }

    #[test]
    fn worker_sees_its_own_handle() {
        let t = Thread::new(7, 0);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let out = seen.clone();
        t.run(Some(Arc::new(move |_: &Arc<Thread>| {
            let me = Thread::current_handle().unwrap();
            out.store(me.index(), Ordering::SeqCst);
        })))
        .unwrap();
        t.join();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(Thread::current_handle().is_none());
    }

    #[test]
    fn suspend_times_out_on_a_stopped_thread() {
        let t = Thread::new(0, 0);
        assert!(!t.suspend());
        t.stop();
        assert!(t.done_event().wait_timeout(Duration::from_millis(10)).is_signaled());
    }

    fn failing_worker(_: &Arc<Thread>) {
        panic!("worker failure");
    }

    #[test]
    fn panicking_function_leaves_the_thread_stopped() {
        let t = Thread::new(2, 0);
        t.run(Some(Arc::new(failing_worker))).unwrap();
        assert!(!t.join());
        assert!(!t.is_running());
        assert!(!t.is_started());
    }

    #[test]
    fn finished_thread_stays_started_until_joined() {
        let t = Thread::new(0, 0);
        t.run(Some(Arc::new(|me: &Arc<Thread>| me.signal_done()))).unwrap();
        assert!(t.done_event().wait().is_signaled());
        while t.is_running() {
            std::thread::yield_now();
        }
        assert!(t.is_started());
        assert!(t.join());
        assert!(!t.is_started());

        // a finished thread can be run again
        assert!(t.run(None).unwrap());
        assert!(t.done_event().wait().is_signaled());
        assert!(t.join());
    }

    #[test]
    fn priority_is_validated() {
        let t = Thread::new(0, 0);
        assert_eq!(t.priority(), NORMAL_PRIORITY);
        t.set_priority(0).unwrap();
        assert_eq!(t.priority(), 0);
        assert!(matches!(t.set_priority(5), Err(ThreadError::BadPriority(5))));
    }
}
