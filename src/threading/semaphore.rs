use std::time::{Duration, Instant};

use crate::sync::{Condvar, Mutex, unpoison};

/// Default time a wait blocks before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

// Slice each semaphore gets while polling a set.
const POLL_SLICE: Duration = Duration::from_millis(1);

/// Outcome of a semaphore wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

impl WaitResult {
    #[must_use]
    pub fn is_signaled(self) -> bool {
        self == Self::Signaled
    }
}

/// Counting semaphore.
///
/// `release` adds a signal; a wait consumes one, blocking until one is
/// available or the timeout passes. Signals released before anyone waits
/// are kept.
pub struct Semaphore {
    count: Mutex<usize>,
    signal: Condvar,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore {
    #[must_use]
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            signal: Condvar::new(),
        }
    }

    /// Wait up to [`DEFAULT_TIMEOUT`].
    pub fn wait(&self) -> WaitResult {
        self.wait_timeout(DEFAULT_TIMEOUT)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut count = unpoison(self.count.lock());
        while *count == 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return WaitResult::TimedOut;
            }
            count = unpoison(self.signal.wait_timeout(count, left)).0;
        }
        *count -= 1;
        WaitResult::Signaled
    }

    /// Consume a signal if one is pending.
    pub fn try_wait(&self) -> bool {
        let mut count = unpoison(self.count.lock());
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn release(&self) {
        *unpoison(self.count.lock()) += 1;
        self.signal.notify_one();
    }

    /// Signals pending right now.
    #[must_use]
    pub fn count(&self) -> usize {
        *unpoison(self.count.lock())
    }

    /// Wait for one signal from every semaphore within `timeout`.
    ///
    /// Returns `false` on timeout or when `sems` is empty. Signals already
    /// consumed before a timeout are not given back.
    pub fn wait_all(sems: &[&Self], timeout: Duration) -> bool {
        if sems.is_empty() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        sems.iter().all(|s| {
            s.wait_timeout(deadline.saturating_duration_since(Instant::now()))
                .is_signaled()
        })
    }

    /// Wait for a signal from any of `sems` within `timeout`. Returns the
    /// index of the semaphore that fired.
    pub fn wait_any(sems: &[&Self], timeout: Duration) -> Option<usize> {
        if sems.is_empty() {
            return None;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(i) = sems.iter().position(|s| s.try_wait()) {
                return Some(i);
            }
            for (i, s) in sems.iter().enumerate() {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return None;
                }
                if s.wait_timeout(left.min(POLL_SLICE)).is_signaled() {
                    return Some(i);
                }
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;

    #[test]
    fn signals_are_counted() {
        let sem = Semaphore::new(0);
        sem.release();
        sem.release();
        assert_eq!(sem.count(), 2);
        assert!(sem.wait().is_signaled());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_times_out() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert_eq!(sem.wait_timeout(Duration::from_millis(30)), WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn release_wakes_a_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        sem.release();
        assert_eq!(waiter.join().unwrap(), WaitResult::Signaled);
    }

    #[test]
    fn wait_all_needs_every_semaphore() {
        let a = Semaphore::new(1);
        let b = Semaphore::new(0);
        assert!(!Semaphore::wait_all(&[&a, &b], Duration::from_millis(20)));
        a.release();
        b.release();
        assert!(Semaphore::wait_all(&[&a, &b], Duration::from_millis(20)));
        assert!(!Semaphore::wait_all(&[], Duration::from_millis(1)));
    }

    #[test]
    fn wait_any_reports_the_signaled_index() {
        let sems: Vec<Arc<Semaphore>> = (0..3).map(|_| Arc::new(Semaphore::new(0))).collect();
        let third = sems[2].clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            third.release();
        });
        let refs: Vec<&Semaphore> = sems.iter().map(|s| s.as_ref()).collect();
        assert_eq!(Semaphore::wait_any(&refs, Duration::from_secs(5)), Some(2));
        t.join().unwrap();
        assert_eq!(Semaphore::wait_any(&refs, Duration::from_millis(5)), None);
    }
}
