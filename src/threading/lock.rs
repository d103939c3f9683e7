//! Reentrant critical sections and lazily created object locks.
//!
//! Locking can be switched off process-wide for single-threaded programs.
//! A disabled lock still records its holder, and a second thread entering
//! while it is held panics instead of racing.

use std::ptr;

use thiserror::Error;

use crate::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crate::sync::thread::{self, ThreadId};
use crate::sync::{Condvar, Mutex, unpoison};

crate::sync::static_atomic! {
    static DO_LOCK: AtomicBool = AtomicBool::new(true);
}

/// Whether critical sections block (`true`) or only check for misuse.
#[must_use]
pub fn locking_enabled() -> bool {
    DO_LOCK.load(Ordering::Acquire)
}

/// Turn blocking locks on or off for the whole process. Switch only while no
/// lock is held.
pub fn set_locking(enabled: bool) {
    log::debug!("locking {}", if enabled { "enabled" } else { "disabled" });
    DO_LOCK.store(enabled, Ordering::Release);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock is not held")]
    NotLocked,
    #[error("lock is held by another thread")]
    NotOwner,
    #[error("lock is still held ({count} levels)")]
    Held { count: usize },
}

#[derive(Default)]
struct Owner {
    thread: Option<ThreadId>,
    count: usize,
}

/// Reentrant mutual-exclusion lock with explicit enter/leave.
///
/// The owning thread may enter again; the lock is released when every
/// `enter` has been matched by a `leave`.
pub struct CritSec {
    state: Mutex<Owner>,
    released: Condvar,
}

impl Default for CritSec {
    fn default() -> Self {
        Self::new()
    }
}

impl CritSec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Owner::default()),
            released: Condvar::new(),
        }
    }

    /// Block until the calling thread holds the lock.
    ///
    /// # Panics
    /// When locking is disabled and another thread holds the lock.
    pub fn enter(&self) {
        let me = thread::current().id();
        let mut owner = unpoison(self.state.lock());
        if owner.thread == Some(me) {
            owner.count += 1;
            return;
        }
        if !locking_enabled() {
            assert!(
                owner.thread.is_none(),
                "CritSec entered by two threads while locking is disabled"
            );
        }
        while owner.thread.is_some() {
            owner = unpoison(self.released.wait(owner));
        }
        owner.thread = Some(me);
        owner.count = 1;
    }

    /// Take the lock only if nobody holds it, including the caller.
    pub fn try_enter(&self) -> bool {
        let mut owner = unpoison(self.state.lock());
        if owner.count > 0 {
            return false;
        }
        owner.thread = Some(thread::current().id());
        owner.count = 1;
        true
    }

    /// Undo one `enter`.
    ///
    /// # Errors
    /// `NotLocked` when the lock is free, `NotOwner` when another thread
    /// holds it.
    pub fn leave(&self) -> Result<(), LockError> {
        let mut owner = unpoison(self.state.lock());
        match owner.thread {
            None => return Err(LockError::NotLocked),
            Some(t) if t != thread::current().id() => return Err(LockError::NotOwner),
            Some(_) => {}
        }
        owner.count -= 1;
        if owner.count == 0 {
            owner.thread = None;
            self.released.notify_one();
        }
        Ok(())
    }

    /// Enter and return a guard that leaves on drop.
    #[must_use]
    pub fn lock(&self) -> Lock<'_> {
        self.enter();
        Lock { crit: self }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        unpoison(self.state.lock()).count > 0
    }

    /// Nesting depth of the current holder.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        unpoison(self.state.lock()).count
    }

    #[must_use]
    pub fn owner_is_current(&self) -> bool {
        unpoison(self.state.lock()).thread == Some(thread::current().id())
    }
}

/// Scope guard over a [`CritSec`].
#[must_use = "the lock is released when the guard is dropped"]
pub struct Lock<'a> {
    crit: &'a CritSec,
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.crit.leave() {
            log::error!("Lock guard release failed: {e}");
        }
    }
}

// Claimed by a thread that is still constructing the lock.
const CREATING: *mut CritSec = ptr::dangling_mut();

/// Object with a lock created on first use.
///
/// Creation is race free: concurrent first users agree on a single
/// [`CritSec`] and exactly one is ever constructed.
pub struct LockObj {
    lock: AtomicPtr<CritSec>,
}

impl Default for LockObj {
    fn default() -> Self {
        Self::new()
    }
}

impl LockObj {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Create the lock if it does not exist yet. Returns `true` when this
    /// call created it.
    pub fn make_lock(&self) -> bool {
        self.get_or_make().1
    }

    fn get_or_make(&self) -> (&CritSec, bool) {
        loop {
            match self
                .lock
                .compare_exchange(ptr::null_mut(), CREATING, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    let crit = Box::into_raw(Box::new(CritSec::new()));
                    self.lock.store(crit, Ordering::Release);
                    // Safety: installed above and freed only through `&mut self`.
                    return (unsafe { &*crit }, true);
                }
                Err(p) if p == CREATING => crate::sync::hint::spin_loop(),
                // Safety: a published lock lives until `&mut self` frees it.
                Err(p) => return (unsafe { &*p }, false),
            }
            thread::yield_now();
        }
    }

    /// The lock, if it has been created.
    #[must_use]
    pub fn get_lock(&self) -> Option<&CritSec> {
        let p = self.lock.load(Ordering::Acquire);
        if p.is_null() || p == CREATING {
            None
        } else {
            // Safety: a published lock lives until `&mut self` frees it.
            Some(unsafe { &*p })
        }
    }

    /// Destroy the lock. The next use creates a fresh one.
    ///
    /// # Errors
    /// `Held` when the lock is currently held.
    pub fn kill_lock(&mut self) -> Result<(), LockError> {
        let p = self.lock.load(Ordering::Acquire);
        if p.is_null() {
            return Ok(());
        }
        // Safety: exclusive access; the pointer came from Box::into_raw.
        let count = unsafe { (*p).lock_count() };
        if count > 0 {
            return Err(LockError::Held { count });
        }
        self.lock.store(ptr::null_mut(), Ordering::Release);
        // Safety: as above; nobody else can observe the lock any more.
        drop(unsafe { Box::from_raw(p) });
        Ok(())
    }

    /// Acquire the lock, creating it if needed.
    pub fn lock(&self) {
        self.get_or_make().0.enter();
    }

    /// Acquire the lock only if nobody holds it.
    pub fn try_lock(&self) -> bool {
        self.get_or_make().0.try_enter()
    }

    /// Release one level of the lock.
    ///
    /// # Errors
    /// `NotLocked` when there is no lock or it is not held, `NotOwner` when
    /// another thread holds it.
    pub fn unlock(&self) -> Result<(), LockError> {
        self.get_lock().ok_or(LockError::NotLocked)?.leave()
    }

    /// Acquire the lock for the lifetime of the returned guard.
    #[must_use]
    pub fn obj_lock(&self) -> ObjLock<'_> {
        ObjLock::new(self)
    }
}

impl Drop for LockObj {
    fn drop(&mut self) {
        let p = self.lock.load(Ordering::Acquire);
        if !p.is_null() {
            // Safety: exclusive access; the pointer came from Box::into_raw.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

/// Scope guard holding a [`LockObj`]'s lock.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ObjLock<'a> {
    crit: &'a CritSec,
}

impl<'a> ObjLock<'a> {
    pub fn new(obj: &'a LockObj) -> Self {
        let crit = obj.get_or_make().0;
        crit.enter();
        Self { crit }
    }
}

impl Drop for ObjLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.crit.leave() {
            log::error!("ObjLock release failed: {e}");
        }
    }
}
