//! Scoped locking against the audio server's worker thread
//!
//! Every mutation of engine or stream state happens while holding the single
//! [`LoopLock`]. The event-loop worker takes the same lock before it delivers
//! any backend callback, so control calls and callbacks are serialized.
//!
//! [`ScopedLoopLock`] is the guard: it releases on every exit path, exposes
//! the condition-variable wait used by `start()`, and can carry a "destroy
//! owner on release" action that runs only after the mutex is unlocked.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// Mutex plus wait condition protecting state of type `T`
pub struct LoopLock<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> LoopLock<T> {
    /// Wrap `state` in a new lock
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    /// Acquire the lock for the lifetime of the returned guard
    pub fn acquire(&self) -> ScopedLoopLock<'_, T> {
        ScopedLoopLock {
            lock: self,
            guard: Some(self.state.lock()),
            on_release: None,
        }
    }

    /// Wake every thread waiting on this lock
    pub fn signal(&self) {
        self.cond.notify_all();
    }
}

impl<T: Default> Default for LoopLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for LoopLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopLock")
            .field("locked", &self.state.is_locked())
            .finish()
    }
}

/// RAII guard over a [`LoopLock`]
pub struct ScopedLoopLock<'a, T> {
    lock: &'a LoopLock<T>,
    // Always `Some` until drop.
    guard: Option<MutexGuard<'a, T>>,
    on_release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a, T> ScopedLoopLock<'a, T> {
    /// Release the lock and block until signaled or `deadline` passes.
    /// Returns `true` when the deadline passed.
    pub fn wait_until(&mut self, deadline: Instant) -> bool {
        match self.guard.as_mut() {
            Some(guard) => self.lock.cond.wait_until(guard, deadline).timed_out(),
            None => true,
        }
    }

    /// Block until `done` holds or `timeout` elapses. Returns `true` if `done`
    /// held when the wait ended.
    pub fn wait_while_for(&mut self, timeout: Duration, mut done: impl FnMut(&mut T) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&mut **self) {
                return true;
            }
            if self.wait_until(deadline) {
                return done(&mut **self);
            }
        }
    }

    /// Wake every thread waiting on the lock without releasing it
    pub fn signal(&self) {
        self.lock.signal();
    }

    /// Run `destroy` right after the mutex is released.
    ///
    /// Used on the abnormal-startup path to free an event loop whose worker
    /// may itself be blocked on this lock.
    pub fn destroy_owner_on_release(&mut self, destroy: impl FnOnce() + Send + 'a) {
        self.on_release = Some(Box::new(destroy));
    }
}

impl<T> Deref for ScopedLoopLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.guard.as_ref() {
            Some(guard) => guard,
            None => unreachable!("loop lock guard used after release"),
        }
    }
}

impl<T> DerefMut for ScopedLoopLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.guard.as_mut() {
            Some(guard) => guard,
            None => unreachable!("loop lock guard used after release"),
        }
    }
}

impl<T> Drop for ScopedLoopLock<'_, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(destroy) = self.on_release.take() {
            destroy();
        }
    }
}
