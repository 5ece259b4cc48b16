//! Interruptible sleeping lock.
//!
//! Device operations serialize on a [`SleepLock`]. A caller waiting for it can be cancelled
//! through its [`Interrupt`] token, in which case the wait ends with
//! [`CdevError::Interrupted`] and no transfer is attempted. An uncontended acquisition always
//! succeeds, even with an interrupt pending.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::{CdevError, Result};

/// Upper bound on how long a waiter sleeps before re-checking its interrupt token.
const INTERRUPT_POLL: Duration = Duration::from_millis(2);

/// Cancellation signal for blocking waits, shared between the waiter and whoever cancels it.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    pending: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

pub struct SleepLock<T> {
    held: Mutex<bool>,
    released: Condvar,
    data: Mutex<T>,
}

impl<T> SleepLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            data: Mutex::new(data),
        }
    }

    /// Acquires the lock, giving up with [`CdevError::Interrupted`] if `intr` is raised while
    /// waiting.
    pub fn lock_interruptible(&self, intr: &Interrupt) -> Result<SleepLockGuard<'_, T>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            if intr.is_pending() {
                return Err(CdevError::Interrupted);
            }
            held = self
                .released
                .wait_timeout(held, INTERRUPT_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *held = true;
        drop(held);

        // The `held` flag admits a single owner, so this never contends with another guard. A
        // poisoned inner mutex only means a previous holder panicked mid-transfer; the guarded
        // state is plain counters and stays usable.
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(SleepLockGuard {
            lock: self,
            data: Some(data),
        })
    }

    /// Acquires the lock without any possibility of cancellation.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        match self.lock_interruptible(&Interrupt::new()) {
            Ok(guard) => guard,
            Err(_) => unreachable!("a fresh interrupt token is never raised"),
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    data: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.data {
            Some(data) => data,
            None => unreachable!("guard data is only taken on drop"),
        }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.data {
            Some(data) => data,
            None => unreachable!("guard data is only taken on drop"),
        }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the data before opening the gate so the next owner never blocks on it.
        self.data.take();
        let mut held = self.lock.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        drop(held);
        self.lock.released.notify_one();
    }
}
