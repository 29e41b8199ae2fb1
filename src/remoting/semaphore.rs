//! Admission control.
//!
//! A [`Semaphore`] bounds the number of in-flight asynchronous or one-way requests. Each
//! successful acquisition yields a [`Permit`] that gives its slot back exactly once: either
//! through an explicit [`Permit::release`] or when the permit is dropped, whichever happens
//! first.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct Semaphore {
    available: Mutex<usize>,
    released: Condvar,
    total: usize,
}

impl Semaphore {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(permits),
            released: Condvar::new(),
            total: permits,
        })
    }

    pub fn total_permits(&self) -> usize {
        self.total
    }

    pub fn available_permits(&self) -> usize {
        *self.available.lock()
    }

    /// Permits currently held by callers.
    pub fn in_use(&self) -> usize {
        self.total - self.available_permits()
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit::new(Arc::clone(self)))
    }

    /// Wait up to `timeout` for a permit.
    pub fn try_acquire_for(self: &Arc<Self>, timeout: Duration) -> Option<Permit> {
        let mut available = self.available.lock();
        if *available == 0 {
            self.released
                .wait_while_for(&mut available, |available| *available == 0, timeout);
        }
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit::new(Arc::clone(self)))
    }

    fn give_back(&self) {
        let mut available = self.available.lock();
        debug_assert!(*available < self.total, "permit released twice");
        *available += 1;
        self.released.notify_one();
    }
}

/// One acquired slot of a [`Semaphore`].
#[derive(Debug)]
pub struct Permit {
    semaphore: Arc<Semaphore>,
    released: AtomicBool,
}

impl Permit {
    fn new(semaphore: Arc<Semaphore>) -> Self {
        Self {
            semaphore,
            released: AtomicBool::new(false),
        }
    }

    /// Give the slot back. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.semaphore.give_back();
            return true;
        }
        false
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}
