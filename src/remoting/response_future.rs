//! In-flight request tracking.
//!
//! A [`ResponseFuture`] is created for every sync or async request and lives in the
//! [`ResponseTable`](super::ResponseTable) until exactly one terminal transition happens:
//! a response arrives, the write fails, or the request times out. Whoever wins that
//! transition releases the admission permit and wakes the waiter; everybody else gets
//! `false` back and must do nothing.
use std::{
    fmt,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{RemotingCommand, error::Result, remoting::Permit};

/// Completion callback of an asynchronous invocation.
pub type InvokeCallback = Box<dyn FnOnce(Result<RemotingCommand>) + Send + 'static>;

enum Slot {
    Pending,
    Ready(Result<RemotingCommand>),
    Taken,
}

pub struct ResponseFuture {
    opaque: i32,
    remote_addr: String,
    channel_id: u64,
    request_code: i32,
    timeout: Duration,
    begin: Instant,
    callback: Mutex<Option<InvokeCallback>>,
    permit: Option<Permit>,
    slot: Mutex<Slot>,
    gate: Condvar,
}

impl ResponseFuture {
    pub fn new(
        opaque: i32,
        remote_addr: String,
        channel_id: u64,
        request_code: i32,
        timeout: Duration,
        callback: Option<InvokeCallback>,
        permit: Option<Permit>,
    ) -> Self {
        Self {
            opaque,
            remote_addr,
            channel_id,
            request_code,
            timeout,
            begin: Instant::now(),
            callback: Mutex::new(callback),
            permit,
            slot: Mutex::new(Slot::Pending),
            gate: Condvar::new(),
        }
    }

    pub fn opaque(&self) -> i32 {
        self.opaque
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Identity of the channel the request was written to.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn request_code(&self) -> i32 {
        self.request_code
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn begin(&self) -> Instant {
        self.begin
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.begin) > self.timeout
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    /// Terminal transition. Returns `true` for the single caller that won it.
    pub fn complete(&self, outcome: Result<RemotingCommand>) -> bool {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Pending) {
                return false;
            }
            *slot = Slot::Ready(outcome);
        }

        if let Some(permit) = &self.permit {
            permit.release();
        }
        self.gate.notify_all();
        true
    }

    /// Block until the future completes or `timeout` elapses, then take the outcome.
    pub fn wait_response(&self, timeout: Duration) -> Option<Result<RemotingCommand>> {
        let mut slot = self.slot.lock();
        self.gate
            .wait_while_for(&mut slot, |slot| matches!(slot, Slot::Pending), timeout);

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(outcome) => Some(outcome),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Hand the outcome to the registered callback. Runs the callback at most once over the
    /// life of the future, and only after completion.
    pub fn execute_callback(&self) {
        let (callback, outcome) = {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Ready(_)) {
                return;
            }
            let Some(callback) = self.callback.lock().take() else {
                return;
            };
            match std::mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(outcome) => (callback, outcome),
                _ => unreachable!("slot checked ready under the same lock"),
            }
        };
        callback(outcome);
    }

    pub fn release_permit(&self) {
        if let Some(permit) = &self.permit {
            permit.release();
        }
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("opaque", &self.opaque)
            .field("remote_addr", &self.remote_addr)
            .field("request_code", &self.request_code)
            .field("timeout", &self.timeout)
            .field("done", &self.is_done())
            .finish()
    }
}
