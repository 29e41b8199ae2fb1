use std::thread;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, error};
use parking_lot::Mutex;

use crate::{RemotingError, error::Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads fed from one bounded job queue.
///
/// [`ThreadPool::execute`] never blocks: a full queue rejects the job with
/// [`RemotingError::Overloaded`]. Dropping the pool (or calling [`ThreadPool::shutdown`]) closes the queue, lets workers
/// finish the jobs already queued, and joins them.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    capacity: usize,
    workers: Mutex<Vec<Worker>>,
    sender: Mutex<Option<Sender<Job>>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize, capacity: usize) -> Result<Self> {
        assert!(size > 0);
        assert!(capacity > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = channel::bounded(capacity);

        for i in 0..size {
            workers.push(Worker::new(name, i, receiver.clone())?);
        }

        Ok(Self {
            name: name.to_string(),
            capacity,
            workers: Mutex::new(workers),
            sender: Mutex::new(Some(sender)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs queued and not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, Sender::len)
    }

    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(RemotingError::Shutdown);
        };

        sender.try_send(Box::new(f)).map_err(|e| match e {
            TrySendError::Full(_) => RemotingError::Overloaded {
                pool: self.name.clone(),
                capacity: self.capacity,
            },
            TrySendError::Disconnected(_) => RemotingError::Shutdown,
        })
    }

    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let current = thread::current().id();
        for worker in self.workers.lock().drain(..) {
            debug!("shutting down {} worker {}", self.name, worker.id);

            // A job may shut down the pool it runs on; never join ourselves.
            if worker.thread.thread().id() == current {
                continue;
            }
            if worker.thread.join().is_err() {
                error!("{} worker {} panicked", self.name, worker.id);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(pool: &str, id: usize, receiver: Receiver<Job>) -> Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("{pool}-{id}"))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
                debug!("worker {id} disconnected");
            })?;

        Ok(Self { id, thread })
    }
}
