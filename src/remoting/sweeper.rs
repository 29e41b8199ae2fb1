use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::{
    channel::{self, Sender},
    select,
};
use log::{info, warn};
use parking_lot::Mutex;

use crate::{error::Result, remoting::RemotingEngine};

/// Background thread timing out expired requests every `interval`.
///
/// Completion and callback scheduling happen through the engine with no table lock held,
/// so a slow callback can never stall a sweep.
pub struct TimeoutSweeper {
    stop: Mutex<Option<Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutSweeper {
    pub fn start(engine: Arc<RemotingEngine>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(0);
        let ticker = channel::tick(interval);

        let join = thread::Builder::new()
            .name("response-table-sweeper".into())
            .spawn(move || {
                info!("response table sweeper started, interval {interval:?}");
                loop {
                    select! {
                        recv(ticker) -> _ => engine.scan_response_table(),
                        recv(stopped) -> _ => break,
                    }
                }
                info!("response table sweeper stopped");
            })?;

        Ok(Self {
            stop: Mutex::new(Some(stop)),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn shutdown(&self) {
        drop(self.stop.lock().take());
        if let Some(join) = self.join.lock().take()
            && join.join().is_err()
        {
            warn!("response table sweeper panicked");
        }
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        config::RemotingConfig,
        remoting::{InvokeCallback, ResponseFuture},
    };

    #[test]
    fn expired_entries_are_swept() {
        let engine = Arc::new(RemotingEngine::new(RemotingConfig::default()).unwrap());
        let (tx, rx) = channel::unbounded();
        let callback: InvokeCallback = Box::new(move |outcome| tx.send(outcome).unwrap());
        engine.response_table().insert(Arc::new(ResponseFuture::new(
            42,
            "127.0.0.1:10911".into(),
            1,
            310,
            Duration::from_millis(10),
            Some(callback),
            None,
        )));

        let sweeper = TimeoutSweeper::start(Arc::clone(&engine), Duration::from_millis(20)).unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.unwrap_err().is_timeout());
        assert!(engine.response_table().is_empty());
        sweeper.shutdown();
    }

    #[test]
    fn shutdown_returns_promptly() {
        let engine = Arc::new(RemotingEngine::new(RemotingConfig::default()).unwrap());
        let sweeper = TimeoutSweeper::start(engine, Duration::from_secs(60)).unwrap();

        let start = Instant::now();
        sweeper.shutdown();
        sweeper.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
