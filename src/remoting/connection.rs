//! Outbound connection management.
//!
//! One [`ChannelWrapper`] per remote address holds the channel currently in use. When a
//! caller finds that channel broken it reconnects under the wrapper's lock; concurrent
//! callers wait for that one attempt instead of dialing themselves, so a burst of calls
//! against a dead connection produces a single new socket. When that attempt fails, the
//! callers that waited for it share its error rather than dialing in turn. The replaced
//! channel is closed off the caller's thread.
use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    RemotingError,
    error::Result,
    remoting::{Channel, ChannelContext},
};

/// Dials remote addresses.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, addr: &str, timeout: Duration) -> io::Result<TcpStream>;
}

/// Plain TCP, trying each resolved address in turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        let mut last = None;
        for resolved in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&resolved, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{addr} did not resolve"))
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Broken,
    Reconnecting,
}

/// Error of the last failed connect attempt, kept so waiters can report it.
#[derive(Debug, Clone)]
struct ConnectFailure {
    kind: io::ErrorKind,
    message: String,
}

pub struct ChannelWrapper {
    addr: String,
    current: RwLock<Option<Arc<Channel>>>,
    reconnect_lock: Mutex<()>,
    reconnecting: AtomicBool,
    /// Connect attempts finished so far, successful or not.
    attempts: AtomicU64,
    last_failure: Mutex<Option<ConnectFailure>>,
    last_response: Mutex<Option<Instant>>,
}

impl ChannelWrapper {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            current: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            last_response: Mutex::new(None),
        }
    }

    fn failed_attempt_error(&self) -> RemotingError {
        let failure = self.last_failure.lock().clone().unwrap_or(ConnectFailure {
            kind: io::ErrorKind::NotConnected,
            message: "reconnect in progress did not produce a channel".into(),
        });
        RemotingError::Connect {
            addr: self.addr.clone(),
            source: io::Error::new(failure.kind, failure.message),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.current.read().clone()
    }

    /// The current channel, if it can still carry traffic.
    pub fn active_channel(&self) -> Option<Arc<Channel>> {
        self.channel().filter(|channel| channel.is_active())
    }

    pub fn is_ok(&self) -> bool {
        self.active_channel().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        if self.reconnecting.load(Ordering::Acquire) {
            ConnectionState::Reconnecting
        } else if self.is_ok() {
            ConnectionState::Connected
        } else {
            ConnectionState::Broken
        }
    }

    /// Record that a response arrived over this connection.
    pub fn touch(&self) {
        *self.last_response.lock() = Some(Instant::now());
    }

    pub fn last_response_time(&self) -> Option<Instant> {
        *self.last_response.lock()
    }
}

pub struct ConnectionManager {
    channels: DashMap<String, Arc<ChannelWrapper>>,
    connector: Arc<dyn Connector>,
    context: ChannelContext,
    connect_timeout: Duration,
    connects: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        context: ChannelContext,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            connector,
            context,
            connect_timeout,
            connects: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn wrapper(&self, addr: &str) -> Option<Arc<ChannelWrapper>> {
        self.channels.get(addr).map(|entry| Arc::clone(entry.value()))
    }

    /// Physical connect attempts made so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// The active channel to `addr`, connecting or reconnecting as needed.
    pub fn get_or_connect(&self, addr: &str) -> Result<Arc<Channel>> {
        self.ensure_open()?;
        let wrapper = Arc::clone(
            self.channels
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(ChannelWrapper::new(addr)))
                .value(),
        );

        if let Some(channel) = wrapper.active_channel() {
            return Ok(channel);
        }
        self.reconnect(&wrapper)
    }

    /// Replace a broken channel. Callers that lose the race for the reconnect lock wait for
    /// the winner and reuse its channel, or its error if it failed.
    pub fn reconnect(&self, wrapper: &Arc<ChannelWrapper>) -> Result<Arc<Channel>> {
        self.ensure_open()?;
        let seen = wrapper.attempts.load(Ordering::Acquire);
        let _guard = match wrapper.reconnect_lock.try_lock() {
            Some(guard) => guard,
            None => {
                debug!("reconnect to {} already in progress, waiting", wrapper.addr);
                wrapper
                    .reconnect_lock
                    .try_lock_for(self.connect_timeout)
                    .ok_or_else(|| RemotingError::Connect {
                        addr: wrapper.addr.clone(),
                        source: io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out waiting for reconnect in progress",
                        ),
                    })?
            }
        };

        if let Some(channel) = wrapper.active_channel() {
            return Ok(channel);
        }
        if wrapper.attempts.load(Ordering::Acquire) != seen {
            debug!("reconnect to {} failed while waiting, not dialing again", wrapper.addr);
            return Err(wrapper.failed_attempt_error());
        }

        wrapper.reconnecting.store(true, Ordering::Release);
        let opened = self.open(&wrapper.addr);
        *wrapper.last_failure.lock() = match &opened {
            Err(RemotingError::Connect { source, .. }) => Some(ConnectFailure {
                kind: source.kind(),
                message: source.to_string(),
            }),
            Err(e) => Some(ConnectFailure {
                kind: io::ErrorKind::Other,
                message: e.to_string(),
            }),
            Ok(_) => None,
        };
        wrapper.attempts.fetch_add(1, Ordering::AcqRel);
        wrapper.reconnecting.store(false, Ordering::Release);
        let channel = opened?;

        let replaced = wrapper.current.write().replace(Arc::clone(&channel));
        if let Some(old) = replaced {
            close_later(old);
        }
        // close_all ran while we were dialing and will not see this channel.
        if self.closed.load(Ordering::Acquire) {
            channel.close();
            return Err(RemotingError::Shutdown);
        }
        Ok(channel)
    }

    /// Close and forget the connection to `addr`.
    pub fn close_channel(&self, addr: &str) {
        if let Some((_, wrapper)) = self.channels.remove(addr)
            && let Some(channel) = wrapper.current.write().take()
        {
            channel.close();
        }
    }

    /// Close every connection and refuse to dial from now on.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let addrs: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for addr in addrs {
            self.close_channel(&addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RemotingError::Shutdown);
        }
        Ok(())
    }

    fn open(&self, addr: &str) -> Result<Arc<Channel>> {
        self.connects.fetch_add(1, Ordering::AcqRel);
        let stream = self
            .connector
            .connect(addr, self.connect_timeout)
            .map_err(|source| {
                warn!("createChannel: connect remote host[{addr}] failed: {source}");
                RemotingError::Connect {
                    addr: addr.to_string(),
                    source,
                }
            })?;

        let channel = Channel::open(stream, self.context.clone())?;
        info!("createChannel: connect remote host[{addr}] success, channel {}", channel.id());
        Ok(channel)
    }
}

/// Close a replaced channel without blocking the caller that replaced it.
fn close_later(channel: Arc<Channel>) {
    let spawned = thread::Builder::new()
        .name(format!("channel-closer-{}", channel.id()))
        .spawn({
            let channel = Arc::clone(&channel);
            move || channel.close()
        });
    if let Err(e) = spawned {
        warn!("could not spawn closer thread ({e}), closing inline");
        channel.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, sync::Barrier};

    use super::*;
    use crate::{protocol::FrameCodec, remoting::channel::tests::Discard};

    /// Counts dials and slows them down so racing callers overlap.
    struct CountingConnector {
        dials: AtomicUsize,
        delay: Duration,
    }

    impl Connector for CountingConnector {
        fn connect(&self, addr: &str, timeout: Duration) -> io::Result<TcpStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            TcpConnector.connect(addr, timeout)
        }
    }

    /// Refuses every dial, slowly enough that callers pile up behind the first.
    struct RefusingConnector {
        dials: AtomicUsize,
    }

    impl Connector for RefusingConnector {
        fn connect(&self, _addr: &str, _timeout: Duration) -> io::Result<TcpStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
        }
    }

    /// Accepts and holds every connection until the test ends.
    fn listener() -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().take(4) {
                held.push(stream.unwrap());
            }
            thread::sleep(Duration::from_millis(500));
        });
        (addr, handle)
    }

    fn manager(connector: Arc<dyn Connector>) -> ConnectionManager {
        ConnectionManager::new(
            connector,
            ChannelContext {
                codec: FrameCodec::default(),
                idle_timeout: Duration::ZERO,
                write_queue_capacity: 64,
                handler: Arc::new(Discard),
                events: None,
            },
            Duration::from_secs(3),
        )
    }

    #[test]
    fn reuses_active_channel() {
        let (addr, _server) = listener();
        let manager = manager(Arc::new(TcpConnector));

        let first = manager.get_or_connect(&addr).unwrap();
        let second = manager.get_or_connect(&addr).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(manager.connect_count(), 1);
        assert_eq!(
            manager.wrapper(&addr).unwrap().state(),
            ConnectionState::Connected
        );
    }

    #[test]
    fn concurrent_reconnect_dials_once() {
        let (addr, _server) = listener();
        let connector = Arc::new(CountingConnector {
            dials: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let manager = Arc::new(manager(connector.clone()));

        let original = manager.get_or_connect(&addr).unwrap();
        original.close();

        let barrier = Arc::new(Barrier::new(10));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                let addr = addr.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.get_or_connect(&addr).unwrap().id()
                })
            })
            .collect();
        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_ne!(ids[0], original.id());
    }

    #[test]
    fn connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let manager = manager(Arc::new(TcpConnector));
        let err = manager.get_or_connect(&addr).unwrap_err();
        assert!(matches!(err, RemotingError::Connect { .. }));
        assert_eq!(
            manager.wrapper(&addr).unwrap().state(),
            ConnectionState::Broken
        );
    }

    #[test]
    fn close_channel_forgets_address() {
        let (addr, _server) = listener();
        let manager = manager(Arc::new(TcpConnector));

        let channel = manager.get_or_connect(&addr).unwrap();
        manager.close_channel(&addr);
        assert!(!channel.is_active());
        assert!(manager.wrapper(&addr).is_none());
    }

    #[test]
    fn touch_records_last_response() {
        let wrapper = ChannelWrapper::new("127.0.0.1:1");
        assert!(wrapper.last_response_time().is_none());
        wrapper.touch();
        assert!(wrapper.last_response_time().is_some());
        assert_eq!(wrapper.state(), ConnectionState::Broken);
    }

    #[test]
    fn waiters_share_a_failed_reconnect() {
        let connector = Arc::new(RefusingConnector {
            dials: AtomicUsize::new(0),
        });
        let manager = Arc::new(manager(connector.clone()));
        let barrier = Arc::new(Barrier::new(10));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.get_or_connect("10.255.255.1:9876").unwrap_err()
                })
            })
            .collect();

        let start = Instant::now();
        for handle in handles {
            let err = handle.join().unwrap();
            assert!(
                matches!(
                    err,
                    RemotingError::Connect { ref source, .. }
                        if source.kind() == io::ErrorKind::ConnectionRefused
                ),
                "{err}"
            );
        }
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn closed_manager_refuses_to_dial() {
        let (addr, _server) = listener();
        let connector = Arc::new(CountingConnector {
            dials: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let manager = manager(connector.clone());

        manager.close_all();
        assert!(manager.is_closed());
        assert!(matches!(
            manager.get_or_connect(&addr),
            Err(RemotingError::Shutdown)
        ));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }
}
