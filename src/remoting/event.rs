//! Channel lifecycle notification.
//!
//! I/O threads never call user listeners directly. They [`put`](EventNotifier::put) a
//! [`ChannelEvent`] on a bounded queue, which a single consumer thread drains into the
//! registered [`ChannelEventListener`]. When the queue is full the event is dropped and
//! logged; the I/O thread never blocks.
use std::{
    fmt,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam::{
    channel::{self, Receiver, Sender, TrySendError},
    select,
};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{error::Result, remoting::Channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventType {
    Connect,
    Close,
    Idle,
    Exception,
    Active,
}

#[derive(Clone)]
pub struct ChannelEvent {
    pub kind: ChannelEventType,
    pub remote_addr: String,
    pub channel: Arc<Channel>,
}

impl fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEvent")
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .field("channel", &self.channel.id())
            .finish()
    }
}

/// Receives channel lifecycle events on the notifier thread.
#[allow(unused_variables)]
pub trait ChannelEventListener: Send + Sync + 'static {
    fn on_channel_connect(&self, remote_addr: &str, channel: &Arc<Channel>) {}

    fn on_channel_close(&self, remote_addr: &str, channel: &Arc<Channel>) {}

    fn on_channel_exception(&self, remote_addr: &str, channel: &Arc<Channel>) {}

    fn on_channel_idle(&self, remote_addr: &str, channel: &Arc<Channel>) {}

    fn on_channel_active(&self, remote_addr: &str, channel: &Arc<Channel>) {}
}

pub struct EventNotifier {
    events: Sender<ChannelEvent>,
    stop: Mutex<Option<Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventNotifier {
    pub fn start(listener: Arc<dyn ChannelEventListener>, capacity: usize) -> Result<Self> {
        let (events, queue) = channel::bounded(capacity);
        let (stop, stopped) = channel::bounded(0);

        let join = thread::Builder::new()
            .name("channel-event-notifier".into())
            .spawn(move || run(queue, stopped, listener))?;

        Ok(Self {
            events,
            stop: Mutex::new(Some(stop)),
            join: Mutex::new(Some(join)),
        })
    }

    /// Enqueue without blocking. Dropped (and logged) when the queue is full.
    pub fn put(&self, event: ChannelEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("event queue size [{}] over the limit, so drop this event {event:?}", self.events.len());
            }
            Err(TrySendError::Disconnected(event)) => {
                debug!("event notifier stopped, dropping {event:?}");
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    pub fn shutdown(&self) {
        drop(self.stop.lock().take());
        let Some(join) = self.join.lock().take() else {
            return;
        };
        // The last event may drop the last handle on the notifier thread itself.
        if join.thread().id() == thread::current().id() {
            return;
        }
        if join.join().is_err() {
            warn!("channel event notifier panicked");
        }
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(queue: Receiver<ChannelEvent>, stopped: Receiver<()>, listener: Arc<dyn ChannelEventListener>) {
    info!("channel event notifier started");
    loop {
        select! {
            recv(queue) -> event => match event {
                Ok(event) => deliver(listener.as_ref(), &event),
                Err(_) => break,
            },
            recv(stopped) -> _ => break,
        }
    }
    info!("channel event notifier stopped");
}

fn deliver(listener: &dyn ChannelEventListener, event: &ChannelEvent) {
    let addr = event.remote_addr.as_str();
    match event.kind {
        ChannelEventType::Connect => listener.on_channel_connect(addr, &event.channel),
        ChannelEventType::Close => listener.on_channel_close(addr, &event.channel),
        ChannelEventType::Idle => listener.on_channel_idle(addr, &event.channel),
        ChannelEventType::Exception => listener.on_channel_exception(addr, &event.channel),
        ChannelEventType::Active => listener.on_channel_active(addr, &event.channel),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::remoting::channel::tests::loopback_channel;

    struct Recorder(Sender<(ChannelEventType, String)>);

    impl ChannelEventListener for Recorder {
        fn on_channel_connect(&self, remote_addr: &str, _channel: &Arc<Channel>) {
            self.0.send((ChannelEventType::Connect, remote_addr.into())).unwrap();
        }

        fn on_channel_close(&self, remote_addr: &str, _channel: &Arc<Channel>) {
            self.0.send((ChannelEventType::Close, remote_addr.into())).unwrap();
        }

        fn on_channel_idle(&self, remote_addr: &str, _channel: &Arc<Channel>) {
            self.0.send((ChannelEventType::Idle, remote_addr.into())).unwrap();
        }
    }

    /// Blocks on the first event until released.
    struct Stuck(Receiver<()>);

    impl ChannelEventListener for Stuck {
        fn on_channel_connect(&self, _remote_addr: &str, _channel: &Arc<Channel>) {
            let _ = self.0.recv();
        }
    }

    fn event(kind: ChannelEventType, channel: &Arc<Channel>) -> ChannelEvent {
        ChannelEvent {
            kind,
            remote_addr: "peer".into(),
            channel: Arc::clone(channel),
        }
    }

    #[test]
    fn events_reach_listener_in_order() {
        let (tx, rx) = channel::unbounded();
        let notifier = EventNotifier::start(Arc::new(Recorder(tx)), 16).unwrap();
        let (channel, _peer) = loopback_channel();

        notifier.put(event(ChannelEventType::Connect, &channel));
        notifier.put(event(ChannelEventType::Idle, &channel));
        notifier.put(event(ChannelEventType::Close, &channel));

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap().0, ChannelEventType::Connect);
        assert_eq!(rx.recv_timeout(timeout).unwrap().0, ChannelEventType::Idle);
        assert_eq!(rx.recv_timeout(timeout).unwrap().0, ChannelEventType::Close);
        notifier.shutdown();
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let (release, released) = channel::bounded(0);
        let notifier = EventNotifier::start(Arc::new(Stuck(released)), 2).unwrap();
        let (channel, _peer) = loopback_channel();

        // First event occupies the consumer, two fill the queue, the rest are dropped.
        for _ in 0..10 {
            notifier.put(event(ChannelEventType::Connect, &channel));
        }
        assert!(notifier.pending() <= 2);

        drop(release);
        notifier.shutdown();
    }
}
