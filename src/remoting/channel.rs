//! A single framed TCP connection.
//!
//! Each [`Channel`] owns two threads. The reader decodes frames and hands every command to
//! the [`InboundHandler`]; the writer drains a bounded outbound queue so callers never block
//! on a slow peer. A peer that stops reading fills the queue, and further sends fail instead
//! of buffering. Read inactivity longer than the idle timeout closes the channel, including
//! a peer stalled in the middle of a frame, and so does a fatal decode error or a failed
//! write. [`Channel::close`] is idempotent and reports exactly
//! one close event.
use std::{
    fmt,
    io::BufReader,
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    RemotingCommand, RemotingError,
    error::Result,
    protocol::{FrameCodec, FrameReader, FrameWriter, Inbound},
    remoting::{ChannelEvent, ChannelEventType, EventNotifier},
};

/// Outcome of writing one frame to the socket.
pub type WriteListener = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Receives every command read off a channel, on that channel's reader thread.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_command(&self, channel: &Arc<Channel>, command: RemotingCommand);
}

/// Everything a channel needs besides its socket.
#[derive(Clone)]
pub struct ChannelContext {
    pub codec: FrameCodec,
    /// `Duration::ZERO` disables idle detection.
    pub idle_timeout: Duration,
    /// Frames queued for the writer before [`Channel::send`] starts failing.
    pub write_queue_capacity: usize,
    pub handler: Arc<dyn InboundHandler>,
    pub events: Option<Arc<EventNotifier>>,
}

struct Outbound {
    frame: Vec<u8>,
    listener: Option<WriteListener>,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub struct Channel {
    id: u64,
    remote_addr: String,
    local_addr: String,
    stream: TcpStream,
    codec: FrameCodec,
    outbound: Mutex<Option<Sender<Outbound>>>,
    closed: AtomicBool,
    events: Option<Arc<EventNotifier>>,
}

impl Channel {
    /// Take ownership of a connected stream and start its reader and writer threads.
    pub fn open(stream: TcpStream, context: ChannelContext) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let idle = (!context.idle_timeout.is_zero()).then_some(context.idle_timeout);
        stream.set_read_timeout(idle)?;

        let remote_addr = stream.peer_addr()?.to_string();
        let local_addr = stream.local_addr()?.to_string();
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;
        let (sender, queue) = channel::bounded(context.write_queue_capacity.max(1));
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);

        let channel = Arc::new(Self {
            id,
            remote_addr,
            local_addr,
            stream,
            codec: context.codec,
            outbound: Mutex::new(Some(sender)),
            closed: AtomicBool::new(false),
            events: context.events,
        });

        let writer = FrameWriter::new(write_half, context.codec);
        let weak = Arc::downgrade(&channel);
        thread::Builder::new()
            .name(format!("channel-writer-{id}"))
            .spawn(move || write_loop(queue, writer, weak))?;

        channel.emit(ChannelEventType::Connect);

        let reader = FrameReader::new(BufReader::new(read_half), context.codec);
        let handler = context.handler;
        let reading = Arc::clone(&channel);
        if let Err(e) = thread::Builder::new()
            .name(format!("channel-reader-{id}"))
            .spawn(move || read_loop(reading, reader, handler))
        {
            channel.close();
            return Err(e.into());
        }

        debug!("opened channel {id} {} -> {}", channel.local_addr, channel.remote_addr);
        Ok(channel)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Frames queued but not yet handed to the socket.
    pub fn pending_writes(&self) -> usize {
        self.outbound.lock().as_ref().map_or(0, Sender::len)
    }

    /// Queue an encoded frame. Fails immediately if the channel is closed or its write queue
    /// is full; otherwise the listener, if any, later learns whether the socket write
    /// succeeded.
    pub fn send(&self, frame: Vec<u8>, listener: Option<WriteListener>) -> Result<()> {
        let outbound = self.outbound.lock();
        let reason = match outbound.as_ref() {
            Some(sender) if self.is_active() => match sender.try_send(Outbound { frame, listener }) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "write queue to {} is full, {} frames pending",
                        self.remote_addr,
                        sender.len()
                    );
                    "write queue is full"
                }
                Err(TrySendError::Disconnected(_)) => "channel is closed",
            },
            _ => "channel is closed",
        };

        Err(RemotingError::SendFailed {
            addr: self.remote_addr.clone(),
            reason: reason.into(),
        })
    }

    pub fn write_command(
        &self,
        command: &RemotingCommand,
        listener: Option<WriteListener>,
    ) -> Result<()> {
        let frame = self.codec.encode(command)?;
        self.send(frame, listener)
    }

    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of channel {} returned {e}", self.id);
        }
        // Writer drains what is left and exits once the queue disconnects.
        drop(self.outbound.lock().take());

        info!("closeChannel: close the connection to remote address[{}]", self.remote_addr);
        self.emit(ChannelEventType::Close);
    }

    fn emit(self: &Arc<Self>, kind: ChannelEventType) {
        if let Some(events) = &self.events {
            events.put(ChannelEvent {
                kind,
                remote_addr: self.remote_addr.clone(),
                channel: Arc::clone(self),
            });
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

fn read_loop(
    channel: Arc<Channel>,
    mut reader: FrameReader<BufReader<TcpStream>>,
    handler: Arc<dyn InboundHandler>,
) {
    channel.emit(ChannelEventType::Active);

    loop {
        match reader.read_command() {
            Ok(Inbound::Command(command)) => handler.on_command(&channel, command),
            Ok(Inbound::Idle) => {
                warn!("channel {} idle, closing", channel.remote_addr);
                channel.emit(ChannelEventType::Idle);
                break;
            }
            Ok(Inbound::Closed) => {
                debug!("channel {} closed by peer", channel.remote_addr);
                break;
            }
            Err(_) if !channel.is_active() => break,
            Err(e) => {
                if e.is_connection_fatal() {
                    warn!("undecodable frame from {}, closing: {e}", channel.remote_addr);
                } else {
                    info!("read from {} failed: {e}", channel.remote_addr);
                }
                channel.emit(ChannelEventType::Exception);
                break;
            }
        }
    }

    channel.close();
}

fn write_loop(queue: Receiver<Outbound>, mut writer: FrameWriter<TcpStream>, channel: Weak<Channel>) {
    while let Ok(Outbound { frame, listener }) = queue.recv() {
        let outcome = writer.write_frame(&frame);
        let failed = outcome.is_err();

        if let Err(e) = &outcome {
            warn!("write to channel failed: {e}");
        }
        if let Some(listener) = listener {
            listener(outcome);
        }
        if failed && let Some(channel) = channel.upgrade() {
            channel.close();
        }
    }
}
