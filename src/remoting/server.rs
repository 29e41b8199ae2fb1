use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    RemotingCommand,
    config::RemotingConfig,
    error::Result,
    protocol::FrameCodec,
    remoting::{
        Channel, ChannelContext, ChannelEventListener, EventNotifier, InboundHandler,
        InvokeCallback, RemotingEngine, RequestProcessor, RpcHook, ThreadPool, TimeoutSweeper,
    },
};

/// Accepts connections and serves registered request codes. Can also call back into a
/// connected client over the channel that client opened.
pub struct RemotingServer {
    address: SocketAddr,
    engine: Arc<RemotingEngine>,
    context: ChannelContext,
    channels: Arc<DashMap<u64, Arc<Channel>>>,
    notifier: Option<Arc<EventNotifier>>,
    sweeper: Mutex<Option<TimeoutSweeper>>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl RemotingServer {
    pub fn new(
        address: SocketAddr,
        config: RemotingConfig,
        listener: Option<Arc<dyn ChannelEventListener>>,
    ) -> Result<Self> {
        let notifier = listener
            .map(|listener| EventNotifier::start(listener, config.event_queue_capacity))
            .transpose()?
            .map(Arc::new);

        let engine = Arc::new(RemotingEngine::new(config.clone())?);
        let handler: Arc<dyn InboundHandler> = engine.clone();
        let context = ChannelContext {
            codec: FrameCodec::new(config.max_frame_length),
            idle_timeout: config.channel_idle_timeout,
            write_queue_capacity: config.write_queue_capacity,
            handler,
            events: notifier.clone(),
        };

        Ok(Self {
            address,
            engine,
            context,
            channels: Arc::new(DashMap::new()),
            notifier,
            sweeper: Mutex::new(None),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn engine(&self) -> &Arc<RemotingEngine> {
        &self.engine
    }

    pub fn register_processor(
        &self,
        code: i32,
        processor: Arc<dyn RequestProcessor>,
        pool: Option<Arc<ThreadPool>>,
    ) {
        self.engine.register_processor(code, processor, pool);
    }

    pub fn register_default_processor(
        &self,
        processor: Arc<dyn RequestProcessor>,
        pool: Option<Arc<ThreadPool>>,
    ) {
        self.engine.register_default_processor(processor, pool);
    }

    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.engine.register_rpc_hook(hook);
    }

    /// Bind and start accepting. Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.address)?;
        let local_addr = listener.local_addr()?;
        info!("listening at {local_addr}");

        *self.sweeper.lock() = Some(TimeoutSweeper::start(
            Arc::clone(&self.engine),
            self.engine.config().sweep_interval,
        )?);

        let context = self.context.clone();
        let channels = Arc::clone(&self.channels);
        let stopped = Arc::clone(&self.stopped);
        let acceptor = thread::Builder::new()
            .name("remoting-acceptor".into())
            .spawn(move || accept_loop(listener, context, channels, stopped))?;

        *self.acceptor.lock() = Some(acceptor);
        *self.local_addr.lock() = Some(local_addr);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Currently open inbound channels.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.retain(|_, channel| channel.is_active());
        self.channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn invoke_sync(
        &self,
        channel: &Arc<Channel>,
        request: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand> {
        self.engine.invoke_sync(channel, request, timeout)
    }

    pub fn invoke_async<F>(
        &self,
        channel: &Arc<Channel>,
        request: RemotingCommand,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<RemotingCommand>) + Send + 'static,
    {
        let callback: InvokeCallback = Box::new(callback);
        self.engine.invoke_async(channel, request, timeout, callback)
    }

    pub fn invoke_oneway(&self, channel: &Arc<Channel>, request: RemotingCommand) -> Result<()> {
        self.engine.invoke_oneway(channel, request)
    }

    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wake the acceptor blocked in accept().
        if let Some(addr) = self.local_addr()
            && let Err(e) = TcpStream::connect(addr)
        {
            debug!("acceptor wake-up connect failed: {e}");
        }
        if let Some(acceptor) = self.acceptor.lock().take()
            && acceptor.join().is_err()
        {
            warn!("acceptor thread panicked");
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.shutdown();
        }
        for entry in self.channels.iter() {
            entry.value().close();
        }
        self.channels.clear();
        self.engine.shutdown();
        if let Some(notifier) = &self.notifier {
            notifier.shutdown();
        }
        info!("remoting server shut down");
    }
}

impl Drop for RemotingServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    context: ChannelContext,
    channels: Arc<DashMap<u64, Arc<Channel>>>,
    stopped: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => match Channel::open(stream, context.clone()) {
                Ok(channel) => {
                    info!("accepted connection from {}", channel.remote_addr());
                    channels.retain(|_, channel| channel.is_active());
                    channels.insert(channel.id(), channel);
                }
                Err(e) => warn!("failed to open channel: {e}"),
            },
            Err(e) => warn!("broken connection: {e:?}"),
        }
    }
    debug!("acceptor stopped");
}
