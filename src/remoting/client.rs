use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::info;

use crate::{
    RemotingCommand, RemotingError,
    config::RemotingConfig,
    error::Result,
    protocol::FrameCodec,
    remoting::{
        ChannelContext, ChannelEventListener, ConnectionManager, Connector, EventNotifier,
        InboundHandler, RemotingEngine, RequestProcessor, RpcHook, TcpConnector, ThreadPool,
        TimeoutSweeper,
    },
};

/// Calls remote servers by address, connecting lazily and reconnecting when a connection
/// breaks.
///
/// The sweeper (and the event notifier, when a listener is given) start with the client
/// and stop on [`RemotingClient::shutdown`] or drop.
pub struct RemotingClient {
    engine: Arc<RemotingEngine>,
    connections: Arc<ConnectionManager>,
    sweeper: TimeoutSweeper,
    notifier: Option<Arc<EventNotifier>>,
}

impl RemotingClient {
    pub fn new(config: RemotingConfig) -> Result<Self> {
        Self::with_options(config, Arc::new(TcpConnector), None)
    }

    pub fn with_options(
        config: RemotingConfig,
        connector: Arc<dyn Connector>,
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
        let connections = Arc::new(ConnectionManager::new(
            connector,
            context,
            config.connect_timeout,
        ));
        let sweeper = TimeoutSweeper::start(Arc::clone(&engine), config.sweep_interval)?;

        info!("remoting client started");
        Ok(Self {
            engine,
            connections,
            sweeper,
            notifier,
        })
    }

    pub fn engine(&self) -> &Arc<RemotingEngine> {
        &self.engine
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Serve requests the remote side pushes over our connections.
    pub fn register_processor(
        &self,
        code: i32,
        processor: Arc<dyn RequestProcessor>,
        pool: Option<Arc<ThreadPool>>,
    ) {
        self.engine.register_processor(code, processor, pool);
    }

    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.engine.register_rpc_hook(hook);
    }

    /// Connect time counts against `timeout`.
    pub fn invoke_sync(
        &self,
        addr: &str,
        mut request: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand> {
        let begin = Instant::now();
        let channel = self.connections.get_or_connect(addr)?;
        let remaining = remaining(addr, timeout, begin)?;

        request.set_serialize_type(self.engine.config().serialize_type);
        let response = self.engine.invoke_sync(&channel, request, remaining)?;
        if let Some(wrapper) = self.connections.wrapper(addr) {
            wrapper.touch();
        }
        Ok(response)
    }

    pub fn invoke_async<F>(
        &self,
        addr: &str,
        mut request: RemotingCommand,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<RemotingCommand>) + Send + 'static,
    {
        let begin = Instant::now();
        let channel = self.connections.get_or_connect(addr)?;
        let remaining = remaining(addr, timeout, begin)?;

        request.set_serialize_type(self.engine.config().serialize_type);
        let wrapper = self.connections.wrapper(addr);
        self.engine.invoke_async(
            &channel,
            request,
            remaining,
            Box::new(move |outcome: Result<RemotingCommand>| {
                if outcome.is_ok()
                    && let Some(wrapper) = &wrapper
                {
                    wrapper.touch();
                }
                callback(outcome);
            }),
        )
    }

    pub fn invoke_oneway(&self, addr: &str, mut request: RemotingCommand) -> Result<()> {
        let channel = self.connections.get_or_connect(addr)?;
        request.set_serialize_type(self.engine.config().serialize_type);
        self.engine.invoke_oneway(&channel, request)
    }

    pub fn close_channel(&self, addr: &str) {
        self.connections.close_channel(addr);
    }

    /// Refuse new calls, fail the ones in flight and close every connection. Idempotent.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.sweeper.shutdown();
        self.connections.close_all();
        if let Some(notifier) = &self.notifier {
            notifier.shutdown();
        }
        info!("remoting client shut down");
    }
}

impl Drop for RemotingClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn remaining(addr: &str, timeout: Duration, begin: Instant) -> Result<Duration> {
    let remaining = timeout.saturating_sub(begin.elapsed());
    if remaining.is_zero() {
        return Err(RemotingError::Timeout {
            addr: addr.to_string(),
            timeout_millis: timeout.as_millis() as u64,
        });
    }
    Ok(remaining)
}
