//! Shared invocation core of the client and the server.
//!
//! The engine owns the correlation table, the two admission semaphores, the processor
//! table and the callback pool. It knows nothing about how channels are obtained: callers
//! hand it a [`Channel`] and it takes care of registering, writing, waiting and completing.
//!
//! Once [`RemotingEngine::shutdown`] has run, every invocation fails with
//! [`RemotingError::Shutdown`]: nothing would ever sweep a request registered after it.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    RemotingCommand, RemotingError,
    config::RemotingConfig,
    error::Result,
    remoting::{
        Channel, InboundHandler, InvokeCallback, ProcessorPair, RequestDispatcher,
        RequestProcessor, ResponseFuture, ResponseTable, RpcHook, RpcHooks, Semaphore,
        ThreadPool, WriteListener,
    },
};

pub struct RemotingEngine {
    config: RemotingConfig,
    response_table: ResponseTable,
    semaphore_async: Arc<Semaphore>,
    semaphore_oneway: Arc<Semaphore>,
    hooks: Arc<RpcHooks>,
    dispatcher: RequestDispatcher,
    callback_pool: ThreadPool,
    public_pool: Arc<ThreadPool>,
    stopped: AtomicBool,
}

impl RemotingEngine {
    pub fn new(config: RemotingConfig) -> Result<Self> {
        let hooks = Arc::new(RpcHooks::default());
        let queue_capacity = config.pool_queue_capacity.max(1);
        let callback_pool = ThreadPool::new(
            "remoting-callback",
            config.callback_threads.max(1),
            queue_capacity,
        )?;
        let public_pool = ThreadPool::new(
            "remoting-worker",
            config.worker_threads.max(1),
            queue_capacity,
        )?;

        Ok(Self {
            response_table: ResponseTable::new(),
            semaphore_async: Semaphore::new(config.permits_async),
            semaphore_oneway: Semaphore::new(config.permits_oneway),
            dispatcher: RequestDispatcher::new(Arc::clone(&hooks)),
            hooks,
            callback_pool,
            public_pool: Arc::new(public_pool),
            stopped: AtomicBool::new(false),
            config,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    pub fn response_table(&self) -> &ResponseTable {
        &self.response_table
    }

    pub fn semaphore_async(&self) -> &Arc<Semaphore> {
        &self.semaphore_async
    }

    pub fn semaphore_oneway(&self) -> &Arc<Semaphore> {
        &self.semaphore_oneway
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Route `code` to `processor`. Without a pool the shared worker pool runs it.
    pub fn register_processor(
        &self,
        code: i32,
        processor: Arc<dyn RequestProcessor>,
        pool: Option<Arc<ThreadPool>>,
    ) {
        let pool = pool.unwrap_or_else(|| Arc::clone(&self.public_pool));
        self.dispatcher
            .processors()
            .register(code, ProcessorPair { processor, pool });
    }

    pub fn register_default_processor(
        &self,
        processor: Arc<dyn RequestProcessor>,
        pool: Option<Arc<ThreadPool>>,
    ) {
        let pool = pool.unwrap_or_else(|| Arc::clone(&self.public_pool));
        self.dispatcher
            .processors()
            .register_default(ProcessorPair { processor, pool });
    }

    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.hooks.register(hook);
    }

    /// Write `request` and block for its response.
    ///
    /// Sync calls take no admission permit: the blocked caller is its own back-pressure.
    pub fn invoke_sync(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        mut request: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand> {
        self.ensure_running()?;
        let addr = channel.remote_addr().to_string();
        self.hooks.before_request(&addr, &mut request);

        let opaque = request.opaque();
        let future = Arc::new(ResponseFuture::new(
            opaque,
            addr.clone(),
            channel.id(),
            request.code(),
            timeout,
            None,
            None,
        ));
        self.response_table.insert(Arc::clone(&future));
        if self.is_shutdown() {
            self.response_table.remove(opaque);
            return Err(RemotingError::Shutdown);
        }

        let listener = self.send_failure_listener(opaque, addr.clone());
        if let Err(e) = channel.write_command(&request, Some(listener)) {
            self.response_table.remove(opaque);
            return Err(send_failed(&addr, e));
        }

        let outcome = match future.wait_response(timeout) {
            Some(outcome) => outcome,
            None => {
                self.response_table.remove(opaque);
                future.complete(Err(timeout_error(&addr, timeout)));
                // Either our timeout or a response that won the race.
                future
                    .wait_response(Duration::ZERO)
                    .unwrap_or_else(|| Err(timeout_error(&addr, timeout)))
            }
        };

        let mut response = outcome?;
        self.hooks.after_response(&addr, &request, &mut response);
        Ok(response)
    }

    /// Write `request` and return at once. `callback` runs exactly once on the callback
    /// pool, with the response or the failure that ended the call.
    ///
    /// Shutdown and admission failure are the only errors returned directly; the callback is
    /// then never run.
    pub fn invoke_async(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        mut request: RemotingCommand,
        timeout: Duration,
        callback: InvokeCallback,
    ) -> Result<()> {
        self.ensure_running()?;
        let permit = self
            .semaphore_async
            .try_acquire_for(self.config.admission_timeout)
            .ok_or_else(|| {
                let in_flight = self.semaphore_async.in_use();
                warn!(
                    "invokeAsync: too many requests, {in_flight} in flight, permits {}",
                    self.semaphore_async.total_permits()
                );
                RemotingError::TooManyRequests {
                    kind: "async",
                    in_flight,
                }
            })?;

        let addr = channel.remote_addr().to_string();
        self.hooks.before_request(&addr, &mut request);

        let callback = self.wrap_callback(&addr, &request, callback);
        let opaque = request.opaque();
        let future = Arc::new(ResponseFuture::new(
            opaque,
            addr.clone(),
            channel.id(),
            request.code(),
            timeout,
            Some(callback),
            Some(permit),
        ));
        self.response_table.insert(Arc::clone(&future));
        // Lost a race with shutdown, which may already have drained the table.
        if self.is_shutdown() {
            self.fail_entry(opaque, RemotingError::Shutdown);
            return Ok(());
        }

        let listener = self.send_failure_listener(opaque, addr.clone());
        if let Err(e) = channel.write_command(&request, Some(listener)) {
            self.fail_entry(opaque, send_failed(&addr, e));
        }
        Ok(())
    }

    /// Write `request` without expecting a reply. Completes once the frame is on the wire.
    pub fn invoke_oneway(&self, channel: &Arc<Channel>, mut request: RemotingCommand) -> Result<()> {
        self.ensure_running()?;
        request.mark_oneway_rpc();
        let permit = self
            .semaphore_oneway
            .try_acquire_for(self.config.admission_timeout)
            .ok_or_else(|| {
                let in_flight = self.semaphore_oneway.in_use();
                warn!(
                    "invokeOneway: too many requests, {in_flight} in flight, permits {}",
                    self.semaphore_oneway.total_permits()
                );
                RemotingError::TooManyRequests {
                    kind: "oneway",
                    in_flight,
                }
            })?;

        let addr = channel.remote_addr().to_string();
        self.hooks.before_request(&addr, &mut request);

        let opaque = request.opaque();
        channel.write_command(
            &request,
            Some(Box::new(move |outcome: Result<()>| {
                drop(permit);
                if let Err(e) = outcome {
                    warn!("send a request command to channel <{addr}> failed, opaque {opaque}: {e}");
                }
            })),
        )
    }

    /// Match an inbound response with its in-flight request.
    pub fn process_response(&self, channel: &Channel, response: RemotingCommand) {
        let opaque = response.opaque();
        match self.response_table.remove(opaque) {
            Some(future) => {
                if future.complete(Ok(response)) {
                    self.execute_invoke_callback(future);
                }
            }
            None => warn!(
                "receive response, but not matched any request, {} opaque {opaque}",
                channel.remote_addr()
            ),
        }
    }

    /// Time out every expired entry. Called by the sweeper.
    pub fn scan_response_table(&self) {
        let now = Instant::now();
        for opaque in self.response_table.expired(now) {
            let Some(future) = self.response_table.remove(opaque) else {
                continue;
            };
            warn!("remove timeout request, {future:?}");
            let timeout = timeout_error(future.remote_addr(), future.timeout());
            if future.complete(Err(timeout)) {
                self.execute_invoke_callback(future);
            }
        }
    }

    /// Fail every in-flight request with [`RemotingError::Shutdown`].
    pub fn fail_all(&self) {
        let pending = self.response_table.drain();
        if !pending.is_empty() {
            info!("failing {} in-flight requests on shutdown", pending.len());
        }
        for future in pending {
            if future.complete(Err(RemotingError::Shutdown)) {
                self.execute_invoke_callback(future);
            }
        }
    }

    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fail_all();
        self.public_pool.shutdown();
        self.callback_pool.shutdown();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(RemotingError::Shutdown);
        }
        Ok(())
    }

    fn fail_entry(&self, opaque: i32, error: RemotingError) {
        if let Some(future) = self.response_table.remove(opaque)
            && future.complete(Err(error))
        {
            self.execute_invoke_callback(future);
        }
    }

    /// Listener failing the entry as soon as the write is known to have failed.
    fn send_failure_listener(self: &Arc<Self>, opaque: i32, addr: String) -> WriteListener {
        let engine = Arc::downgrade(self);
        Box::new(move |outcome: Result<()>| {
            let Err(e) = outcome else {
                return;
            };
            warn!("send a request command to channel <{addr}> failed, opaque {opaque}");
            if let Some(engine) = engine.upgrade() {
                engine.fail_entry(
                    opaque,
                    RemotingError::SendFailed {
                        addr,
                        reason: e.to_string(),
                    },
                );
            }
        })
    }

    fn wrap_callback(
        &self,
        addr: &str,
        request: &RemotingCommand,
        callback: InvokeCallback,
    ) -> InvokeCallback {
        if self.hooks.is_empty() {
            return callback;
        }
        let hooks = Arc::clone(&self.hooks);
        let addr = addr.to_string();
        let request = request.clone();
        Box::new(move |outcome: Result<RemotingCommand>| {
            let outcome = outcome.map(|mut response| {
                hooks.after_response(&addr, &request, &mut response);
                response
            });
            callback(outcome);
        })
    }

    fn execute_invoke_callback(&self, future: Arc<ResponseFuture>) {
        if !future.has_callback() {
            return;
        }
        let job = Arc::clone(&future);
        if let Err(e) = self.callback_pool.execute(move || job.execute_callback()) {
            debug!("callback pool unavailable ({e}), running callback inline");
            future.execute_callback();
        }
    }
}

/// A request that never made it onto the wire, whatever stopped it.
fn send_failed(addr: &str, error: RemotingError) -> RemotingError {
    match error {
        RemotingError::SendFailed { .. } => error,
        other => RemotingError::SendFailed {
            addr: addr.to_string(),
            reason: other.to_string(),
        },
    }
}

fn timeout_error(addr: &str, timeout: Duration) -> RemotingError {
    RemotingError::Timeout {
        addr: addr.to_string(),
        timeout_millis: timeout.as_millis() as u64,
    }
}

impl InboundHandler for RemotingEngine {
    fn on_command(&self, channel: &Arc<Channel>, command: RemotingCommand) {
        if command.is_response_type() {
            self.process_response(channel, command);
        } else {
            self.dispatcher.dispatch(channel, command);
        }
    }
}
