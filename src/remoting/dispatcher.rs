//! Inbound request dispatch.
//!
//! Requests are routed by `code` to a registered [`RequestProcessor`] and run on that
//! processor's pool, never on the channel's reader thread. Routing failures do not raise
//! errors to anybody: they become response commands sent back to the caller, unless the
//! request was one-way.
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use dashmap::DashMap;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    RemotingCommand,
    error::Result,
    protocol::{SerializeType, response_code},
    remoting::{Channel, RpcHooks, ThreadPool},
};

/// Handles one request code.
pub trait RequestProcessor: Send + Sync + 'static {
    /// Produce the response, or `None` when there is nothing to send back.
    fn process_request(
        &self,
        channel: &Arc<Channel>,
        request: &RemotingCommand,
    ) -> Result<Option<RemotingCommand>>;

    /// Shed load: when `true` the request is answered with `SYSTEM_BUSY` unprocessed.
    fn reject_request(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct ProcessorPair {
    pub processor: Arc<dyn RequestProcessor>,
    pub pool: Arc<ThreadPool>,
}

/// `code → (processor, pool)` plus an optional fallback for unregistered codes.
#[derive(Default)]
pub struct ProcessorTable {
    table: DashMap<i32, ProcessorPair>,
    default: RwLock<Option<ProcessorPair>>,
}

impl ProcessorTable {
    pub fn register(&self, code: i32, pair: ProcessorPair) {
        if self.table.insert(code, pair).is_some() {
            warn!("request code {code} re-registered, previous processor replaced");
        }
    }

    pub fn register_default(&self, pair: ProcessorPair) {
        *self.default.write() = Some(pair);
    }

    pub fn lookup(&self, code: i32) -> Option<ProcessorPair> {
        self.table
            .get(&code)
            .map(|pair| pair.value().clone())
            .or_else(|| self.default.read().clone())
    }

    /// Registered codes and the pool name serving each.
    pub fn snapshot(&self) -> HashMap<i32, String> {
        self.table
            .iter()
            .map(|entry| (*entry.key(), entry.value().pool.name().to_string()))
            .collect()
    }
}

pub struct RequestDispatcher {
    processors: ProcessorTable,
    hooks: Arc<RpcHooks>,
}

impl RequestDispatcher {
    pub fn new(hooks: Arc<RpcHooks>) -> Self {
        Self {
            processors: ProcessorTable::default(),
            hooks,
        }
    }

    pub fn processors(&self) -> &ProcessorTable {
        &self.processors
    }

    /// Dispatch and write any reply back on the same channel.
    pub fn dispatch(&self, channel: &Arc<Channel>, request: RemotingCommand) {
        let replying = Arc::clone(channel);
        self.dispatch_with(channel, request, move |response| {
            if let Err(e) = replying.write_command(&response, None) {
                warn!(
                    "failed to send response to {}, opaque {}: {e}",
                    replying.remote_addr(),
                    response.opaque()
                );
            }
        });
    }

    /// Dispatch, handing any reply to `reply` instead of a channel.
    pub fn dispatch_with<F>(&self, channel: &Arc<Channel>, request: RemotingCommand, reply: F)
    where
        F: FnOnce(RemotingCommand) + Send + 'static,
    {
        let reply = Arc::new(Reply::new(&request, reply));

        let Some(pair) = self.processors.lookup(request.code()) else {
            let remark = format!("request type {} not supported", request.code());
            error!("{} {remark}", channel.remote_addr());
            reply.send(RemotingCommand::create_response(
                response_code::REQUEST_CODE_NOT_SUPPORTED,
                Some(remark),
            ));
            return;
        };

        if pair.processor.reject_request() {
            reply.send(RemotingCommand::create_response(
                response_code::SYSTEM_BUSY,
                Some("[REJECTREQUEST]system busy, start flow control for a while".into()),
            ));
            return;
        }

        let hooks = Arc::clone(&self.hooks);
        let replying = Arc::clone(&reply);
        let processor = Arc::clone(&pair.processor);
        let job = {
            let channel = Arc::clone(channel);
            move || {
                let mut request = request;
                let response = run_processor(processor.as_ref(), &hooks, &channel, &mut request);
                if let Some(response) = response {
                    replying.send(response);
                }
            }
        };

        if let Err(e) = pair.pool.execute(job) {
            warn!("{} rejected request from {}: {e}", pair.pool.name(), channel.remote_addr());
            reply.send(RemotingCommand::create_response(
                response_code::SYSTEM_BUSY,
                Some(format!("[OVERLOAD]system busy, start flow control for a while: {e}")),
            ));
        }
    }
}

/// Sends at most one reply to a request, and none to a one-way request.
///
/// Shared between the dispatching thread and the queued job: if the pool rejects the job,
/// the dispatcher still owns a way to answer.
struct Reply<F> {
    oneway: bool,
    opaque: i32,
    serialize_type: SerializeType,
    reply: Mutex<Option<F>>,
}

impl<F: FnOnce(RemotingCommand)> Reply<F> {
    fn new(request: &RemotingCommand, reply: F) -> Self {
        Self {
            oneway: request.is_oneway_rpc(),
            opaque: request.opaque(),
            serialize_type: request.serialize_type(),
            reply: Mutex::new(Some(reply)),
        }
    }

    fn send(&self, mut response: RemotingCommand) {
        if self.oneway {
            return;
        }
        let Some(reply) = self.reply.lock().take() else {
            return;
        };
        response.set_opaque(self.opaque);
        response.mark_response_type();
        response.set_serialize_type(self.serialize_type);
        reply(response);
    }
}

fn run_processor(
    processor: &dyn RequestProcessor,
    hooks: &RpcHooks,
    channel: &Arc<Channel>,
    request: &mut RemotingCommand,
) -> Option<RemotingCommand> {
    let addr = channel.remote_addr();
    hooks.before_request(addr, request);

    let request: &RemotingCommand = request;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        processor.process_request(channel, request)
    }));

    let mut response = match outcome {
        Ok(Ok(response)) => response?,
        Ok(Err(e)) => {
            error!("process request {} from {addr} failed: {e}", request.code());
            RemotingCommand::create_response(response_code::SYSTEM_ERROR, Some(e.to_string()))
        }
        Err(_) => {
            error!("processor for request {} from {addr} panicked", request.code());
            RemotingCommand::create_response(
                response_code::SYSTEM_ERROR,
                Some(format!("processor for request {} panicked", request.code())),
            )
        }
    };

    hooks.after_response(addr, request, &mut response);
    Some(response)
}
