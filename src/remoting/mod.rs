//! Invocation engine.
//!
//! This module turns the wire protocol into request/response calls between peers. It
//! correlates responses with requests, bounds in-flight work, times out requests that never
//! get an answer, dispatches inbound requests to processors and keeps outbound connections
//! alive.
//!
//! # Overview
//!
//! Client and server share one [`RemotingEngine`]. A caller obtains a [`Channel`] (the
//! client through its [`ConnectionManager`], the server from its accepted connections) and
//! invokes on it in one of three modes:
//!
//! - **sync**: block until the response arrives or the timeout elapses;
//! - **async**: return at once and get the outcome through a callback, exactly once;
//! - **one-way**: fire and forget, complete once the frame is written.
//!
//! Every in-flight sync or async request sits in the [`ResponseTable`] until exactly one of
//! response, send failure, timeout or shutdown claims it by removing it.
//!
//! # Key Components
//!
//! - [`RemotingClient`] / [`RemotingServer`]: the two facades.
//! - [`RemotingEngine`]: invocation, response matching, timeouts, shutdown.
//! - [`ResponseFuture`] / [`ResponseTable`]: in-flight requests keyed by opaque.
//! - [`Semaphore`]: admission control for async and one-way calls.
//! - [`RequestDispatcher`]: code → processor routing on per-processor pools.
//! - [`Channel`]: a framed TCP connection with its reader and writer threads.
//! - [`ConnectionManager`]: one channel per address, with single-flight reconnect.
//! - [`TimeoutSweeper`] / [`EventNotifier`]: background sweeping and lifecycle events.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): the command model and frame format used here.
mod channel;
mod client;
mod connection;
mod dispatcher;
mod engine;
mod event;
mod hook;
mod response_future;
mod semaphore;
mod server;
mod sweeper;
mod table;
mod thread;

pub use channel::{Channel, ChannelContext, InboundHandler, WriteListener};
pub use client::RemotingClient;
pub use connection::{ChannelWrapper, ConnectionManager, ConnectionState, Connector, TcpConnector};
pub use dispatcher::{ProcessorPair, ProcessorTable, RequestDispatcher, RequestProcessor};
pub use engine::RemotingEngine;
pub use event::{ChannelEvent, ChannelEventListener, ChannelEventType, EventNotifier};
pub use hook::{RpcHook, RpcHooks};
pub use response_future::{InvokeCallback, ResponseFuture};
pub use semaphore::{Permit, Semaphore};
pub use server::RemotingServer;
pub use sweeper::TimeoutSweeper;
pub use table::ResponseTable;
pub use thread::ThreadPool;
