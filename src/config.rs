//! Runtime configuration.
//!
//! Every knob has a default; [`RemotingConfig::from_env`] overrides them from `REMOTING_*`
//! environment variables. Values that fail to parse are logged and ignored.
use std::{env, str::FromStr, time::Duration};

use log::warn;

use crate::protocol::SerializeType;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;
pub const DEFAULT_PERMITS_ASYNC: usize = 65535;
pub const DEFAULT_PERMITS_ONEWAY: usize = 65535;
pub const DEFAULT_POOL_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct RemotingConfig {
    /// Largest accepted frame, length prefix excluded.
    pub max_frame_length: usize,
    /// Concurrent in-flight asynchronous requests.
    pub permits_async: usize,
    /// Concurrent in-flight one-way requests.
    pub permits_oneway: usize,
    /// How long an async or one-way call waits for an admission permit.
    pub admission_timeout: Duration,
    pub connect_timeout: Duration,
    /// Read inactivity after which a channel is reported idle and closed.
    /// `Duration::ZERO` disables idle detection.
    pub channel_idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub callback_threads: usize,
    pub worker_threads: usize,
    /// Jobs a callback or processor pool queues before rejecting more.
    pub pool_queue_capacity: usize,
    /// Frames a channel queues for its writer before sends fail.
    pub write_queue_capacity: usize,
    pub event_queue_capacity: usize,
    /// Header format used for outbound requests.
    pub serialize_type: SerializeType,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            permits_async: DEFAULT_PERMITS_ASYNC,
            permits_oneway: DEFAULT_PERMITS_ONEWAY,
            admission_timeout: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(3000),
            channel_idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_millis(1000),
            callback_threads: 4,
            worker_threads: 8,
            pool_queue_capacity: DEFAULT_POOL_QUEUE_CAPACITY,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            event_queue_capacity: 10_000,
            serialize_type: SerializeType::Json,
        }
    }
}

impl RemotingConfig {
    /// Defaults overridden by any `REMOTING_*` variable present in the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_with(&lookup, "REMOTING_MAX_FRAME_LENGTH", &mut config.max_frame_length);
        override_with(&lookup, "REMOTING_PERMITS_ASYNC", &mut config.permits_async);
        override_with(&lookup, "REMOTING_PERMITS_ONEWAY", &mut config.permits_oneway);
        override_with(&lookup, "REMOTING_CALLBACK_THREADS", &mut config.callback_threads);
        override_with(&lookup, "REMOTING_WORKER_THREADS", &mut config.worker_threads);
        override_with(
            &lookup,
            "REMOTING_POOL_QUEUE_CAPACITY",
            &mut config.pool_queue_capacity,
        );
        override_with(
            &lookup,
            "REMOTING_WRITE_QUEUE_CAPACITY",
            &mut config.write_queue_capacity,
        );
        override_with(
            &lookup,
            "REMOTING_EVENT_QUEUE_CAPACITY",
            &mut config.event_queue_capacity,
        );
        override_with(&lookup, "REMOTING_SERIALIZE_TYPE", &mut config.serialize_type);

        override_millis(
            &lookup,
            "REMOTING_ADMISSION_TIMEOUT_MILLIS",
            &mut config.admission_timeout,
        );
        override_millis(
            &lookup,
            "REMOTING_CONNECT_TIMEOUT_MILLIS",
            &mut config.connect_timeout,
        );
        override_millis(
            &lookup,
            "REMOTING_CHANNEL_IDLE_TIMEOUT_MILLIS",
            &mut config.channel_idle_timeout,
        );
        override_millis(
            &lookup,
            "REMOTING_SWEEP_INTERVAL_MILLIS",
            &mut config.sweep_interval,
        );

        config
    }
}

fn override_with<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };

    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!("ignoring unparsable {key}='{raw}', keeping default"),
    }
}

fn override_millis<F>(lookup: &F, key: &str, slot: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = slot.as_millis() as u64;
    override_with(lookup, key, &mut millis);
    *slot = Duration::from_millis(millis);
}
