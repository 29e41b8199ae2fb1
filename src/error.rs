//! Error taxonomy for the remoting engine.
//!
//! Errors fall in two groups. Structural decode failures ([`RemotingError::MalformedFrame`],
//! [`RemotingError::FrameTooLarge`], [`RemotingError::UnsupportedSerializeTag`]) are fatal
//! for the connection they were read from. Everything else fails a single request and leaves
//! the connection open.
//!
//! Dispatcher-side outcomes (unsupported code, busy server, handler failure) are not errors
//! here: they travel back to the caller as response commands, see
//! [`response_code`](crate::protocol::response_code).
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemotingError>;

#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unsupported serialize type tag {0:#04x}")]
    UnsupportedSerializeTag(u8),

    #[error("missing required header field '{0}'")]
    MissingRequiredField(&'static str),

    #[error("unsupported type for header field '{field}'")]
    UnsupportedFieldType { field: &'static str },

    #[error("invalid value '{value}' for header field '{field}'")]
    InvalidFieldValue { field: &'static str, value: String },

    #[error("send request to <{addr}> failed: {reason}")]
    SendFailed { addr: String, reason: String },

    #[error("wait response on <{addr}> timeout, {timeout_millis}ms")]
    Timeout { addr: String, timeout_millis: u64 },

    #[error("too many requests: {kind} admission exhausted ({in_flight} in flight)")]
    TooManyRequests { kind: &'static str, in_flight: usize },

    #[error("thread pool '{pool}' is overloaded, {capacity} jobs already queued")]
    Overloaded { pool: String, capacity: usize },

    #[error("connect to <{addr}> failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("remoting error: {0}")]
    Remoting(String),

    #[error("remoting service has been shut down")]
    Shutdown,

    #[error("failed to encode header: {0}")]
    Serialize(#[from] bincode::error::EncodeError),

    #[error("failed to decode header: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),

    #[error("json header error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

impl RemotingError {
    /// Structural decode errors. The connection the frame came from must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RemotingError::MalformedFrame(_)
                | RemotingError::FrameTooLarge { .. }
                | RemotingError::UnsupportedSerializeTag(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RemotingError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_are_connection_fatal() {
        assert!(RemotingError::MalformedFrame("short".into()).is_connection_fatal());
        assert!(RemotingError::UnsupportedSerializeTag(9).is_connection_fatal());
        assert!(RemotingError::FrameTooLarge { size: 2, max: 1 }.is_connection_fatal());
    }

    #[test]
    fn request_errors_keep_connection() {
        assert!(!RemotingError::MissingRequiredField("topic").is_connection_fatal());
        assert!(
            !RemotingError::Timeout {
                addr: "127.0.0.1:9876".into(),
                timeout_millis: 100
            }
            .is_connection_fatal()
        );
        assert!(
            !RemotingError::TooManyRequests {
                kind: "oneway",
                in_flight: 1
            }
            .is_connection_fatal()
        );
    }

    #[test]
    fn timeout_message_names_address() {
        let err = RemotingError::Timeout {
            addr: "10.0.0.1:10911".into(),
            timeout_millis: 3000,
        };
        assert_eq!(err.to_string(), "wait response on <10.0.0.1:10911> timeout, 3000ms");
        assert!(err.is_timeout());
    }
}
