pub mod config;
pub mod error;
pub mod protocol;
pub mod remoting;

pub use config::RemotingConfig;
pub use error::{RemotingError, Result};
pub use protocol::{RemotingCommand, SerializeType};
pub use remoting::{RemotingClient, RemotingServer, RequestProcessor};
