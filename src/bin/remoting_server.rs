use std::{error::Error, net::SocketAddr, sync::Arc};

use clap::Parser;
use crossbeam::channel;
use log::info;
use remoting::{
    RemotingCommand, RemotingConfig, RemotingServer, RequestProcessor, Result,
    protocol::response_code,
    remoting::{Channel, ChannelEventListener},
};

const ECHO: i32 = 310;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connection at address
    #[arg(default_value = "127.0.0.1:10911")]
    address: SocketAddr,
}

/// Answers with the request body.
struct Echo;

impl RequestProcessor for Echo {
    fn process_request(
        &self,
        _channel: &Arc<Channel>,
        request: &RemotingCommand,
    ) -> Result<Option<RemotingCommand>> {
        Ok(Some(
            RemotingCommand::create_response(response_code::SUCCESS, None)
                .with_body(request.body().to_vec()),
        ))
    }
}

/// Catches every code without a processor of its own.
struct Fallback;

impl RequestProcessor for Fallback {
    fn process_request(
        &self,
        channel: &Arc<Channel>,
        request: &RemotingCommand,
    ) -> Result<Option<RemotingCommand>> {
        info!("unhandled request {} from {}", request.code(), channel.remote_addr());
        Ok(Some(RemotingCommand::create_response(
            response_code::REQUEST_CODE_NOT_SUPPORTED,
            Some(format!("no handler for request code {}", request.code())),
        )))
    }
}

struct LogEvents;

impl ChannelEventListener for LogEvents {
    fn on_channel_connect(&self, remote_addr: &str, _channel: &Arc<Channel>) {
        info!("channel connected: {remote_addr}");
    }

    fn on_channel_close(&self, remote_addr: &str, _channel: &Arc<Channel>) {
        info!("channel closed: {remote_addr}");
    }

    fn on_channel_idle(&self, remote_addr: &str, _channel: &Arc<Channel>) {
        info!("channel idle: {remote_addr}");
    }

    fn on_channel_exception(&self, remote_addr: &str, _channel: &Arc<Channel>) {
        info!("channel exception: {remote_addr}");
    }
}

fn main() -> std::result::Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = RemotingServer::new(
        cli.address,
        RemotingConfig::from_env(),
        Some(Arc::new(LogEvents)),
    )?;
    server.register_processor(ECHO, Arc::new(Echo), None);
    server.register_default_processor(Arc::new(Fallback), None);
    server.start()?;

    let (stop, stopped) = channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop.try_send(());
    })?;
    let _ = stopped.recv();

    info!("shutting down");
    server.shutdown();
    Ok(())
}
