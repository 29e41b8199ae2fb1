use std::{
    error::Error,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use crossbeam::channel;
use remoting::{RemotingClient, RemotingCommand, RemotingConfig, SerializeType};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Sync,
    Async,
    Oneway,
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:10911")]
    address: String,
    /// Request code
    #[arg(short, long, default_value_t = 310)]
    code: i32,
    /// Invocation mode
    #[arg(short, long, value_enum, default_value_t = Mode::Sync)]
    mode: Mode,
    /// Timeout in milliseconds
    #[arg(short, long, default_value_t = 3000)]
    timeout: u64,
    /// Header format: JSON or BINARY
    #[arg(short, long)]
    serialize: Option<SerializeType>,
    /// Request body
    #[arg(default_value = "")]
    body: String,
}

fn print_response(response: &RemotingCommand) {
    println!("code: {}", response.code());
    if let Some(remark) = response.remark() {
        println!("remark: {remark}");
    }
    println!("body: {}", String::from_utf8_lossy(response.body()));
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = RemotingConfig::from_env();
    if let Some(serialize_type) = cli.serialize {
        config.serialize_type = serialize_type;
    }

    let client = RemotingClient::new(config)?;
    let timeout = Duration::from_millis(cli.timeout);
    let request = RemotingCommand::create_request(cli.code).with_body(cli.body.into_bytes());

    match cli.mode {
        Mode::Sync => {
            let response = client.invoke_sync(&cli.address, request, timeout)?;
            print_response(&response);
        }
        Mode::Async => {
            let (tx, rx) = channel::bounded(1);
            client.invoke_async(&cli.address, request, timeout, move |outcome| {
                let _ = tx.send(outcome);
            })?;
            let response = rx.recv()??;
            print_response(&response);
        }
        Mode::Oneway => {
            client.invoke_oneway(&cli.address, request)?;
            // The permit comes back once the frame is written.
            let semaphore = client.engine().semaphore_oneway();
            let deadline = Instant::now() + timeout;
            while semaphore.in_use() > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            println!("sent");
        }
    }

    client.shutdown();
    Ok(())
}
