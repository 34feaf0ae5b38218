use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{config::RelayConfig, wire::WireFormat};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting websocket connections on /ws.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory served for every path that is not an API route.
    #[arg(long, default_value = "static")]
    pub static_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = WireFormat::Json)]
    pub wire_format: WireFormat,

    /// Largest inbound message accepted, in bytes.
    #[arg(long, default_value_t = 512)]
    pub max_message_size: usize,

    /// Messages buffered per member before it is treated as dead.
    #[arg(long, default_value_t = 256)]
    pub send_queue: usize,

    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub idle_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// How long shutdown waits for open connections.
    #[arg(long, default_value_t = 5)]
    pub grace_secs: u64,
}

impl ServeArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            wire_format: self.wire_format,
            max_message_size: self.max_message_size,
            send_queue_capacity: self.send_queue,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            shutdown_grace: Duration::from_secs(self.grace_secs),
            static_dir: self.static_dir.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username shown to the other members of the room.
    #[arg(long, default_value = "anonymous")]
    pub username: String,

    #[arg(long, default_value = "general")]
    pub room: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: SocketAddr,

    /// Must match the wire format the server runs with.
    #[arg(long, value_enum, default_value_t = WireFormat::Json)]
    pub wire_format: WireFormat,
}
