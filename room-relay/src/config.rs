use std::{path::PathBuf, time::Duration};

use anyhow::{Result, ensure};

use crate::wire::WireFormat;

/// Runtime tunables shared by the server and every connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub wire_format: WireFormat,
    /// Largest inbound websocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Capacity of each member's private outbound queue.
    pub send_queue_capacity: usize,
    /// How often the outbound pump pings the peer.
    pub heartbeat_interval: Duration,
    /// A connection that sends nothing (pongs included) for this long is dead.
    pub idle_timeout: Duration,
    /// Deadline applied to every transport write.
    pub write_timeout: Duration,
    /// How long shutdown waits for open connections to wind down.
    pub shutdown_grace: Duration,
    pub static_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Json,
            max_message_size: 512,
            send_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            static_dir: PathBuf::from("static"),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.send_queue_capacity > 0, "send queue capacity must be at least 1");
        ensure!(self.max_message_size > 0, "max message size must be at least 1 byte");
        ensure!(!self.heartbeat_interval.is_zero(), "heartbeat interval must be non-zero");
        ensure!(!self.write_timeout.is_zero(), "write timeout must be non-zero");
        ensure!(
            self.idle_timeout > self.heartbeat_interval,
            "idle timeout ({:?}) must exceed the heartbeat interval ({:?})",
            self.idle_timeout,
            self.heartbeat_interval
        );
        Ok(())
    }
}
