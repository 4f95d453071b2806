//! Static configuration for relay address, chunking and timeouts

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default signaling relay
pub const DEFAULT_RELAY_ADDRESS: &str = "ws://127.0.0.1:8081";

/// Default fragment size for file data messages
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

/// Google STUN server for NAT traversal
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// High water mark for the data channel send buffer.
/// The sender waits while `buffered_amount + next_fragment` would exceed it.
pub const DEFAULT_BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

const DEFAULT_ICE_GATHER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Recognized keys are camelCase (`relayAddress`, `chunkSize`, ...)
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Where the signaling relay is reached (ws:// or wss:// URL)
    pub relay_address: String,
    /// Fragment size in bytes
    pub chunk_size: usize,
    /// STUN/TURN URLs handed to the peer connection
    pub ice_servers: Vec<String>,
    /// Upper bound on waiting for candidate gathering before publishing a
    /// bundled description (manual signaling)
    #[serde(with = "secs")]
    pub ice_gather_timeout: Duration,
    /// A session that has not opened its channel within this bound is torn down
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    pub buffered_amount_high: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_address: DEFAULT_RELAY_ADDRESS.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            ice_gather_timeout: Duration::from_secs(DEFAULT_ICE_GATHER_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            buffered_amount_high: DEFAULT_BUFFERED_AMOUNT_HIGH,
        }
    }
}

impl Config {
    /// Read a JSON config file; absent keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Set the fragment size, raising the send-buffer high water mark if the
    /// new fragment would not fit under it.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
        self.buffered_amount_high = self.buffered_amount_high.max(chunk_size);
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.buffered_amount_high < self.chunk_size {
            anyhow::bail!(
                "buffered_amount_high ({}) must be at least chunk_size ({})",
                self.buffered_amount_high,
                self.chunk_size
            );
        }
        if !self.relay_address.starts_with("ws://") && !self.relay_address.starts_with("wss://") {
            anyhow::bail!(
                "relay_address must be a ws:// or wss:// URL, got '{}'",
                self.relay_address
            );
        }
        Ok(())
    }
}

/// Durations are written as whole seconds in config sources
mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
