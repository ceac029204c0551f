use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tier::{DEFAULT_TIER_ALIASES, StorageTierAssoc};

/// Default packet queue capacity per stream.
///
/// Once this many packets are buffered ahead of the writer the connection
/// stops reading until one is written.
const DEFAULT_PACKET_QUEUE_CAPACITY: usize = 16;

/// Default upper bound on a single packet payload (8 MiB).
const DEFAULT_MAX_PACKET_BYTES: u64 = 8 * 1024 * 1024;

/// Default number of packet writers that may run at once across connections.
const DEFAULT_WRITER_THREADS: usize = 64;

const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Settings of a data server's write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataServerConfig {
    /// Packets buffered per stream before reads pause.
    pub packet_queue_capacity: usize,
    /// Largest accepted packet payload, in bytes.
    pub max_packet_bytes: u64,
    /// Writer pool size shared by all connections.
    pub writer_threads: usize,
    /// Worker threads of an owned runtime; tokio's default when `None`.
    pub runtime_worker_threads: Option<usize>,
    pub shutdown_timeout_ms: u64,
    /// Tier aliases in ordinal order. Tier 0 receives new temp blocks.
    pub tier_aliases: Vec<String>,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            packet_queue_capacity: DEFAULT_PACKET_QUEUE_CAPACITY,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            writer_threads: DEFAULT_WRITER_THREADS,
            runtime_worker_threads: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            tier_aliases: DEFAULT_TIER_ALIASES.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl DataServerConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "packet_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_packet_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_packet_bytes must be at least 1".to_string(),
            ));
        }
        if self.writer_threads == 0 {
            return Err(ConfigError::Invalid(
                "writer_threads must be at least 1".to_string(),
            ));
        }
        if self.runtime_worker_threads == Some(0) {
            return Err(ConfigError::Invalid(
                "runtime_worker_threads must be at least 1 when set".to_string(),
            ));
        }
        self.tier_assoc()?;
        Ok(())
    }

    pub fn tier_assoc(&self) -> Result<StorageTierAssoc, ConfigError> {
        StorageTierAssoc::new(self.tier_aliases.iter().cloned())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
