//! Client configuration.
//!
//! [`ClientConfig`] can be built in code, overridden field by field through
//! [`ClientBuilder`](crate::ClientBuilder), or loaded from JSON:
//!
//! ```
//! use opup_client::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{ "request_timeout_ms": 500 }"#).unwrap();
//! assert_eq!(config.request_timeout_ms, 500);
//! assert_eq!(config.max_buffer_size, 8192); // unspecified fields keep defaults
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OpupError, Result};
use crate::protocol::{DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_ITERATIONS, MAX_FRAME_SIZE};
use crate::tracker::DEFAULT_REQUEST_TIMEOUT;

/// Default capacity of the client event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Tunables for a [`ProtocolClient`](crate::ProtocolClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Time to wait for a correlated response, in milliseconds.
    pub request_timeout_ms: u64,
    /// Ceiling of the reassembly buffer in bytes.
    pub max_buffer_size: usize,
    /// Scan steps the reassembler performs per received chunk.
    pub max_iterations_per_chunk: usize,
    /// Capacity of the broadcast channel behind [`subscribe`](crate::ProtocolClient::subscribe).
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_iterations_per_chunk: DEFAULT_MAX_ITERATIONS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check that the values can work together.
    ///
    /// The buffer must hold at least one maximum-size frame, otherwise such a
    /// frame would overflow the buffer every time.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(OpupError::Config(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_buffer_size < MAX_FRAME_SIZE {
            return Err(OpupError::Config(format!(
                "max_buffer_size {} is smaller than the largest frame ({} bytes)",
                self.max_buffer_size, MAX_FRAME_SIZE
            )));
        }
        if self.max_iterations_per_chunk == 0 {
            return Err(OpupError::Config(
                "max_iterations_per_chunk must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(OpupError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
