//! Error types for opup-client.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum OpupError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration files, capability documents).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport reports that it is not connected.
    #[error("Not connected")]
    NotConnected,

    /// No correlated response arrived within the request timeout.
    #[error("Timeout waiting for response to command 0x{cmd:02X} (seq {seq}) after {timeout:?}")]
    Timeout {
        /// Command code of the request.
        cmd: u8,
        /// Sequence number of the request.
        seq: u8,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The device answered with the error flag set.
    #[error("Device error: code 0x{code:02X}{}", message_suffix(.message))]
    DeviceError {
        /// Device-defined error code (payload byte 0).
        code: u8,
        /// Optional ASCII message following the code.
        message: Option<String>,
    },

    /// Payload exceeds the protocol maximum.
    #[error("Payload size {len} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
        /// Maximum allowed payload length.
        max: usize,
    },

    /// All 255 sequence numbers are in flight.
    #[error("No free sequence number: all 255 are in flight")]
    SequenceExhausted,

    /// A pending request already occupies this sequence number.
    #[error("Sequence number {0} is already in flight")]
    SequenceInUse(u8),

    /// The client was disconnected while the request was outstanding.
    #[error("Disconnected")]
    Disconnected,

    /// Fatal transport failure (e.g. device detached).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered with something the caller could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A flash chip did not reach the state a command should have put it in.
    #[error("Flash error: {0}")]
    Flash(String),

    /// A flash chip stayed busy past the operation's time limit.
    #[error("Flash still busy after {timeout:?}")]
    FlashBusy {
        /// Time limit that elapsed.
        timeout: Duration,
    },

    /// An argument is outside the range the device accepts.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl OpupError {
    /// Check if this error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, OpupError::Timeout { .. })
    }

    /// Device error code, if this is a device error.
    pub fn device_code(&self) -> Option<u8> {
        match self {
            OpupError::DeviceError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default()
}

/// Result type alias using OpupError.
pub type Result<T> = std::result::Result<T, OpupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = OpupError::DeviceError {
            code: 0x01,
            message: Some("Unknown CMD".to_string()),
        };
        assert_eq!(err.to_string(), "Device error: code 0x01 (Unknown CMD)");
        assert_eq!(err.device_code(), Some(0x01));

        let bare = OpupError::DeviceError {
            code: 0x02,
            message: None,
        };
        assert_eq!(bare.to_string(), "Device error: code 0x02");
    }

    #[test]
    fn test_timeout_display() {
        let err = OpupError::Timeout {
            cmd: 0x10,
            seq: 7,
            timeout: Duration::from_millis(2000),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("0x10"));
        assert!(err.to_string().contains("seq 7"));
    }
}
