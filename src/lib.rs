//! # opup-client
//!
//! Async host-side client for the OPUP protocol spoken by the open
//! universal programmer firmware.
//!
//! The host sends framed commands over a byte stream (USB CDC serial, a TCP
//! serial bridge, ...) and the device answers each one with a frame carrying
//! the same sequence number.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): SOF-delimited, length-prefixed, CRC32-checked
//!   frames and a reassembler that resynchronizes after corruption
//! - **Correlation** ([`tracker`]): sequence allocation, per-request timeouts
//! - **Link** ([`transport`]): the [`Transport`] trait and a stream
//!   implementation
//! - **Client** ([`ProtocolClient`]): ties the above together, plus typed
//!   device operations ([`device`])
//! - **Workflows** ([`flash`]): SPI flash erase/program/read and AVR
//!   signature reads composed from device operations
//!
//! ## Example
//!
//! ```ignore
//! use opup_client::{ProtocolClient, StreamTransport};
//!
//! #[tokio::main]
//! async fn main() -> opup_client::Result<()> {
//!     let client = ProtocolClient::new(StreamTransport::tcp("192.168.1.40:2000"));
//!     client.connect().await?;
//!
//!     client.ping().await?;
//!     let status = client.get_status().await?;
//!     println!("uptime: {:?}", status.uptime());
//!
//!     client.close().await
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod flash;
pub mod protocol;
pub mod tracker;
pub mod transport;

mod client;

pub use client::{ClientBuilder, ClientEvent, ProtocolClient};
pub use config::ClientConfig;
pub use error::{OpupError, Result};
pub use protocol::{commands, DecodeError, Frame, FrameCodec, StreamReassembler};
pub use tracker::RequestTracker;
pub use transport::{StreamTransport, Transport, TransportEvent};
