//! Byte transport abstraction.
//!
//! The client is agnostic of the physical link: anything that can open a
//! byte pipe, write to it and report received chunks implements
//! [`Transport`]. Received data, read errors and end-of-stream are delivered
//! through the channel returned by [`Transport::connect`].
//!
//! - [`StreamTransport`]: any tokio `AsyncRead + AsyncWrite` stream
//!   (TCP serial bridges, `tokio::io::duplex` in tests, serial port crates
//!   exposing tokio streams).

mod stream;

use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

pub use stream::{ConnectFuture, Connector, StreamTransport, DEFAULT_READ_BUFFER_SIZE};

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A chunk of received bytes. Chunk boundaries carry no meaning.
    Data(Bytes),
    /// The link failed; the device is considered detached.
    Error(String),
    /// The peer closed the link.
    Closed,
}

/// A byte-oriented, bidirectional link to a device.
///
/// Implementations must deliver received chunks in order. After sending
/// [`TransportEvent::Error`] or [`TransportEvent::Closed`] they send nothing
/// further on that channel.
pub trait Transport: Send + 'static {
    /// Open the link and return the channel of received events.
    fn connect(&mut self) -> impl Future<Output = Result<mpsc::Receiver<TransportEvent>>> + Send;

    /// Close the link. Idempotent.
    ///
    /// Drops the sending side of the event channel, so the receiver returned
    /// by `connect` ends once buffered events are drained.
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Write all of `data` to the link.
    ///
    /// The returned future may be dropped mid-write when the caller's
    /// deadline passes or the client disconnects.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Check if the link is open.
    fn is_connected(&self) -> bool;
}
