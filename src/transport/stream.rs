//! Transport over any tokio byte stream.
//!
//! # Example
//!
//! ```ignore
//! use opup_client::transport::StreamTransport;
//!
//! // A serial-over-TCP bridge (ser2net, esp-link, ...)
//! let transport = StreamTransport::tcp("192.168.1.40:2000");
//!
//! // Or an already-open stream, e.g. one half of `tokio::io::duplex`
//! let (host, device) = tokio::io::duplex(4096);
//! let transport = StreamTransport::from_stream(host);
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Transport, TransportEvent};
use crate::error::{OpupError, Result};

/// Size of a single read from the stream.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Capacity of the event channel handed out by `connect`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Future resolving to a freshly opened stream.
pub type ConnectFuture<S> = Pin<Box<dyn Future<Output = io::Result<S>> + Send>>;

/// Opens a fresh stream on every `connect`.
pub type Connector<S> = Box<dyn Fn() -> ConnectFuture<S> + Send + Sync>;

/// [`Transport`] over a tokio `AsyncRead + AsyncWrite` stream.
///
/// The stream is split on connect: a background task owns the read half and
/// forwards chunks as [`TransportEvent::Data`], the write half stays here.
pub struct StreamTransport<S> {
    connector: Connector<S>,
    writer: Option<WriteHalf<S>>,
    reader: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    read_buffer_size: usize,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a transport that calls `connect` each time the link is opened.
    pub fn with_connector<F, Fut>(connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<S>> + Send + 'static,
    {
        Self {
            connector: Box::new(move || -> ConnectFuture<S> { Box::pin(connect()) }),
            writer: None,
            reader: None,
            connected: Arc::new(AtomicBool::new(false)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Wrap an already-open stream. It can be connected once.
    pub fn from_stream(stream: S) -> Self {
        let slot = Arc::new(Mutex::new(Some(stream)));
        Self::with_connector(move || {
            let stream = slot.lock().ok().and_then(|mut slot| slot.take());
            async move {
                stream.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "stream already consumed")
                })
            }
        })
    }

    /// Set the size of a single read.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    async fn shutdown(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl StreamTransport<TcpStream> {
    /// Transport to a TCP endpoint such as a serial-over-network bridge.
    pub fn tcp(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::with_connector(move || {
            let addr = addr.clone();
            async move {
                let stream = TcpStream::connect(&addr).await?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
        })
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn connect(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.is_connected() {
            return Err(OpupError::Transport("already connected".to_string()));
        }
        // Leftovers of a link that died on its own.
        self.shutdown().await;

        let stream = (self.connector)().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        self.connected.store(true, Ordering::SeqCst);
        self.writer = Some(write_half);
        self.reader = Some(tokio::spawn(read_loop(
            read_half,
            tx,
            Arc::clone(&self.connected),
            self.read_buffer_size,
        )));

        tracing::debug!("Stream transport connected");
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.writer.is_some() {
            tracing::debug!("Stream transport disconnecting");
        }
        self.shutdown().await;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(OpupError::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(OpupError::NotConnected)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some() && self.connected.load(Ordering::SeqCst)
    }
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    buffer_size: usize,
) where
    S: AsyncRead + Send,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Stream closed by peer");
                connected.store(false, Ordering::SeqCst);
                let _ = tx.send(TransportEvent::Closed).await;
                return;
            }
            Ok(n) => {
                tracing::trace!("Read {} bytes", n);
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(TransportEvent::Data(chunk)).await.is_err() {
                    // Nobody listens anymore.
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Stream read failed: {}", e);
                connected.store(false, Ordering::SeqCst);
                let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        }
    }
}
