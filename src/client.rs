//! Protocol client and its builder.
//!
//! [`ProtocolClient`] ties the pieces together:
//! 1. `send_command` allocates a seq, encodes the frame, registers it with the
//!    [`RequestTracker`] and writes it to the [`Transport`]
//! 2. A reader task feeds received chunks into a [`StreamReassembler`] and
//!    routes every frame to the tracker by seq
//! 3. Transport failures are broadcast as [`ClientEvent`]s, force a
//!    disconnect and fail every outstanding request
//!
//! # Example
//!
//! ```ignore
//! use opup_client::{commands, ProtocolClient, StreamTransport};
//!
//! #[tokio::main]
//! async fn main() -> opup_client::Result<()> {
//!     let client = ProtocolClient::builder()
//!         .request_timeout(std::time::Duration::from_millis(500))
//!         .build(StreamTransport::tcp("192.168.1.40:2000"))?;
//!
//!     client.connect().await?;
//!     let reply = client.send_command(commands::SYS_PING, &[]).await?;
//!     assert_eq!(reply.payload(), &[0xCA, 0xFE]);
//!
//!     client.close().await
//! }
//! ```

use std::future::{poll_fn, Future};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{OpupError, Result};
use crate::protocol::{
    commands, Frame, FrameCodec, ReassemblerStats, StreamReassembler, MAX_PAYLOAD_SIZE,
};
use crate::tracker::RequestTracker;
use crate::transport::{Transport, TransportEvent};

/// Notification published to [`ProtocolClient::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Every frame that passed reassembly, before routing.
    FrameReceived(Frame),
    /// A frame flagged async, or one whose seq matched no pending request.
    Unsolicited(Frame),
    /// The transport failed; a disconnect follows.
    TransportError(String),
    /// The link went down, by request or by failure.
    Disconnected,
}

/// Builder for configuring and creating a [`ProtocolClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default time to wait for a response.
    ///
    /// Default: 2 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reassembly buffer ceiling.
    ///
    /// Default: 8192 bytes
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.config.max_buffer_size = size;
        self
    }

    /// Set the scan steps per received chunk.
    ///
    /// Default: 100
    pub fn max_iterations_per_chunk(mut self, steps: usize) -> Self {
        self.config.max_iterations_per_chunk = steps;
        self
    }

    /// Set the event channel capacity.
    ///
    /// Default: 64
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Validate the configuration and create the client.
    ///
    /// The client starts disconnected.
    pub fn build<T: Transport>(self, transport: T) -> Result<ProtocolClient<T>> {
        ProtocolClient::with_config(transport, self.config)
    }
}

/// Transport plus the task reading from it. Locked as a unit so only one
/// write is in flight and connect/disconnect never interleave with it.
struct Link<T> {
    transport: T,
    reader: Option<JoinHandle<()>>,
    /// Bumped on every successful connect.
    epoch: u64,
}

struct Shared<T> {
    link: tokio::sync::Mutex<Link<T>>,
    /// Epoch of the connection that is up, or 0 when down. Readable without
    /// the link lock, which a stalled write may hold.
    live: AtomicU64,
    /// Wakes writers stuck in `Transport::write` on disconnect.
    interrupt: Notify,
    tracker: RequestTracker,
    events: broadcast::Sender<ClientEvent>,
    stats: Mutex<ReassemblerStats>,
    config: ClientConfig,
}

impl<T> Shared<T> {
    fn publish(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn route(&self, frame: Frame) {
        tracing::debug!(
            "Frame seq={} cmd=0x{:02X} ({}) flags=0x{:02X} len={}",
            frame.seq(),
            frame.cmd(),
            commands::command_name(frame.cmd()),
            frame.flags(),
            frame.payload_len()
        );
        self.publish(ClientEvent::FrameReceived(frame.clone()));

        if frame.is_async() || !self.tracker.complete(frame.clone()) {
            tracing::warn!(
                "Unsolicited frame seq={} cmd=0x{:02X}",
                frame.seq(),
                frame.cmd()
            );
            self.publish(ClientEvent::Unsolicited(frame));
        }
    }

    fn record_stats(&self, stats: ReassemblerStats) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) != 0
    }

    /// Mark the link down, failing outstanding requests. Returns false if it
    /// was already down.
    fn go_down(&self) -> bool {
        if self.live.swap(0, Ordering::SeqCst) == 0 {
            return false;
        }
        self.interrupt.notify_waiters();
        self.fail_pending();
        true
    }

    /// Like [`go_down`](Self::go_down), but only for the given connection.
    fn go_down_epoch(&self, epoch: u64) -> bool {
        if self
            .live
            .compare_exchange(epoch, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.interrupt.notify_waiters();
        self.fail_pending();
        true
    }

    fn fail_pending(&self) {
        let rejected = self.tracker.reject_all(|| OpupError::Disconnected);
        tracing::info!("Disconnected ({} pending requests rejected)", rejected);
        self.publish(ClientEvent::Disconnected);
    }
}

/// Client for an OPUP device.
///
/// Methods take `&self`; wrap the client in an `Arc` to issue commands from
/// several tasks. Responses are correlated by seq, so they may arrive in any
/// order.
pub struct ProtocolClient<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> ProtocolClient<T> {
    /// Create a client with default settings.
    pub fn new(transport: T) -> Self {
        Self::from_parts(transport, ClientConfig::default())
    }

    /// Create a client with a validated configuration.
    pub fn with_config(transport: T, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(transport, config))
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn from_parts(transport: T, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                link: tokio::sync::Mutex::new(Link {
                    transport,
                    reader: None,
                    epoch: 0,
                }),
                live: AtomicU64::new(0),
                interrupt: Notify::new(),
                tracker: RequestTracker::new(config.request_timeout()),
                events,
                stats: Mutex::new(ReassemblerStats::default()),
                config,
            }),
        }
    }

    /// Open the transport and start reading. No-op if already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.shared.link.lock().await;
        if self.shared.is_live() && link.transport.is_connected() {
            return Ok(());
        }

        // Let the previous reader run its link-lost path to the end.
        if let Some(reader) = link.reader.take() {
            if let Err(e) = link.transport.disconnect().await {
                tracing::warn!("Closing stale transport failed: {}", e);
            }
            let _ = reader.await;
        }
        self.shared.go_down();

        let events = link.transport.connect().await?;
        link.epoch += 1;
        let epoch = link.epoch;
        self.shared.live.store(epoch, Ordering::SeqCst);
        link.reader = Some(tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            events,
            epoch,
        )));

        tracing::info!("Connected");
        Ok(())
    }

    /// Close the transport and fail every pending request with
    /// [`OpupError::Disconnected`].
    ///
    /// A write blocked on a stalled peer is abandoned rather than waited for.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.go_down();

        let mut link = self.shared.link.lock().await;
        let result = link.transport.disconnect().await;
        if let Some(reader) = link.reader.take() {
            let _ = reader.await;
        }
        result
    }

    /// Disconnect and release the client.
    pub async fn close(self) -> Result<()> {
        self.disconnect().await
    }

    /// Check if the link is up.
    pub async fn is_connected(&self) -> bool {
        if !self.shared.is_live() {
            return false;
        }
        // Held by a write in progress; the link counts as up until it fails.
        match self.shared.link.try_lock() {
            Ok(link) => link.transport.is_connected(),
            Err(_) => true,
        }
    }

    /// Send a command and wait for its response with the default timeout.
    ///
    /// Fails with:
    /// - `NotConnected` immediately if the transport is down
    /// - `PayloadTooLarge` if `payload` exceeds 4096 bytes
    /// - `DeviceError` if the device answered with the error flag
    /// - `Timeout` if no valid response arrived in time
    /// - `Disconnected` if the link went down while waiting
    pub async fn send_command(&self, cmd: u8, payload: &[u8]) -> Result<Frame> {
        self.send_command_with_timeout(cmd, payload, self.shared.tracker.default_timeout())
            .await
    }

    /// [`send_command`](Self::send_command) with a per-call timeout.
    ///
    /// The timeout covers the write as well as the wait for the response.
    pub async fn send_command_with_timeout(
        &self,
        cmd: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(OpupError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let deadline = Instant::now() + timeout;
        let tracker = &self.shared.tracker;

        // Created before the liveness check so a disconnect in between is seen.
        let mut interrupted = pin!(self.shared.interrupt.notified());

        let completion = {
            let mut link = self.shared.link.lock().await;
            if !self.shared.is_live() || !link.transport.is_connected() {
                return Err(OpupError::NotConnected);
            }

            let seq = tracker.allocate()?;
            let bytes = FrameCodec::encode(seq, cmd, payload)?;
            let completion = tracker.register_with_timeout(seq, cmd, timeout)?;

            tracing::debug!(
                "Sending seq={} cmd=0x{:02X} ({}) len={}",
                seq,
                cmd,
                commands::command_name(cmd),
                payload.len()
            );
            let mut write = pin!(tokio::time::timeout_at(
                deadline,
                link.transport.write(&bytes)
            ));
            let written = poll_fn(|cx| {
                if interrupted.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(None);
                }
                write.as_mut().poll(cx).map(Some)
            })
            .await;

            let failure = match written {
                Some(Ok(Ok(()))) => None,
                Some(Ok(Err(e))) => {
                    tracing::error!("Write failed for seq={}: {}", seq, e);
                    Some(e)
                }
                Some(Err(_elapsed)) => {
                    tracing::warn!("Write for seq={} stalled past {:?}", seq, timeout);
                    Some(OpupError::Timeout { cmd, seq, timeout })
                }
                None => {
                    tracing::warn!("Write for seq={} abandoned on disconnect", seq);
                    Some(OpupError::Disconnected)
                }
            };
            if let Some(e) = failure {
                tracker.cancel(seq);
                return Err(e);
            }
            completion
        };

        // A dropped sender means the request was discarded without a result.
        completion.await.unwrap_or(Err(OpupError::Disconnected))
    }

    /// Subscribe to frame and link events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.tracker.len()
    }

    /// Reassembly counters of the current connection.
    pub fn reassembler_stats(&self) -> ReassemblerStats {
        *self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The configuration in effect.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl<T: Transport> Drop for ProtocolClient<T> {
    fn drop(&mut self) {
        // The reader holds the shared state alive; stop it.
        if let Ok(mut link) = self.shared.link.try_lock() {
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
        }
    }
}

/// Reader task: owns the reassembler for one connection.
async fn read_loop<T: Transport>(
    shared: Arc<Shared<T>>,
    mut events: tokio::sync::mpsc::Receiver<TransportEvent>,
    epoch: u64,
) {
    let mut reassembler = StreamReassembler::with_limits(
        shared.config.max_buffer_size,
        shared.config.max_iterations_per_chunk,
    );
    shared.record_stats(reassembler.stats());

    loop {
        match events.recv().await {
            Some(TransportEvent::Data(chunk)) => {
                for frame in reassembler.push(&chunk) {
                    shared.route(frame);
                }
                // Leftover work after the step budget runs after other tasks had a turn.
                while reassembler.has_backlog() {
                    tokio::task::yield_now().await;
                    for frame in reassembler.resume() {
                        shared.route(frame);
                    }
                }
                shared.record_stats(reassembler.stats());
            }
            Some(TransportEvent::Error(message)) => {
                tracing::error!("Transport error: {}", message);
                link_lost(&shared, Some(message), epoch);
                return;
            }
            Some(TransportEvent::Closed) | None => {
                if shared.is_live() {
                    tracing::error!("Transport closed");
                }
                link_lost(&shared, None, epoch);
                return;
            }
        }
    }
}

/// Forced disconnect after a transport failure.
///
/// Runs without the link lock, which a stalled write or a concurrent
/// connect/disconnect may hold. Closing the transport is left to a detached
/// task that gives up if the link was reconnected meanwhile.
fn link_lost<T: Transport>(shared: &Arc<Shared<T>>, error: Option<String>, epoch: u64) {
    if let Some(message) = error {
        shared.publish(ClientEvent::TransportError(message));
    }
    if !shared.go_down_epoch(epoch) {
        // Whoever took the link down closes the transport.
        return;
    }

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let mut link = shared.link.lock().await;
        if link.epoch != epoch || shared.is_live() {
            return;
        }
        if let Err(e) = link.transport.disconnect().await {
            tracing::warn!("Disconnect after failure failed: {}", e);
        }
    });
}
