//! Request tracker - sequence allocation and response correlation.
//!
//! Every outstanding request owns one entry keyed by its sequence number.
//! The entry holds the `oneshot` sender that completes the caller's future
//! and the handle of its timeout task. Exactly one of three things removes
//! an entry: a matching response, a matching error response, or the timer.
//! Whoever removes the entry owns the sender, so a second completion for the
//! same request is impossible.
//!
//! # Example
//!
//! ```ignore
//! let tracker = RequestTracker::new(Duration::from_secs(2));
//!
//! let seq = tracker.allocate()?;
//! let completion = tracker.register(seq, commands::SYS_PING)?;
//! transport.write(&FrameCodec::encode(seq, commands::SYS_PING, &[])?).await?;
//!
//! let frame = completion.await??;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{OpupError, Result};
use crate::protocol::{Frame, RESERVED_SEQ};

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Receiving side of a registered request.
pub type Completion = oneshot::Receiver<Result<Frame>>;

/// One in-flight request.
struct PendingRequest {
    cmd: u8,
    created_at: Instant,
    timeout: Duration,
    /// Distinguishes reuses of the same seq so a late timer never hits a newer request.
    generation: u64,
    tx: oneshot::Sender<Result<Frame>>,
    timer: AbortHandle,
}

impl PendingRequest {
    fn finish(self, result: Result<Frame>) {
        self.timer.abort();
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.tx.send(result);
    }
}

struct Inner {
    pending: HashMap<u8, PendingRequest>,
    next_seq: u8,
    next_generation: u64,
}

/// Table of in-flight requests.
///
/// Cheap to clone; all clones share one table behind a single mutex. The
/// lock is never held across an `.await`.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<Mutex<Inner>>,
    default_timeout: Duration,
}

impl RequestTracker {
    /// Create a tracker with the given default request timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: HashMap::new(),
                next_seq: 1,
                next_generation: 0,
            })),
            default_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Default timeout applied by [`register`](Self::register).
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Allocate the next free sequence number.
    ///
    /// Allocation walks 1..=255 monotonically, wraps, never returns 0 and
    /// skips any seq still in flight.
    pub fn allocate(&self) -> Result<u8> {
        let mut inner = self.lock();
        let mut candidate = inner.next_seq;

        for _ in 0..u8::MAX {
            if candidate == RESERVED_SEQ {
                candidate = 1;
            }
            let next = candidate.wrapping_add(1);
            if !inner.pending.contains_key(&candidate) {
                inner.next_seq = if next == RESERVED_SEQ { 1 } else { next };
                return Ok(candidate);
            }
            tracing::debug!("Seq {} still in flight, skipping", candidate);
            candidate = next;
        }

        Err(OpupError::SequenceExhausted)
    }

    /// Register a request with the default timeout.
    pub fn register(&self, seq: u8, cmd: u8) -> Result<Completion> {
        self.register_with_timeout(seq, cmd, self.default_timeout)
    }

    /// Register a request and start its timeout timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_with_timeout(&self, seq: u8, cmd: u8, timeout: Duration) -> Result<Completion> {
        let mut inner = self.lock();
        if inner.pending.contains_key(&seq) {
            return Err(OpupError::SequenceInUse(seq));
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let (tx, rx) = oneshot::channel();
        let tracker = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracker.expire(seq, generation);
        })
        .abort_handle();

        inner.pending.insert(
            seq,
            PendingRequest {
                cmd,
                created_at: Instant::now(),
                timeout,
                generation,
                tx,
                timer,
            },
        );
        tracing::debug!(
            "Registered seq={} cmd=0x{:02X} (in flight: {})",
            seq,
            cmd,
            inner.pending.len()
        );

        Ok(rx)
    }

    /// Route a received frame to its request.
    ///
    /// Returns `false` if no request with the frame's seq is in flight.
    pub fn complete(&self, frame: Frame) -> bool {
        let seq = frame.seq();
        if frame.is_error() {
            self.reject_device_error(seq, frame)
        } else {
            self.resolve(seq, frame)
        }
    }

    /// Complete a request successfully.
    pub fn resolve(&self, seq: u8, frame: Frame) -> bool {
        let Some(request) = self.take(seq) else {
            return false;
        };
        tracing::debug!(
            "Resolved seq={} cmd=0x{:02X} in {:?}",
            seq,
            request.cmd,
            request.created_at.elapsed()
        );
        request.finish(Ok(frame));
        true
    }

    /// Fail a request with the device error carried by `frame`.
    pub fn reject_device_error(&self, seq: u8, frame: Frame) -> bool {
        let Some(request) = self.take(seq) else {
            return false;
        };
        let code = frame
            .error_code()
            .or_else(|| frame.payload().first().copied())
            .unwrap_or(0);
        let message = frame.error_message();
        tracing::debug!(
            "Device error for seq={} cmd=0x{:02X}: code 0x{:02X}",
            seq,
            request.cmd,
            code
        );
        request.finish(Err(OpupError::DeviceError { code, message }));
        true
    }

    /// Fail a request with `Timeout`.
    pub fn reject_timeout(&self, seq: u8) -> bool {
        let Some(request) = self.take(seq) else {
            return false;
        };
        Self::time_out(seq, request);
        true
    }

    /// Timer callback: only fires if the entry is still the one that armed it.
    fn expire(&self, seq: u8, generation: u64) {
        let request = {
            let mut inner = self.lock();
            let current = inner
                .pending
                .get(&seq)
                .is_some_and(|request| request.generation == generation);
            if current {
                inner.pending.remove(&seq)
            } else {
                None
            }
        };
        if let Some(request) = request {
            Self::time_out(seq, request);
        }
    }

    fn time_out(seq: u8, request: PendingRequest) {
        tracing::warn!(
            "Timeout for cmd=0x{:02X} seq={} after {:?}",
            request.cmd,
            seq,
            request.timeout
        );
        let error = OpupError::Timeout {
            cmd: request.cmd,
            seq,
            timeout: request.timeout,
        };
        request.finish(Err(error));
    }

    /// Remove a request without completing it (its sender is dropped).
    ///
    /// Used when the write itself failed and the caller already has an error.
    pub fn cancel(&self, seq: u8) -> bool {
        match self.take(seq) {
            Some(request) => {
                request.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request. Returns how many were rejected.
    pub fn reject_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> OpupError,
    {
        let drained: Vec<(u8, PendingRequest)> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (seq, request) in drained {
            tracing::debug!("Rejecting seq={} cmd=0x{:02X}", seq, request.cmd);
            request.finish(Err(make_error()));
        }
        count
    }

    fn take(&self, seq: u8) -> Option<PendingRequest> {
        self.lock().pending.remove(&seq)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Check if `seq` is in flight.
    pub fn contains(&self, seq: u8) -> bool {
        self.lock().pending.contains_key(&seq)
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}
