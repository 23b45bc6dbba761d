//! Stream reassembler for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for the accumulation buffer. Each chunk from the
//! transport is appended and scanned for SOF-delimited frames:
//! - Leading non-SOF bytes are discarded
//! - An impossible length drops the SOF byte and rescans
//! - A CRC mismatch drops the whole candidate frame
//! - A partial frame stays buffered until the next chunk
//!
//! The buffer has a hard ceiling; a chunk that would push it past the
//! ceiling clears everything so line noise can never wedge the channel.
//!
//! # Example
//!
//! ```
//! use opup_client::protocol::{FrameCodec, StreamReassembler};
//!
//! let mut reassembler = StreamReassembler::new();
//! let bytes = FrameCodec::encode(1, 0x01, b"").unwrap();
//!
//! // Data arrives in chunks from the transport
//! assert!(reassembler.push(&bytes[..3]).is_empty());
//! let frames = reassembler.push(&bytes[3..]);
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].seq(), 1);
//! ```

use bytes::{Buf, BytesMut};

use super::frame::{DecodeError, Frame, FrameCodec};
use super::wire_format::SOF;

/// Default ceiling for buffered bytes.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 8192;

/// Default number of scan steps performed per chunk.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Counters describing what the reassembler has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Frames successfully decoded.
    pub frames: u64,
    /// Candidate frames dropped for a CRC mismatch.
    pub crc_errors: u64,
    /// SOF bytes dropped because the declared length was impossible.
    pub invalid_lengths: u64,
    /// Times the buffer was cleared for exceeding its ceiling.
    pub overflows: u64,
    /// Total bytes thrown away (noise, corrupt frames, overflow).
    pub discarded_bytes: u64,
}

/// Outcome of a single scan step.
enum Step {
    /// A frame was extracted.
    Frame(Frame),
    /// Bytes were discarded; keep scanning.
    Skipped,
    /// Nothing more can be done until more data arrives.
    Idle,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct StreamReassembler {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Hard ceiling for `buffer`.
    max_buffer_size: usize,
    /// Scan steps allowed per `push`/`resume`.
    max_iterations: usize,
    /// Set when the last pass ran out of steps with data left over.
    backlog: bool,
    stats: ReassemblerStats,
}

impl StreamReassembler {
    /// Create a new reassembler with default settings.
    ///
    /// Default ceiling: 8 KB, 100 scan steps per chunk.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_ITERATIONS)
    }

    /// Create a reassembler with a custom ceiling and per-chunk step budget.
    pub fn with_limits(max_buffer_size: usize, max_iterations: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_buffer_size),
            max_buffer_size,
            max_iterations: max_iterations.max(1),
            backlog: false,
            stats: ReassemblerStats::default(),
        }
    }

    /// Push a chunk into the buffer and extract complete frames.
    ///
    /// This is the main API for processing incoming transport data.
    /// Returns the frames completed by this chunk (may be empty). Corrupt
    /// and oversized input is discarded silently; see [`stats`](Self::stats).
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        if self.buffer.len() + data.len() > self.max_buffer_size {
            let dropped = self.buffer.len() + data.len();
            tracing::warn!(
                "Reassembly buffer overflow ({} bytes > {}), clearing",
                dropped,
                self.max_buffer_size
            );
            self.stats.overflows += 1;
            self.stats.discarded_bytes += dropped as u64;
            self.clear();
            return Vec::new();
        }

        self.buffer.extend_from_slice(data);
        self.process()
    }

    /// Continue scanning already-buffered data without appending anything.
    ///
    /// Used after a pass stopped on its step budget.
    pub fn resume(&mut self) -> Vec<Frame> {
        self.process()
    }

    /// Whether the last pass stopped on its step budget with bytes pending.
    #[inline]
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    fn process(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        self.backlog = false;

        for _ in 0..self.max_iterations {
            match self.step() {
                Step::Frame(frame) => frames.push(frame),
                Step::Skipped => {}
                Step::Idle => return frames,
            }
        }

        self.backlog = !self.buffer.is_empty();
        frames
    }

    fn step(&mut self) -> Step {
        if self.buffer.is_empty() {
            return Step::Idle;
        }

        if self.buffer[0] != SOF {
            let skip = self
                .buffer
                .iter()
                .position(|&b| b == SOF)
                .unwrap_or(self.buffer.len());
            self.discard(skip);
            return Step::Skipped;
        }

        match FrameCodec::decode(&self.buffer) {
            Ok((frame, consumed)) => {
                self.buffer.advance(consumed);
                self.stats.frames += 1;
                tracing::trace!(
                    "Frame seq={} cmd=0x{:02X} flags=0x{:02X} len={}",
                    frame.seq(),
                    frame.cmd(),
                    frame.flags(),
                    frame.payload_len()
                );
                Step::Frame(frame)
            }
            Err(DecodeError::NeedMoreData) => Step::Idle,
            Err(DecodeError::InvalidLength(len)) => {
                tracing::debug!("Invalid frame length {}, resyncing", len);
                self.stats.invalid_lengths += 1;
                self.discard(1);
                Step::Skipped
            }
            Err(DecodeError::CrcMismatch {
                received,
                computed,
                span,
            }) => {
                tracing::warn!(
                    "CRC mismatch (rx 0x{:08X}, calc 0x{:08X}), dropping {} bytes",
                    received,
                    computed,
                    span
                );
                self.stats.crc_errors += 1;
                self.discard(span);
                Step::Skipped
            }
            Err(DecodeError::MissingStartOfFrame(_)) => {
                self.discard(1);
                Step::Skipped
            }
        }
    }

    fn discard(&mut self, count: usize) {
        self.buffer.advance(count);
        self.stats.discarded_bytes += count as u64;
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Counters accumulated since creation.
    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.backlog = false;
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}
