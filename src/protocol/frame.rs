//! Frame struct and the frame codec.
//!
//! A [`Frame`] is one complete, CRC-validated protocol message.
//! [`FrameCodec`] turns `(seq, cmd, payload)` into wire bytes and validates a
//! candidate byte window back into a frame.
//!
//! # Example
//!
//! ```
//! use opup_client::protocol::FrameCodec;
//!
//! let bytes = FrameCodec::encode(1, 0x01, b"").unwrap();
//! let (frame, consumed) = FrameCodec::decode(&bytes).unwrap();
//!
//! assert_eq!(consumed, bytes.len());
//! assert_eq!(frame.seq(), 1);
//! assert_eq!(frame.cmd(), 0x01);
//! assert!(frame.payload().is_empty());
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::wire_format::{crc32, flags, Header, CRC_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, SOF};
use crate::error::{OpupError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the sequence number.
    #[inline]
    pub fn seq(&self) -> u8 {
        self.header.seq
    }

    /// Get the command code.
    #[inline]
    pub fn cmd(&self) -> u8 {
        self.header.cmd
    }

    /// Get the flags byte.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Check if the error flag is set.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    /// Check if this is an unsolicited device notification.
    #[inline]
    pub fn is_async(&self) -> bool {
        self.header.is_async()
    }

    /// Device error code (payload byte 0) of an error response.
    ///
    /// An error frame with an empty payload reports code 0.
    pub fn error_code(&self) -> Option<u8> {
        if !self.is_error() {
            return None;
        }
        Some(self.payload.first().copied().unwrap_or(0))
    }

    /// Optional ASCII message following the error code.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() || self.payload.len() < 2 {
            return None;
        }
        let text = String::from_utf8_lossy(&self.payload[1..]);
        let text = text.trim_end_matches('\0');
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Reasons a candidate byte window does not decode into a frame.
///
/// These never reach a `send_command` caller; the reassembler uses them to
/// decide how many bytes to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The window ends before the frame does.
    #[error("need more data")]
    NeedMoreData,

    /// The window does not start with the SOF marker.
    #[error("window does not start with SOF (0x{0:02X})")]
    MissingStartOfFrame(u8),

    /// Declared payload length exceeds the protocol maximum.
    #[error("invalid payload length {0}")]
    InvalidLength(u16),

    /// Trailer does not match the computed CRC.
    #[error("CRC mismatch: received 0x{received:08X}, computed 0x{computed:08X}")]
    CrcMismatch {
        /// CRC carried in the trailer.
        received: u32,
        /// CRC computed over header and payload.
        computed: u32,
        /// Bytes spanned by the corrupted candidate frame.
        span: usize,
    },
}

/// Codec for the OPUP wire format.
///
/// Implemented as a marker struct with static methods; it holds no state.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a request frame (flags = 0).
    ///
    /// Fails with `PayloadTooLarge` if the payload exceeds 4096 bytes.
    pub fn encode(seq: u8, cmd: u8, payload: &[u8]) -> Result<Bytes> {
        Self::encode_with_flags(seq, cmd, 0, payload)
    }

    /// Encode a frame with an explicit flags byte.
    pub fn encode_with_flags(seq: u8, cmd: u8, flags: u8, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(OpupError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = Header::new(seq, cmd, flags, payload.len() as u16);
        let mut buf = BytesMut::with_capacity(header.frame_size());
        buf.put_slice(&header.encode());
        buf.put_slice(payload);
        let crc = crc32(&buf);
        buf.put_u32_le(crc);

        Ok(buf.freeze())
    }

    /// Encode an existing frame (header length is recomputed from the payload).
    pub fn encode_frame(frame: &Frame) -> Result<Bytes> {
        Self::encode_with_flags(frame.seq(), frame.cmd(), frame.flags(), frame.payload())
    }

    /// Encode an error response as the device would send it.
    pub fn encode_error(seq: u8, cmd: u8, code: u8, message: &str) -> Result<Bytes> {
        let mut payload = Vec::with_capacity(1 + message.len());
        payload.push(code);
        payload.extend_from_slice(message.as_bytes());
        Self::encode_with_flags(seq, cmd, flags::ERROR_RESPONSE, &payload)
    }

    /// Decode a candidate window that begins at a SOF byte.
    ///
    /// On success returns the frame and the number of bytes it consumed
    /// (`6 + len + 4`). Trailing bytes after the frame are ignored.
    pub fn decode(window: &[u8]) -> std::result::Result<(Frame, usize), DecodeError> {
        if let Some(&first) = window.first() {
            if first != SOF {
                return Err(DecodeError::MissingStartOfFrame(first));
            }
        }
        if window.len() < HEADER_SIZE {
            return Err(DecodeError::NeedMoreData);
        }

        let len = u16::from_le_bytes([window[4], window[5]]);
        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::InvalidLength(len));
        }

        let body_end = HEADER_SIZE + len as usize;
        let span = body_end + CRC_SIZE;
        if window.len() < span {
            return Err(DecodeError::NeedMoreData);
        }

        let received = u32::from_le_bytes([
            window[body_end],
            window[body_end + 1],
            window[body_end + 2],
            window[body_end + 3],
        ]);
        let computed = crc32(&window[..body_end]);
        if received != computed {
            return Err(DecodeError::CrcMismatch {
                received,
                computed,
                span,
            });
        }

        let header = Header::new(window[1], window[2], window[3], len);
        let payload = Bytes::copy_from_slice(&window[HEADER_SIZE..body_end]);
        Ok((Frame::new(header, payload), span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_ping_frame() {
        let bytes = FrameCodec::encode(1, 0x01, &[]).unwrap();

        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[..6], &[0xA5, 0x01, 0x01, 0x00, 0x00, 0x00]);
        let crc = crc32(&bytes[..6]).to_le_bytes();
        assert_eq!(&bytes[6..], &crc);

        let (frame, consumed) = FrameCodec::decode(&bytes).unwrap();
        assert_eq!(consumed, 10);
        assert_eq!(frame.seq(), 1);
        assert_eq!(frame.cmd(), 1);
        assert_eq!(frame.flags(), 0);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_roundtrip_all_payload_lengths() {
        for len in 0..=MAX_PAYLOAD_SIZE {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 + len) as u8).collect();
            let seq = (len % 255) as u8 + 1;
            let bytes = FrameCodec::encode(seq, 0x22, &payload).unwrap();

            let (frame, consumed) = FrameCodec::decode(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(frame.seq(), seq);
            assert_eq!(frame.cmd(), 0x22);
            assert_eq!(frame.flags(), 0);
            assert_eq!(frame.payload(), &payload[..]);
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = FrameCodec::encode(1, 0x22, &payload);
        assert!(matches!(
            result,
            Err(OpupError::PayloadTooLarge { len: 4097, max: 4096 })
        ));
    }

    #[test]
    fn test_decode_need_more_data() {
        let bytes = FrameCodec::encode(3, 0x11, b"abc").unwrap();

        assert_eq!(FrameCodec::decode(&bytes[..4]), Err(DecodeError::NeedMoreData));
        assert_eq!(
            FrameCodec::decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::NeedMoreData)
        );
        assert_eq!(FrameCodec::decode(&[]), Err(DecodeError::NeedMoreData));
    }

    #[test]
    fn test_decode_invalid_length() {
        let window = [SOF, 1, 1, 0, 0x01, 0x10]; // len = 4097
        assert_eq!(
            FrameCodec::decode(&window),
            Err(DecodeError::InvalidLength(4097))
        );
    }

    #[test]
    fn test_decode_crc_mismatch_reports_span() {
        let mut bytes = FrameCodec::encode(9, 0x12, b"data").unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        match FrameCodec::decode(&bytes) {
            Err(DecodeError::CrcMismatch { span, received, computed }) => {
                assert_eq!(span, bytes.len());
                assert_ne!(received, computed);
            }
            other => panic!("expected CRC mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_sof() {
        assert_eq!(
            FrameCodec::decode(&[0x00, 1, 1, 0, 0, 0]),
            Err(DecodeError::MissingStartOfFrame(0x00))
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = FrameCodec::encode(5, 0x01, b"x").unwrap().to_vec();
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[SOF, 0x02]);

        let (frame, consumed) = FrameCodec::decode(&bytes).unwrap();
        assert_eq!(consumed, frame_len);
        assert_eq!(frame.payload(), b"x");
    }

    #[test]
    fn test_error_frame_accessors() {
        let bytes = FrameCodec::encode_error(4, 0x41, 0x01, "Unknown CMD").unwrap();
        let (frame, _) = FrameCodec::decode(&bytes).unwrap();

        assert!(frame.is_response());
        assert!(frame.is_error());
        assert_eq!(frame.error_code(), Some(0x01));
        assert_eq!(frame.error_message().as_deref(), Some("Unknown CMD"));
    }

    #[test]
    fn test_error_code_on_empty_error_payload() {
        let bytes = FrameCodec::encode_with_flags(4, 0x41, flags::ERROR_RESPONSE, &[]).unwrap();
        let (frame, _) = FrameCodec::decode(&bytes).unwrap();
        assert_eq!(frame.error_code(), Some(0));
        assert_eq!(frame.error_message(), None);
    }

    #[test]
    fn test_encode_frame_matches_encode() {
        let bytes = FrameCodec::encode_with_flags(7, 0x20, flags::RESPONSE, b"\x01\xEF\x40\x18")
            .unwrap();
        let (frame, _) = FrameCodec::decode(&bytes).unwrap();
        assert_eq!(FrameCodec::encode_frame(&frame).unwrap(), bytes);
    }
}
