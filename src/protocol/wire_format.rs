//! Wire format encoding and decoding.
//!
//! Implements the 6-byte header, the payload and the CRC32 trailer:
//! ```text
//! ┌──────┬──────┬──────┬───────┬──────────┬───────────┬──────────┐
//! │ SOF  │ Seq  │ Cmd  │ Flags │ Length   │ Payload   │ CRC32    │
//! │ 0xA5 │ u8   │ u8   │ u8    │ u16 LE   │ 0..4096   │ u32 LE   │
//! └──────┴──────┴──────┴───────┴──────────┴───────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. The CRC (CRC-32/ISO-HDLC)
//! covers the header and payload, not the trailer itself.

/// Start-of-frame marker byte.
pub const SOF: u8 = 0xA5;

/// Header size in bytes (SOF + seq + cmd + flags + 2-byte length).
pub const HEADER_SIZE: usize = 6;

/// CRC32 trailer size in bytes.
pub const CRC_SIZE: usize = 4;

/// Maximum payload size accepted on the wire.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Largest possible frame on the wire.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE;

/// Reserved sequence number (never allocated).
pub const RESERVED_SEQ: u8 = 0;

/// Flag constants for the protocol.
pub mod flags {
    /// Frame is a response from the device.
    pub const RESPONSE: u8 = 0b0000_0001;
    /// Response carries an error code in payload byte 0.
    pub const ERROR: u8 = 0b0000_0010;
    /// Unsolicited notification from the device.
    pub const ASYNC: u8 = 0b0000_0100;

    /// Error response flags: response + error = 0x03
    pub const ERROR_RESPONSE: u8 = RESPONSE | ERROR;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sequence number (1-255, 0 reserved).
    pub seq: u8,
    /// Command code.
    pub cmd: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Payload length in bytes.
    pub payload_length: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(seq: u8, cmd: u8, flags: u8, payload_length: u16) -> Self {
        Self {
            seq,
            cmd,
            flags,
            payload_length,
        }
    }

    /// Encode header to bytes, SOF included.
    ///
    /// # Example
    ///
    /// ```
    /// use opup_client::protocol::Header;
    ///
    /// let bytes = Header::new(1, 0x01, 0, 0).encode();
    /// assert_eq!(bytes, [0xA5, 0x01, 0x01, 0x00, 0x00, 0x00]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (6 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = SOF;
        buf[1] = self.seq;
        buf[2] = self.cmd;
        buf[3] = self.flags;
        buf[4..6].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if the buffer is too short or does not start with SOF.
    /// The length field is not range-checked here.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || buf[0] != SOF {
            return None;
        }
        Some(Self {
            seq: buf[1],
            cmd: buf[2],
            flags: buf[3],
            payload_length: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }

    /// Total frame size on the wire for this header.
    #[inline]
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize + CRC_SIZE
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::RESPONSE)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::ERROR)
    }

    /// Check if this is an unsolicited device notification.
    #[inline]
    pub fn is_async(&self) -> bool {
        flags::has_flag(self.flags, flags::ASYNC)
    }
}

/// Compute the frame CRC (CRC-32/ISO-HDLC) over `data`.
///
/// ```
/// use opup_client::protocol::crc32;
///
/// assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
/// ```
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(42, 0x22, flags::RESPONSE, 300);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_little_endian_length() {
        let header = Header::new(1, 0x11, 0, 0x0102);
        let bytes = header.encode();

        assert_eq!(bytes[0], SOF);
        assert_eq!(bytes[4], 0x02);
        assert_eq!(bytes[5], 0x01);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [SOF, 1, 1, 0, 0];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_decode_requires_sof() {
        let buf = [0x00, 1, 1, 0, 0, 0];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_crc_reference_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_flag_accessors() {
        let header = Header::new(1, 1, flags::ERROR_RESPONSE, 1);
        assert!(header.is_response());
        assert!(header.is_error());
        assert!(!header.is_async());

        let request = Header::new(1, 1, 0, 0);
        assert!(!request.is_response());
        assert!(!request.is_error());
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(Header::new(1, 1, 0, 0).frame_size(), 10);
        assert_eq!(
            Header::new(1, 1, 0, MAX_PAYLOAD_SIZE as u16).frame_size(),
            MAX_FRAME_SIZE
        );
    }
}
