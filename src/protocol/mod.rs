//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary OPUP protocol:
//! - 6-byte header plus CRC32 trailer encoding/decoding
//! - Stream reassembler for accumulating partial reads
//! - Command and device error code constants
//! - Frame struct with typed accessors

pub mod commands;
mod frame;
mod reassembler;
mod wire_format;

pub use frame::{DecodeError, Frame, FrameCodec};
pub use reassembler::{
    ReassemblerStats, StreamReassembler, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_ITERATIONS,
};
pub use wire_format::{
    crc32, flags, Header, CRC_SIZE, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, RESERVED_SEQ,
    SOF,
};
