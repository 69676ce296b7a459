//! Frame codec for the analyzer wire protocol
//!
//! This module turns raw bytes into discrete, typed frames and back. It knows
//! nothing about payload contents.

pub mod format;
pub mod reader;

pub use format::{
    Frame, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_LEN, PREAMBLE, TRAILER, TRAILER_SIZE, TypeCode,
    encode_frame,
};
pub use reader::{FrameReader, write_frame};
