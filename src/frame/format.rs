//! Wire frame structures and encoding
//!
//! Every message exchanged with the analyzer, in either direction, is wrapped
//! in the same envelope:
//!
//! 1. **Preamble** (4 bytes) - constant `03 02 00 00`
//! 2. **Type code** (2 bytes) - little-endian message family
//! 3. **Length** (4 bytes) - little-endian payload length
//! 4. **Payload** (`length` bytes)
//! 5. **Trailer** (4 bytes) - constant `06 2A FF FF`
//!
//! The codec has no knowledge of payload semantics; classification happens
//! in [`crate::packet`].

use std::fmt;

use crate::{ProtocolError, Result};

/// Constant frame preamble.
pub const PREAMBLE: [u8; 4] = [0x03, 0x02, 0x00, 0x00];
/// Constant frame trailer.
pub const TRAILER: [u8; 4] = [0x06, 0x2A, 0xFF, 0xFF];
/// Size of the fixed header (preamble, type code, length).
pub const HEADER_SIZE: usize = 10;
/// Size of the fixed trailer.
pub const TRAILER_SIZE: usize = 4;
/// Largest payload accepted before the stream is considered desynchronised.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Two-byte frame type code, stored as the little-endian value of the wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeCode(pub u16);

impl TypeCode {
    /// Processed spectrum for the phase currently accumulating.
    pub const COOKED_SPECTRUM: TypeCode = TypeCode(0x8001);
    /// Binary results set (not decoded).
    pub const RESULTS_SET: TypeCode = TypeCode(0x8002);
    /// Raw detector spectra (not decoded).
    pub const RAW_SPECTRA: TypeCode = TypeCode(0x8003);
    /// Name of the PDZ file the instrument wrote for the assay.
    pub const PDZ_FILENAME: TypeCode = TypeCode(0x8004);
    /// XML command, response, status or report.
    pub const XML: TypeCode = TypeCode(0x8017);
    /// Energy calibration for the next spectrum update.
    pub const SPECTRUM_ENERGY: TypeCode = TypeCode(0x8018);

    /// Wire representation of this code.
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    /// Human readable family name for logging.
    pub fn name(self) -> &'static str {
        match self {
            TypeCode::COOKED_SPECTRUM => "cooked-spectrum",
            TypeCode::RESULTS_SET => "results-set",
            TypeCode::RAW_SPECTRA => "raw-spectra",
            TypeCode::PDZ_FILENAME => "pdz-filename",
            TypeCode::XML => "xml",
            TypeCode::SPECTRUM_ENERGY => "spectrum-energy",
            _ => "unknown",
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x} ({})", self.0, self.name())
    }
}

/// One wire frame with its envelope stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_code: TypeCode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(type_code: TypeCode, payload: Vec<u8>) -> Self {
        Self { type_code, payload }
    }

    /// Create an XML frame from a UTF-8 document.
    pub fn xml(document: &str) -> Self {
        Self::new(TypeCode::XML, document.as_bytes().to_vec())
    }

    /// Encode this frame into its complete wire representation.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.type_code, &self.payload)
    }

    /// Total number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TRAILER_SIZE
    }
}

/// Prepend the preamble, type code and length to `payload` and append the trailer.
pub fn encode_frame(type_code: TypeCode, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    bytes.extend_from_slice(&PREAMBLE);
    bytes.extend_from_slice(&type_code.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&TRAILER);
    bytes
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub type_code: TypeCode,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Parse and validate the 10-byte header.
    pub fn parse(header: &[u8; HEADER_SIZE]) -> Result<Self> {
        if header[0..4] != PREAMBLE {
            return Err(ProtocolError::Desync {
                details: format!("expected preamble {:02x?}, found {:02x?}", PREAMBLE, &header[0..4]),
            });
        }

        let type_code = TypeCode(u16::from_le_bytes([header[4], header[5]]));
        let payload_len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Desync {
                details: format!(
                    "declared payload of {} bytes exceeds limit of {} bytes",
                    payload_len, MAX_PAYLOAD_LEN
                ),
            });
        }

        Ok(Self { type_code, payload_len })
    }
}
