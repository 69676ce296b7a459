//! Binary spectrum structures
//!
//! Defines the two binary telemetry payloads the analyzer streams during an
//! assay and decodes them with explicit little-endian offsets.
//!
//! ## Cooked Spectrum Layout
//!
//! A cooked spectrum payload is a 208-byte header followed by 2048 `u32`
//! channel counts, 8400 bytes in total:
//!
//! ```text
//! offset  width  field
//!      0  i32    detector temperature (raw)
//!      4  i32    ambient temperature (raw)
//!      8  u32    real time (ms)
//!     12  u32    live time (ms)
//!     16  u32    dead time (ms)
//!     20  u32    reset time (ms)
//!     24  u32    raw counts
//!     28  u32    valid counts
//!     32  u32    accumulation sequence number
//!     36  u32    phase number
//!     40  u32    tube voltage ADC
//!     44  u32    tube current ADC
//!     48  32 B   filter description (NUL padded)
//!     80  u32    filter number
//!     84  124 B  reserved
//!    208  2048 x u32 channel counts
//! ```
//!
//! Counts are cumulative for the phase: each packet supersedes the previous
//! one in its series, and sequence number 1 starts a new series.

use std::sync::Arc;

use crate::{ProtocolError, Result};

/// Size of the cooked spectrum header in bytes.
pub const COOKED_HEADER_SIZE: usize = 208;
/// Channel count of supported hardware.
pub const CHANNEL_COUNT: usize = 2048;
/// Exact payload length of a cooked spectrum frame.
pub const COOKED_PAYLOAD_SIZE: usize = COOKED_HEADER_SIZE + CHANNEL_COUNT * 4;
/// Exact payload length of a spectrum energy frame.
pub const ENERGY_PAYLOAD_SIZE: usize = 12;

const FILTER_DESCRIPTION_OFFSET: usize = 48;
const FILTER_DESCRIPTION_SIZE: usize = 32;

/// Cooked spectrum packet: accumulation telemetry plus cumulative channel counts.
#[derive(Debug, Clone, PartialEq)]
pub struct CookedSpectrum {
    pub detector_temp_raw: i32,
    pub ambient_temp_raw: i32,
    pub real_time_ms: u32,
    pub live_time_ms: u32,
    pub dead_time_ms: u32,
    pub reset_time_ms: u32,
    pub raw_counts: u32,
    pub valid_counts: u32,
    /// 1 marks the first packet of a new accumulating series.
    pub accumulation_sequence: u32,
    pub phase_number: u32,
    pub tube_voltage_adc: u32,
    pub tube_current_adc: u32,
    pub filter_description: String,
    pub filter_number: u32,
    /// Channel counts, shared between correlator buffers and assay records.
    pub counts: Arc<[u32]>,
}

impl CookedSpectrum {
    /// Decode a cooked spectrum payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != COOKED_PAYLOAD_SIZE {
            return Err(ProtocolError::decode_error(
                "Cooked spectrum",
                format!(
                    "payload is {} bytes, expected exactly {} ({} header + {} channels)",
                    payload.len(),
                    COOKED_PAYLOAD_SIZE,
                    COOKED_HEADER_SIZE,
                    CHANNEL_COUNT
                ),
            ));
        }

        let counts: Arc<[u32]> = payload[COOKED_HEADER_SIZE..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self {
            detector_temp_raw: parse_i32_le(payload, 0)?,
            ambient_temp_raw: parse_i32_le(payload, 4)?,
            real_time_ms: parse_u32_le(payload, 8)?,
            live_time_ms: parse_u32_le(payload, 12)?,
            dead_time_ms: parse_u32_le(payload, 16)?,
            reset_time_ms: parse_u32_le(payload, 20)?,
            raw_counts: parse_u32_le(payload, 24)?,
            valid_counts: parse_u32_le(payload, 28)?,
            accumulation_sequence: parse_u32_le(payload, 32)?,
            phase_number: parse_u32_le(payload, 36)?,
            tube_voltage_adc: parse_u32_le(payload, 40)?,
            tube_current_adc: parse_u32_le(payload, 44)?,
            filter_description: extract_null_terminated_string(
                &payload[FILTER_DESCRIPTION_OFFSET..FILTER_DESCRIPTION_OFFSET + FILTER_DESCRIPTION_SIZE],
            ),
            filter_number: parse_u32_le(payload, 80)?,
            counts,
        })
    }

    /// Encode back to the wire layout; reserved bytes are zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; COOKED_PAYLOAD_SIZE];
        bytes[0..4].copy_from_slice(&self.detector_temp_raw.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.ambient_temp_raw.to_le_bytes());
        let words = [
            (8, self.real_time_ms),
            (12, self.live_time_ms),
            (16, self.dead_time_ms),
            (20, self.reset_time_ms),
            (24, self.raw_counts),
            (28, self.valid_counts),
            (32, self.accumulation_sequence),
            (36, self.phase_number),
            (40, self.tube_voltage_adc),
            (44, self.tube_current_adc),
            (80, self.filter_number),
        ];
        for (offset, value) in words {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        let description = self.filter_description.as_bytes();
        let len = description.len().min(FILTER_DESCRIPTION_SIZE);
        bytes[FILTER_DESCRIPTION_OFFSET..FILTER_DESCRIPTION_OFFSET + len]
            .copy_from_slice(&description[..len]);
        for (i, count) in self.counts.iter().take(CHANNEL_COUNT).enumerate() {
            let offset = COOKED_HEADER_SIZE + i * 4;
            bytes[offset..offset + 4].copy_from_slice(&count.to_le_bytes());
        }
        bytes
    }

    /// Whether this packet starts a new accumulating series.
    pub fn starts_series(&self) -> bool {
        self.accumulation_sequence == 1
    }

    /// Sum of all channel counts.
    pub fn total_counts(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Energy calibration for converting channel index to keV.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumEnergy {
    pub packet_count: i32,
    pub ev_channel_start: f32,
    pub ev_per_channel: f32,
}

impl SpectrumEnergy {
    /// Decode a 12-byte spectrum energy payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != ENERGY_PAYLOAD_SIZE {
            return Err(ProtocolError::decode_error(
                "Spectrum energy",
                format!(
                    "payload is {} bytes, expected exactly {}",
                    payload.len(),
                    ENERGY_PAYLOAD_SIZE
                ),
            ));
        }
        Ok(Self {
            packet_count: parse_i32_le(payload, 0)?,
            ev_channel_start: parse_f32_le(payload, 4)?,
            ev_per_channel: parse_f32_le(payload, 8)?,
        })
    }

    /// Encode to the 12-byte wire layout.
    pub fn encode(&self) -> [u8; ENERGY_PAYLOAD_SIZE] {
        let mut bytes = [0u8; ENERGY_PAYLOAD_SIZE];
        bytes[0..4].copy_from_slice(&self.packet_count.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.ev_channel_start.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.ev_per_channel.to_le_bytes());
        bytes
    }

    /// Energy of a channel in keV.
    pub fn energy_kev(&self, channel: usize) -> f32 {
        (self.ev_channel_start + channel as f32 * self.ev_per_channel) / 1000.0
    }

    /// Energy axis for a full spectrum in keV.
    pub fn energy_axis_kev(&self, channels: usize) -> Vec<f32> {
        (0..channels).map(|channel| self.energy_kev(channel)).collect()
    }
}

fn parse_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    let bytes = take4(data, offset, "i32")?;
    Ok(i32::from_le_bytes(bytes))
}

fn parse_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = take4(data, offset, "u32")?;
    Ok(u32::from_le_bytes(bytes))
}

fn parse_f32_le(data: &[u8], offset: usize) -> Result<f32> {
    let bytes = take4(data, offset, "f32")?;
    Ok(f32::from_le_bytes(bytes))
}

fn take4(data: &[u8], offset: usize, kind: &str) -> Result<[u8; 4]> {
    if offset + 4 > data.len() {
        return Err(ProtocolError::decode_error(
            "Binary field parsing",
            format!(
                "Insufficient data for {} at offset {} (need 4 bytes, have {})",
                kind,
                offset,
                data.len().saturating_sub(offset)
            ),
        ));
    }
    Ok([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn extract_null_terminated_string(bytes: &[u8]) -> String {
    let null_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..null_pos]).trim().to_string()
}
