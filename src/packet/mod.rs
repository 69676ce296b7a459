//! Packet classification and decoding
//!
//! [`classify`] turns a [`Frame`] into one variant of the closed [`Packet`]
//! union. Dispatch happens in two steps:
//!
//! 1. The frame type code splits binary telemetry (cooked spectrum, spectrum
//!    energy, PDZ filename) from XML messages.
//! 2. XML payloads are parsed into an [`XmlNode`] tree and matched against
//!    the ordered predicates in [`shapes::SHAPES`].
//!
//! Decode failures are returned as [`ProtocolError::Decode`]; they never end
//! the session.

use std::fmt;

use crate::assay::ResultRow;
use crate::frame::{Frame, TypeCode};
use crate::session::{InstrumentDefinition, PhaseDefinition};
use crate::xml::XmlNode;
use crate::{ProtocolError, Result};

pub mod shapes;
pub mod spectrum;

pub use spectrum::{CHANNEL_COUNT, COOKED_PAYLOAD_SIZE, CookedSpectrum, SpectrumEnergy};

/// Semantic content of one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// XML that matched no known shape, kept for diagnostics.
    XmlGeneric(XmlNode),
    XmlSuccessResponse(ResponseSummary),
    XmlFailureResponse(ResponseSummary),
    XmlLoginState(bool),
    XmlArmedState(bool),
    XmlInstrumentDefinition(InstrumentDefinition),
    XmlApplicationsList(Vec<String>),
    XmlActiveApplication(ActiveApplication),
    XmlPhaseTimes(Vec<PhaseDefinition>),
    XmlVersion(String),
    XmlNoseTemperature(f32),
    StatusChange(StatusChange),
    AssayResults(AssayResults),
    CookedSpectrum(CookedSpectrum),
    SpectrumEnergy(SpectrumEnergy),
    PdzFilename(String),
    ErrorReport(InstrumentReport),
    InfoReport(InstrumentReport),
    /// Frame family this client does not decode.
    Unknown { type_code: TypeCode, payload: Vec<u8> },
}

impl Packet {
    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::XmlGeneric(_) => "xml-generic",
            Packet::XmlSuccessResponse(_) => "success-response",
            Packet::XmlFailureResponse(_) => "failure-response",
            Packet::XmlLoginState(_) => "login-state",
            Packet::XmlArmedState(_) => "armed-state",
            Packet::XmlInstrumentDefinition(_) => "instrument-definition",
            Packet::XmlApplicationsList(_) => "applications",
            Packet::XmlActiveApplication(_) => "active-application",
            Packet::XmlPhaseTimes(_) => "phase-times",
            Packet::XmlVersion(_) => "version",
            Packet::XmlNoseTemperature(_) => "nose-temperature",
            Packet::StatusChange(_) => "status-change",
            Packet::AssayResults(_) => "assay-results",
            Packet::CookedSpectrum(_) => "cooked-spectrum",
            Packet::SpectrumEnergy(_) => "spectrum-energy",
            Packet::PdzFilename(_) => "pdz-filename",
            Packet::ErrorReport(_) => "error-report",
            Packet::InfoReport(_) => "info-report",
            Packet::Unknown { .. } => "unknown",
        }
    }
}

/// Asynchronous status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    AssayStart,
    AssayComplete,
    /// The instrument moved to the next phase; some firmware sends its number.
    PhaseChange { phase_number: Option<u32> },
    Armed(bool),
    Other { parameter: String, value: String },
}

/// Whether a report came from an `ErrorReport` or an `InfoReport` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Error,
    Info,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Error => f.write_str("Error"),
            ReportKind::Info => f.write_str("Info"),
        }
    }
}

/// Instrument-raised error or info notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentReport {
    pub kind: ReportKind,
    /// Transmission id to echo back as `RxMsgID` when acknowledging.
    pub tx_msg_id: String,
    pub user_ackable: bool,
    pub message: String,
}

impl InstrumentReport {
    /// Convert to the error value surfaced for non-acknowledgeable reports.
    pub fn to_error(&self) -> ProtocolError {
        ProtocolError::InstrumentReported {
            tx_msg_id: self.tx_msg_id.clone(),
            message: self.message.clone(),
            ackable: self.user_ackable,
        }
    }
}

/// Response element reduced to its parameter, status and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub parameter: Option<String>,
    pub status: String,
    pub message: String,
}

impl ResponseSummary {
    /// Whether this response answers the given parameter or names it in its text.
    pub fn concerns(&self, name: &str) -> bool {
        self.parameter.as_deref().is_some_and(|p| p.eq_ignore_ascii_case(name))
            || self.message.eq_ignore_ascii_case(name)
    }
}

/// Active application with its method list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveApplication {
    pub application: String,
    pub active_method: Option<String>,
    pub methods: Vec<String>,
}

/// Elemental results for the current assay.
#[derive(Debug, Clone, PartialEq)]
pub struct AssayResults {
    pub rows: Vec<ResultRow>,
    /// Calculation error reported instead of (or alongside) results.
    pub error: Option<String>,
}

/// Classify and decode one frame.
pub fn classify(frame: &Frame) -> Result<Packet> {
    match frame.type_code {
        TypeCode::COOKED_SPECTRUM => Ok(Packet::CookedSpectrum(CookedSpectrum::decode(&frame.payload)?)),
        TypeCode::SPECTRUM_ENERGY => Ok(Packet::SpectrumEnergy(SpectrumEnergy::decode(&frame.payload)?)),
        TypeCode::PDZ_FILENAME => {
            let name = std::str::from_utf8(&frame.payload).map_err(|e| {
                ProtocolError::decode_error("PDZ filename", format!("invalid UTF-8: {}", e))
            })?;
            Ok(Packet::PdzFilename(name.trim_matches(char::from(0)).trim().to_string()))
        }
        TypeCode::XML => {
            let document = std::str::from_utf8(&frame.payload).map_err(|e| {
                ProtocolError::decode_error("XML payload", format!("invalid UTF-8: {}", e))
            })?;
            let tree = XmlNode::parse(document)?;
            shapes::classify_tree(tree)
        }
        type_code => Ok(Packet::Unknown { type_code, payload: frame.payload.clone() }),
    }
}
