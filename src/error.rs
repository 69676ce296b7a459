//! Error types for the analyzer protocol engine.
//!
//! All errors implement the `std::error::Error` trait and carry enough
//! structured context to decide, at the pipeline level, whether the session
//! can continue.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: the socket closed or a read/write came up short
//! - **Framing Errors**: the byte stream lost frame synchronisation
//! - **Decode Errors**: a single packet could not be decoded (non-fatal)
//! - **Precondition Errors**: an intent was rejected before any wire traffic
//! - **Instrument Reports**: the analyzer raised a condition needing a human
//! - **Configuration Errors**: invalid connection settings
//!
//! ## Fatal vs. Absorbed
//!
//! ```rust
//! use xrf_link::ProtocolError;
//!
//! let error = ProtocolError::decode_error("Status packet", "missing parameter attribute");
//! assert!(!error.is_fatal());
//!
//! let broken = ProtocolError::connection_broken("peer closed during header");
//! assert!(broken.is_fatal());
//! for suggestion in broken.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Main error type for protocol operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Connection to analyzer broken: {reason}")]
    ConnectionBroken {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Frame stream desynchronised: {details}")]
    Desync { details: String },

    #[error("Failed to connect to analyzer at {address}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Decode error in {context}: {details}")]
    Decode { context: String, details: String },

    #[error("{operation} rejected: {reason}")]
    Precondition { operation: String, reason: String },

    #[error("Instrument reported message {tx_msg_id}: {message}")]
    InstrumentReported { tx_msg_id: String, message: String, ackable: bool },

    #[error("Invalid configuration: {details}")]
    Config { details: String },

    #[error("Session closed")]
    Closed,
}

impl ProtocolError {
    /// Returns whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::ConnectionBroken { .. } => true,
            ProtocolError::Desync { .. } => true,
            ProtocolError::Connect { .. } => true,
            ProtocolError::Closed => true,
            ProtocolError::Decode { .. } => false,
            ProtocolError::Precondition { .. } => false,
            ProtocolError::InstrumentReported { .. } => false,
            ProtocolError::Config { .. } => false,
        }
    }

    /// Returns whether the external layer must involve the operator.
    pub fn is_blocking(&self) -> bool {
        matches!(self, ProtocolError::InstrumentReported { ackable: false, .. }) || self.is_fatal()
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ProtocolError::ConnectionBroken { .. } => vec![
                "Check the analyzer is powered and the cable or Wi-Fi link is up",
                "Archive the session log before reconnecting",
                "Open a new connection; sessions are never resumed",
            ],
            ProtocolError::Desync { .. } => vec![
                "Reconnect to resynchronise the frame stream",
                "Verify no other client is attached to the analyzer",
            ],
            ProtocolError::Connect { .. } => vec![
                "Verify the analyzer address and port",
                "Check the analyzer is not already connected to another host",
                "Increase the connect timeout",
            ],
            ProtocolError::Decode { .. } => vec![
                "Inspect the raw payload reported alongside this error",
                "Check the analyzer firmware version is supported",
            ],
            ProtocolError::Precondition { .. } => vec![
                "Log in and arm the analyzer before starting an assay",
                "Refresh session state and retry the operation",
            ],
            ProtocolError::InstrumentReported { .. } => vec![
                "Read the message on the analyzer screen",
                "Resolve the condition on the instrument itself",
            ],
            ProtocolError::Config { .. } => vec![
                "Check the configuration file for typos",
                "Fall back to default connection settings",
            ],
            ProtocolError::Closed => vec!["Open a new connection"],
        }
    }

    /// Helper constructor for broken connections without an io source.
    pub fn connection_broken(reason: impl Into<String>) -> Self {
        ProtocolError::ConnectionBroken { reason: reason.into(), source: None }
    }

    /// Helper constructor for broken connections caused by an io error.
    pub fn connection_broken_with_source(reason: impl Into<String>, source: std::io::Error) -> Self {
        ProtocolError::ConnectionBroken { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for decode errors.
    pub fn decode_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        ProtocolError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for rejected intents.
    pub fn precondition(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::Precondition { operation: operation.into(), reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(details: impl Into<String>) -> Self {
        ProtocolError::Config { details: details.into() }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        let reason = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => "peer closed the connection",
            std::io::ErrorKind::BrokenPipe => "broken pipe",
            std::io::ErrorKind::ConnectionReset => "connection reset by peer",
            std::io::ErrorKind::ConnectionAborted => "connection aborted",
            _ => "socket i/o failure",
        };
        ProtocolError::ConnectionBroken { reason: reason.to_string(), source: Some(err) }
    }
}
