//! Async client for the control protocol of XRF analyzers.
//!
//! The analyzer speaks a framed TCP protocol that mixes binary telemetry
//! (spectra and their energy calibrations) with small XML documents for
//! commands, responses and status notifications. This crate decodes that
//! stream, tracks the instrument session, drives the multi-phase assay
//! lifecycle (including consecutive repeats) and answers the
//! acknowledgments the analyzer demands.
//!
//! # Features
//!
//! - **Frame codec**: exact reads, no resynchronisation guessing
//! - **Typed packets**: one closed enum for every message the client understands
//! - **Single-writer state**: session and catalogue published as snapshots
//! - **Assay catalogue**: completed assays with per-phase spectra and results
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use xrf_link::{Analyzer, EngineEvent};
//!
//! #[tokio::main]
//! async fn main() -> xrf_link::Result<()> {
//!     let connection = Analyzer::connect_to("192.168.1.40").await?;
//!     let mut events = connection.events();
//!
//!     connection.wait_for_session(|s| s.is_armed).await?;
//!     connection.start_assay().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let EngineEvent::AssayCompleted(assay) = event {
//!             println!("Assay {} complete", assay.sequence_index);
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Wire format and decoding
pub mod frame;
pub mod packet;
pub mod xml;

// Protocol engine
pub mod ack;
pub mod assay;
pub mod command;
pub mod correlator;
pub mod machine;
pub mod session;

// Stream-based connection architecture
pub mod config;
pub mod connection;
pub mod driver;
pub mod source;
pub mod stream;

// Core exports
pub use error::*;

pub use assay::{Assay, AssayCatalogue, ResultRow};
pub use command::Command;
pub use config::{ConnectionConfig, StartupOptions};
pub use connection::Connection;
pub use correlator::CorrelationMode;
pub use frame::{Frame, FrameReader, TypeCode};
pub use machine::{EngineEvent, Intent};
pub use packet::{CookedSpectrum, Packet, SpectrumEnergy};
pub use session::{AssayState, PhaseDefinition, SessionState};

/// Unified entry point for analyzer connections.
///
/// # Examples
///
/// ```rust,no_run
/// use xrf_link::{Analyzer, ConnectionConfig};
///
/// #[tokio::main]
/// async fn main() -> xrf_link::Result<()> {
///     let config = ConnectionConfig::from_file("analyzer.yaml")?;
///     let connection = Analyzer::connect(&config).await?;
///     println!("{}", connection.session().status_line());
///     Ok(())
/// }
/// ```
pub struct Analyzer;

impl Analyzer {
    /// Connect with explicit settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The analyzer does not accept the connection within the connect timeout
    pub async fn connect(config: &ConnectionConfig) -> Result<Connection> {
        Connection::connect(config).await
    }

    /// Connect to `host` on the default port with default settings.
    pub async fn connect_to(host: impl Into<String>) -> Result<Connection> {
        Connection::connect(&ConnectionConfig::for_host(host)).await
    }
}
