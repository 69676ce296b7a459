//! Connection configuration
//!
//! Settings are plain serde structs so they can be embedded in a host
//! application's own configuration or loaded from a YAML file:
//!
//! ```yaml
//! host: 192.168.1.40
//! port: 55204
//! repeats: 3
//! correlation: matched
//! startup:
//!   sync_system_time: false
//! ```

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::command::{Command, session_queries};
use crate::correlator::CorrelationMode;
use crate::{ProtocolError, Result};

/// TCP port the analyzer listens on.
pub const DEFAULT_PORT: u16 = 55204;

/// Shortest status poll interval accepted.
pub const MIN_STATUS_POLL_INTERVAL_MS: u64 = 10;

/// Which steps of the connect sequence to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupOptions {
    pub sync_system_time: bool,
    pub transmit_status_messages: bool,
    pub transmit_results: bool,
    pub transmit_spectra: bool,
    /// Query login, armed state, identity, applications and phase times.
    pub query_session: bool,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            sync_system_time: true,
            transmit_status_messages: true,
            transmit_results: true,
            transmit_spectra: true,
            query_session: true,
        }
    }
}

impl StartupOptions {
    /// Commands sent right after connecting, in order.
    pub fn commands(&self, now: NaiveDateTime) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.sync_system_time {
            commands.push(Command::ConfigureSystemTime(now));
        }
        if self.transmit_status_messages {
            commands.push(Command::TransmitStatusMessages(true));
        }
        if self.transmit_results {
            commands.push(Command::TransmitResults);
        }
        if self.transmit_spectra {
            commands.push(Command::TransmitSpectra(true));
        }
        if self.query_session {
            commands.extend(session_queries());
        }
        commands
    }
}

/// Everything needed to open a connection to an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub status_poll_interval_ms: u64,
    /// Consecutive assays per start request.
    pub repeats: u32,
    pub correlation: CorrelationMode,
    pub startup: StartupOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.40".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5000,
            status_poll_interval_ms: 200,
            repeats: 1,
            correlation: CorrelationMode::default(),
            startup: StartupOptions::default(),
        }
    }
}

impl ConnectionConfig {
    /// Defaults pointed at `host`.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self { host: host.into(), ..Self::default() }
    }

    /// Parse and validate YAML. Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| ProtocolError::config_error(format!("YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::config_error(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::config_error("host is empty"));
        }
        if self.port == 0 {
            return Err(ProtocolError::config_error("port must not be 0"));
        }
        if self.status_poll_interval_ms < MIN_STATUS_POLL_INTERVAL_MS {
            return Err(ProtocolError::config_error(format!(
                "status_poll_interval_ms must be at least {} (got {})",
                MIN_STATUS_POLL_INTERVAL_MS, self.status_poll_interval_ms
            )));
        }
        if self.repeats < 1 {
            return Err(ProtocolError::config_error("repeats must be at least 1"));
        }
        Ok(())
    }

    /// `host:port` for the socket connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::QueryParameter;
    use crate::test_utils::timestamp;

    #[test]
    fn defaults_are_valid() {
        let config = ConnectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 55204);
        assert_eq!(config.status_poll_interval(), Duration::from_millis(200));
        assert_eq!(config.correlation, CorrelationMode::Positional);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config = ConnectionConfig::from_yaml_str(
            "host: 10.0.0.7\nrepeats: 3\ncorrelation: matched\nstartup:\n  sync_system_time: false\n",
        )
        .unwrap();
        assert_eq!(config.address(), "10.0.0.7:55204");
        assert_eq!(config.repeats, 3);
        assert_eq!(config.correlation, CorrelationMode::Matched);
        assert!(!config.startup.sync_system_time);
        assert!(config.startup.transmit_spectra);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for yaml in ["port: 0", "repeats: 0", "status_poll_interval_ms: 5", "host: ''"] {
            let err = ConnectionConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, ProtocolError::Config { .. }), "{}: {:?}", yaml, err);
        }
    }

    #[test]
    fn malformed_yaml_is_config_error() {
        assert!(matches!(
            ConnectionConfig::from_yaml_str("port: [not a number"),
            Err(ProtocolError::Config { .. })
        ));
    }

    #[test]
    fn missing_file_is_config_error() {
        assert!(matches!(
            ConnectionConfig::from_file("/nonexistent/xrf-link.yaml"),
            Err(ProtocolError::Config { .. })
        ));
    }

    #[test]
    fn startup_sequence_order() {
        let commands = StartupOptions::default().commands(timestamp(8, 0, 0));
        assert_eq!(commands[0], Command::ConfigureSystemTime(timestamp(8, 0, 0)));
        assert_eq!(commands[1], Command::TransmitStatusMessages(true));
        assert_eq!(commands[2], Command::TransmitResults);
        assert_eq!(commands[3], Command::TransmitSpectra(true));
        assert_eq!(commands[4], Command::Query(QueryParameter::LoginState));
        assert_eq!(commands.last(), Some(&Command::Query(QueryParameter::PhaseTimes)));
        assert_eq!(commands.len(), 11);
    }

    #[test]
    fn startup_steps_can_be_disabled() {
        let options = StartupOptions {
            sync_system_time: false,
            transmit_status_messages: true,
            transmit_results: false,
            transmit_spectra: false,
            query_session: false,
        };
        assert_eq!(options.commands(timestamp(8, 0, 0)), vec![Command::TransmitStatusMessages(true)]);
    }
}
