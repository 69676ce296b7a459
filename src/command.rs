//! Outbound command vocabulary
//!
//! Every command is a small UTF-8 XML document sent in an XML frame. Values
//! are escaped before they are spliced into the document.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;

use crate::frame::Frame;
use crate::xml::escape;

/// Declaration prefixed to every command document.
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

/// Parameters accepted by `<Query parameter="...">`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryParameter {
    LoginState,
    ArmedState,
    InstrumentDefinition,
    Applications,
    ActiveApplication,
    PhaseTimes,
    Version,
    NoseTemperature,
}

impl QueryParameter {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryParameter::LoginState => "Login State",
            QueryParameter::ArmedState => "Armed State",
            QueryParameter::InstrumentDefinition => "Instrument Definition",
            QueryParameter::Applications => "Applications",
            QueryParameter::ActiveApplication => "ActiveApplication",
            QueryParameter::PhaseTimes => "Phase Times",
            QueryParameter::Version => "Version",
            QueryParameter::NoseTemperature => "Nose Temperature",
        }
    }
}

impl fmt::Display for QueryParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command sent to the analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login,
    Query(QueryParameter),
    StartAssay,
    StopAssay,
    ConfigureApplication { application: String, method: String },
    ConfigureMethod { method: String },
    /// One duration per phase, numbered from 1 in order.
    ConfigurePhaseTimes { durations: Vec<Duration> },
    ConfigureSystemTime(NaiveDateTime),
    TransmitStatusMessages(bool),
    TransmitResults,
    TransmitSpectra(bool),
    Acknowledge { rx_msg_id: String },
}

impl Command {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Login => "login",
            Command::Query(_) => "query",
            Command::StartAssay => "assay-start",
            Command::StopAssay => "assay-stop",
            Command::ConfigureApplication { .. } => "configure-application",
            Command::ConfigureMethod { .. } => "configure-method",
            Command::ConfigurePhaseTimes { .. } => "configure-phase-times",
            Command::ConfigureSystemTime(_) => "configure-system-time",
            Command::TransmitStatusMessages(_) => "transmit-statusmsg",
            Command::TransmitResults => "transmit-results",
            Command::TransmitSpectra(_) => "transmit-spectra",
            Command::Acknowledge { .. } => "acknowledge",
        }
    }

    /// Render the complete XML document, declaration included.
    pub fn to_xml(&self) -> String {
        let body = match self {
            Command::Login => "<Login></Login>".to_string(),
            Command::Query(QueryParameter::ActiveApplication) => {
                r#"<Query parameter="ActiveApplication">Include Methods</Query>"#.to_string()
            }
            Command::Query(parameter) => {
                format!(r#"<Query parameter="{}"></Query>"#, parameter.as_str())
            }
            Command::StartAssay => "<Command>Assay Start</Command>".to_string(),
            Command::StopAssay => "<Command>Assay Stop</Command>".to_string(),
            Command::ConfigureApplication { application, method } => format!(
                r#"<Configure parameter="Application">{}|{}</Configure>"#,
                escape(application),
                escape(method)
            ),
            Command::ConfigureMethod { method } => {
                format!(r#"<Configure parameter="Method">{}</Configure>"#, escape(method))
            }
            Command::ConfigurePhaseTimes { durations } => {
                let mut phases = String::new();
                for (index, duration) in durations.iter().enumerate() {
                    phases.push_str(&format!(
                        r#"<Phase number="{}" enabled="Yes"><Duration unit="ms">{}</Duration></Phase>"#,
                        index + 1,
                        duration.as_millis()
                    ));
                }
                format!(
                    r#"<Configure parameter="Phase Times"><PhaseList>{}</PhaseList></Configure>"#,
                    phases
                )
            }
            Command::ConfigureSystemTime(now) => format!(
                r#"<Configure parameter="System Time">{}</Configure>"#,
                now.format("%Y-%m-%d %H:%M:%S")
            ),
            Command::TransmitStatusMessages(enabled) => format!(
                r#"<Configure parameter="Transmit Statusmsg">{}</Configure>"#,
                yes_no(*enabled)
            ),
            Command::TransmitResults => {
                r#"<Configure parameter="Transmit Results" grades="No" elements="Yes"></Configure>"#
                    .to_string()
            }
            Command::TransmitSpectra(enabled) => format!(
                r#"<Configure parameter="Transmit Spectra">{}</Configure>"#,
                yes_no(*enabled)
            ),
            Command::Acknowledge { rx_msg_id } => format!(
                r#"<Acknowledge RxMsgID="{}" UserAcked="Yes"></Acknowledge>"#,
                escape(rx_msg_id)
            ),
        };
        format!("{}{}", XML_DECLARATION, body)
    }

    /// Wrap the command in an XML frame.
    pub fn to_frame(&self) -> Frame {
        Frame::xml(&self.to_xml())
    }
}

/// Queries that rebuild the session picture, in the order they are sent.
pub const SESSION_QUERIES: [QueryParameter; 7] = [
    QueryParameter::LoginState,
    QueryParameter::ArmedState,
    QueryParameter::InstrumentDefinition,
    QueryParameter::Version,
    QueryParameter::Applications,
    QueryParameter::ActiveApplication,
    QueryParameter::PhaseTimes,
];

/// [`SESSION_QUERIES`] as commands.
pub fn session_queries() -> Vec<Command> {
    SESSION_QUERIES.iter().copied().map(Command::Query).collect()
}

fn yes_no(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}
