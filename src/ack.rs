//! Acknowledgment of instrument error and info reports
//!
//! An acknowledgeable report must be answered with exactly one
//! `Acknowledge` command echoing its transmission id. A report that is not
//! acknowledgeable is never answered; it describes a condition the operator
//! has to clear on the analyzer, so it is surfaced as blocking instead.

use tracing::{info, warn};

use crate::command::Command;
use crate::packet::InstrumentReport;

/// Command answering `report`, if the analyzer accepts an acknowledgment.
pub fn acknowledge(report: &InstrumentReport) -> Option<Command> {
    if report.user_ackable {
        info!(
            kind = %report.kind,
            tx_msg_id = %report.tx_msg_id,
            message = %report.message,
            "Acknowledging instrument report"
        );
        Some(Command::Acknowledge { rx_msg_id: report.tx_msg_id.clone() })
    } else {
        warn!(
            kind = %report.kind,
            tx_msg_id = %report.tx_msg_id,
            message = %report.message,
            "Instrument report needs operator attention"
        );
        None
    }
}
