//! Assay lifecycle state machine
//!
//! [`AssayMachine`] is the single writer of [`SessionState`]. It is pure and
//! synchronous: each classified [`Packet`] or user [`Intent`] goes in
//! together with the current wall-clock time, and an [`Output`] holding the
//! commands to send and the events to publish comes out. The driver owns the
//! machine inside its pipeline task and does all the I/O.
//!
//! ```text
//! Idle --Assay/Start--> PhaseRunning(0) --Phase Change--> PhaseRunning(i+1)
//!   ^                                                          |
//!   |                                                    Assay/Complete
//!   |                                                          v
//!   +------ repeats_remaining == 0 ------------------- Completing
//!                                                              |
//!                     repeats_remaining > 0: send Assay Start, PhaseRunning(0)
//! ```
//!
//! Until the analyzer reports Assay/Start for a repeat, a refused start, a
//! disarm or a stop request returns the machine to `Idle`.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, trace, warn};

use crate::ack;
use crate::assay::{Assay, AssayCatalogue, AssayDraft, ResultRow, TemperatureSummary};
use crate::command::{Command, QueryParameter, session_queries};
use crate::correlator::{CorrelationMode, SpectrumCorrelator};
use crate::frame::TypeCode;
use crate::packet::{
    AssayResults, CookedSpectrum, InstrumentReport, Packet, ResponseSummary, SpectrumEnergy,
    StatusChange,
};
use crate::session::{AssayState, SessionState};
use crate::{ProtocolError, Result};

/// Notification published to every subscriber of a connection.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new assay was appended to the catalogue.
    AssayCompleted(Arc<Assay>),
    /// Live spectrum update for the phase currently accumulating.
    SpectrumUpdated {
        phase_index: usize,
        spectrum: CookedSpectrum,
        energy: Option<SpectrumEnergy>,
    },
    /// Instrument error or info report. `blocking` reports need the operator.
    InstrumentMessage { report: InstrumentReport, blocking: bool },
    /// The analyzer refused a command.
    CommandRejected(ResponseSummary),
    /// A frame could not be decoded and was dropped.
    DecodeFailure { type_code: TypeCode, payload: Vec<u8>, error: String },
    /// The session ended; no further events follow.
    Disconnected { reason: String },
}

/// Operator request, checked against the current session before any traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Login,
    StartAssay,
    StopAssay,
    SetApplication { application: String, method: String },
    SetMethod(String),
    SetPhaseTimes(Vec<Duration>),
    SetRepeatCount(u32),
    Refresh,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Login => "Login",
            Intent::StartAssay => "Assay start",
            Intent::StopAssay => "Assay stop",
            Intent::SetApplication { .. } => "Set application",
            Intent::SetMethod(_) => "Set method",
            Intent::SetPhaseTimes(_) => "Set phase times",
            Intent::SetRepeatCount(_) => "Set repeat count",
            Intent::Refresh => "Refresh",
        }
    }
}

/// Commands and events produced by one input.
#[derive(Debug, Default)]
pub struct Output {
    pub commands: Vec<Command>,
    pub events: Vec<EngineEvent>,
}

impl Output {
    fn command(&mut self, command: Command) {
        self.commands.push(command);
    }

    fn query(&mut self, parameter: QueryParameter) {
        self.commands.push(Command::Query(parameter));
    }

    fn event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}

/// Session state, correlator and catalogue driven by packets and intents.
#[derive(Debug)]
pub struct AssayMachine {
    session: SessionState,
    correlator: Box<dyn SpectrumCorrelator>,
    catalogue: AssayCatalogue,
    pending_results: Option<AssayResults>,
    pending_pdz: Option<String>,
    started_at: Option<NaiveDateTime>,
    /// A repeat start was sent and the analyzer has not reported Assay/Start yet.
    repeat_unconfirmed: bool,
}

impl AssayMachine {
    pub fn new(repeats_selected: u32, correlation: CorrelationMode) -> Self {
        Self {
            session: SessionState::new(repeats_selected),
            correlator: correlation.build(),
            catalogue: AssayCatalogue::new(),
            pending_results: None,
            pending_pdz: None,
            started_at: None,
            repeat_unconfirmed: false,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn catalogue(&self) -> &AssayCatalogue {
        &self.catalogue
    }

    /// Number of phases buffered for the assay in progress.
    pub fn buffered_phases(&self) -> usize {
        self.correlator.phase_count()
    }

    /// Apply one classified packet.
    pub fn handle_packet(&mut self, packet: Packet, now: NaiveDateTime) -> Output {
        let mut out = Output::default();
        debug!(packet = packet.kind(), "Handling packet");

        match packet {
            Packet::XmlSuccessResponse(summary) => self.on_success(&summary, &mut out),
            Packet::XmlFailureResponse(summary) => {
                warn!(
                    parameter = summary.parameter.as_deref().unwrap_or("-"),
                    status = %summary.status,
                    message = %summary.message,
                    "Analyzer rejected command"
                );
                if summary.concerns("Assay Start") || summary.concerns("Assay") {
                    self.abandon_repeat("start refused");
                }
                out.event(EngineEvent::CommandRejected(summary));
            }
            Packet::XmlLoginState(logged_in) => {
                if logged_in != self.session.is_logged_in {
                    info!(logged_in, "Login state changed");
                }
                self.session.is_logged_in = logged_in;
            }
            Packet::XmlArmedState(armed) => self.apply_armed(armed),
            Packet::XmlInstrumentDefinition(definition) => {
                info!(
                    serial = definition.serial_number.as_deref().unwrap_or("-"),
                    model = definition.model.as_deref().unwrap_or("-"),
                    "Instrument identified"
                );
                self.session.instrument = Some(definition);
            }
            Packet::XmlApplicationsList(applications) => {
                self.session.available_applications = applications;
                out.query(QueryParameter::ActiveApplication);
            }
            Packet::XmlActiveApplication(active) => {
                self.session.current_application = Some(active.application);
                self.session.current_method = active.active_method;
                self.session.available_methods = active.methods;
            }
            Packet::XmlPhaseTimes(phases) => {
                debug!(phases = phases.len(), "Phase times updated");
                self.session.phase_definitions = phases;
            }
            Packet::XmlVersion(version) => self.session.software_version = Some(version),
            Packet::XmlNoseTemperature(celsius) => self.session.nose_temperature_c = Some(celsius),
            Packet::StatusChange(change) => self.on_status(change, now, &mut out),
            Packet::AssayResults(results) => {
                if let Some(error) = &results.error {
                    warn!(error = %error, "Analyzer reported a calculation error");
                }
                debug!(rows = results.rows.len(), "Assay results received");
                self.pending_results = Some(results);
            }
            Packet::SpectrumEnergy(energy) => self.correlator.on_spectrum_energy(energy),
            Packet::CookedSpectrum(spectrum) => {
                let (energy, spectrum) = self.correlator.on_cooked_spectrum(spectrum);
                let phase_index = self.correlator.phase_count().saturating_sub(1);
                trace!(
                    phase = phase_index,
                    sequence = spectrum.accumulation_sequence,
                    "Spectrum updated"
                );
                out.event(EngineEvent::SpectrumUpdated { phase_index, spectrum, energy });
            }
            Packet::PdzFilename(name) => {
                debug!(file = %name, "Analyzer stored assay file");
                self.pending_pdz = Some(name);
            }
            Packet::ErrorReport(report) | Packet::InfoReport(report) => {
                let blocking = !report.user_ackable;
                if let Some(command) = ack::acknowledge(&report) {
                    out.command(command);
                }
                out.event(EngineEvent::InstrumentMessage { report, blocking });
            }
            Packet::XmlGeneric(node) => debug!(root = %node.name, "Unrecognised XML message"),
            Packet::Unknown { type_code, payload } => {
                trace!(type_code = %type_code, len = payload.len(), "Ignoring opaque frame");
            }
        }

        out
    }

    /// Check an intent against the session and return the commands it sends.
    ///
    /// A rejected intent changes nothing and sends nothing.
    pub fn handle_intent(&mut self, intent: Intent) -> Result<Vec<Command>> {
        let commands = match intent {
            Intent::Login => vec![Command::Login],
            Intent::StartAssay => {
                self.session.check_can_start_assay()?;
                info!(repeats = self.session.repeats_selected, "Requesting assay start");
                vec![Command::StartAssay]
            }
            Intent::StopAssay => {
                self.session.repeats_remaining = 0;
                self.abandon_repeat("stop requested");
                info!("Requesting assay stop");
                vec![Command::StopAssay]
            }
            Intent::SetApplication { application, method } => {
                self.check_idle("Set application")?;
                let known = &self.session.available_applications;
                if !known.is_empty() && !known.iter().any(|a| a == &application) {
                    return Err(ProtocolError::precondition(
                        "Set application",
                        format!("unknown application '{}'", application),
                    ));
                }
                vec![Command::ConfigureApplication { application, method }]
            }
            Intent::SetMethod(method) => {
                self.check_idle("Set method")?;
                if self.session.current_application.is_none() {
                    return Err(ProtocolError::precondition("Set method", "no application is active"));
                }
                vec![Command::ConfigureMethod { method }]
            }
            Intent::SetPhaseTimes(durations) => {
                self.check_idle("Set phase times")?;
                let phases = self.session.phase_definitions.len();
                if phases == 0 || durations.len() != phases {
                    return Err(ProtocolError::precondition(
                        "Set phase times",
                        format!("{} durations given for {} phases", durations.len(), phases),
                    ));
                }
                vec![Command::ConfigurePhaseTimes { durations }]
            }
            Intent::SetRepeatCount(count) => {
                if count < 1 {
                    return Err(ProtocolError::precondition(
                        "Set repeat count",
                        "at least one assay per run is required",
                    ));
                }
                self.session.repeats_selected = count;
                Vec::new()
            }
            Intent::Refresh => session_queries(),
        };
        Ok(commands)
    }

    fn check_idle(&self, operation: &str) -> Result<()> {
        if self.session.assay_running {
            return Err(ProtocolError::precondition(operation, "an assay is in progress"));
        }
        Ok(())
    }

    fn apply_armed(&mut self, armed: bool) {
        if armed != self.session.is_armed {
            info!(armed, "Armed state changed");
        }
        self.session.set_armed(armed);
        if !armed {
            self.abandon_repeat("analyzer disarmed");
        }
    }

    /// Return to idle when a queued repeat start never took effect.
    fn abandon_repeat(&mut self, reason: &str) {
        if !self.repeat_unconfirmed {
            return;
        }
        self.repeat_unconfirmed = false;
        self.session.repeats_remaining = 0;
        self.started_at = None;
        self.session.set_assay_state(AssayState::Idle);
        warn!(reason, "Repeat assay abandoned");
    }

    fn on_success(&mut self, summary: &ResponseSummary, out: &mut Output) {
        if summary.concerns("Login") {
            info!("Login accepted");
            out.query(QueryParameter::LoginState);
            out.query(QueryParameter::ArmedState);
        } else if summary.concerns("Application") || summary.concerns("Method") {
            out.query(QueryParameter::ActiveApplication);
            out.query(QueryParameter::PhaseTimes);
        } else if summary.concerns("Phase Times") {
            out.query(QueryParameter::PhaseTimes);
        } else {
            debug!(
                parameter = summary.parameter.as_deref().unwrap_or("-"),
                message = %summary.message,
                "Command acknowledged"
            );
        }
    }

    fn on_status(&mut self, change: StatusChange, now: NaiveDateTime, out: &mut Output) {
        match change {
            StatusChange::AssayStart => self.on_assay_start(now),
            StatusChange::PhaseChange { phase_number } => self.on_phase_change(phase_number),
            StatusChange::AssayComplete => self.on_assay_complete(now, out),
            StatusChange::Armed(armed) => self.apply_armed(armed),
            StatusChange::Other { parameter, value } => {
                debug!(parameter = %parameter, value = %value, "Unhandled status");
            }
        }
    }

    fn on_assay_start(&mut self, now: NaiveDateTime) {
        self.repeat_unconfirmed = false;
        if self.session.assay_state == AssayState::Idle {
            self.correlator.clear();
            self.pending_results = None;
            self.pending_pdz = None;
            self.started_at = Some(now);
            self.session.repeats_remaining = self.session.repeats_selected.saturating_sub(1);
            info!(
                application = self.session.current_application.as_deref().unwrap_or("-"),
                repeats_remaining = self.session.repeats_remaining,
                "Assay started"
            );
        } else {
            debug!(state = ?self.session.assay_state, "Assay start while running, restarting phase 0");
        }
        self.session.set_assay_state(AssayState::PhaseRunning { phase_index: 0 });
    }

    fn on_phase_change(&mut self, phase_number: Option<u32>) {
        match self.session.assay_state {
            AssayState::PhaseRunning { phase_index } => {
                let next = phase_index + 1;
                debug!(phase = next, reported = ?phase_number, "Phase changed");
                self.session.set_assay_state(AssayState::PhaseRunning { phase_index: next });
            }
            state => warn!(state = ?state, "Phase change outside a running assay, ignored"),
        }
    }

    fn on_assay_complete(&mut self, now: NaiveDateTime, out: &mut Output) {
        if self.session.assay_state == AssayState::Idle {
            warn!("Assay complete without a start, recording it anyway");
        }
        self.session.set_assay_state(AssayState::Completing);

        let buffers = self.correlator.take();
        let result_rows = match self.pending_results.take() {
            Some(results) if !results.rows.is_empty() => results.rows,
            _ => vec![ResultRow::no_results()],
        };
        let per_phase_legends =
            (0..buffers.spectra.len()).map(|index| self.session.phase_legend(index)).collect();
        let elapsed_duration = self
            .started_at
            .take()
            .and_then(|started| (now - started).to_std().ok())
            .unwrap_or_default();

        let draft = AssayDraft {
            date_completed: now.date(),
            time_completed: now.time(),
            elapsed_duration,
            total_set_duration: Duration::from_secs(self.session.total_set_duration_seconds()),
            application: self.session.current_application.clone(),
            method: self.session.current_method.clone(),
            result_rows,
            temperatures: TemperatureSummary::from_spectra(
                &buffers.spectra,
                self.session.nose_temperature_c,
            ),
            per_phase_spectra: buffers.spectra,
            per_phase_energies: buffers.energies,
            per_phase_legends,
            pdz_filename: self.pending_pdz.take(),
        };
        let assay = self.catalogue.append(draft);
        info!(
            sequence_index = assay.sequence_index,
            phases = assay.per_phase_spectra.len(),
            has_results = assay.has_results(),
            "Assay complete"
        );
        out.event(EngineEvent::AssayCompleted(assay));

        if self.session.repeats_remaining > 0 {
            self.session.repeats_remaining -= 1;
            info!(repeats_remaining = self.session.repeats_remaining, "Starting repeat assay");
            self.started_at = Some(now);
            out.command(Command::StartAssay);
            self.repeat_unconfirmed = true;
            self.session.set_assay_state(AssayState::PhaseRunning { phase_index: 0 });
        } else {
            self.session.set_assay_state(AssayState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ActiveApplication, ReportKind};
    use crate::test_utils::{cooked_spectrum, energy, three_phases, timestamp};
    use proptest::prelude::*;

    fn machine() -> AssayMachine {
        let mut machine = AssayMachine::new(1, CorrelationMode::Positional);
        machine.session.phase_definitions = three_phases();
        machine.session.current_application = Some("GeoExploration".into());
        machine.session.current_method = Some("Oxide3Phase".into());
        machine
    }

    fn status(change: StatusChange) -> Packet {
        Packet::StatusChange(change)
    }

    fn phase_change() -> Packet {
        status(StatusChange::PhaseChange { phase_number: None })
    }

    fn feed_phase(machine: &mut AssayMachine, updates: u32) {
        let now = timestamp(10, 0, 0);
        for sequence in 1..=updates {
            machine.handle_packet(Packet::SpectrumEnergy(energy(sequence as i32)), now);
            machine.handle_packet(Packet::CookedSpectrum(cooked_spectrum(sequence, sequence)), now);
        }
    }

    fn start_commands(out: &Output) -> usize {
        out.commands.iter().filter(|c| **c == Command::StartAssay).count()
    }

    fn iron_results() -> Packet {
        Packet::AssayResults(AssayResults {
            rows: vec![ResultRow {
                atomic_number: 26,
                compound_label: "Fe".into(),
                concentration_percent: 12.5,
                error_one_sigma: 0.1,
            }],
            error: None,
        })
    }

    #[test]
    fn three_phase_assay_walks_every_state() {
        let mut machine = machine();
        let mut states = vec![machine.session().assay_state];

        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        states.push(machine.session().assay_state);
        feed_phase(&mut machine, 3);

        for _ in 0..2 {
            machine.handle_packet(phase_change(), timestamp(10, 0, 20));
            states.push(machine.session().assay_state);
            feed_phase(&mut machine, 2);
        }

        machine.handle_packet(iron_results(), timestamp(10, 0, 41));
        let out = machine.handle_packet(status(StatusChange::AssayComplete), timestamp(10, 0, 41));
        states.push(machine.session().assay_state);

        assert_eq!(
            states,
            vec![
                AssayState::Idle,
                AssayState::PhaseRunning { phase_index: 0 },
                AssayState::PhaseRunning { phase_index: 1 },
                AssayState::PhaseRunning { phase_index: 2 },
                AssayState::Idle,
            ]
        );
        assert!(out.commands.is_empty());

        assert_eq!(machine.catalogue().len(), 1);
        let assay = machine.catalogue().latest().unwrap();
        assert_eq!(assay.sequence_index, 1);
        assert_eq!(assay.per_phase_spectra.len(), 3);
        assert_eq!(assay.per_phase_energies.len(), 3);
        assert_eq!(assay.per_phase_legends[2], "Phase 3: Light (10s)");
        assert_eq!(assay.elapsed_duration, Duration::from_secs(41));
        assert_eq!(assay.total_set_duration, Duration::from_secs(40));
        assert_eq!(assay.application.as_deref(), Some("GeoExploration"));
        assert!(assay.has_results());
        assert_eq!(machine.buffered_phases(), 0);
        assert!(matches!(out.events.as_slice(), [EngineEvent::AssayCompleted(_)]));
    }

    #[test]
    fn repeats_issue_follow_up_starts() {
        let mut machine = machine();
        machine.session.repeats_selected = 3;
        let mut follow_ups = 0;

        for run in 0..3 {
            machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, run, 0));
            feed_phase(&mut machine, 2);
            let out = machine.handle_packet(status(StatusChange::AssayComplete), timestamp(10, run, 30));
            follow_ups += start_commands(&out);
        }

        assert_eq!(follow_ups, 2);
        assert_eq!(machine.session().assay_state, AssayState::Idle);
        assert_eq!(machine.session().repeats_remaining, 0);
        assert_eq!(machine.catalogue().len(), 3);
        let indices: Vec<u64> = machine.catalogue().iter().map(|a| a.sequence_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn stop_cancels_remaining_repeats() {
        let mut machine = machine();
        machine.session.repeats_selected = 3;
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        assert_eq!(machine.session().repeats_remaining, 2);

        let commands = machine.handle_intent(Intent::StopAssay).unwrap();
        assert_eq!(commands, vec![Command::StopAssay]);
        assert_eq!(machine.session().repeats_remaining, 0);

        let out = machine.handle_packet(status(StatusChange::AssayComplete), timestamp(10, 0, 5));
        assert_eq!(start_commands(&out), 0);
        assert_eq!(machine.session().assay_state, AssayState::Idle);
    }

    fn repeat_pending_machine() -> AssayMachine {
        let mut machine = machine();
        machine.session.repeats_selected = 3;
        machine.handle_packet(status(StatusChange::Armed(true)), timestamp(10, 0, 0));
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        let out = machine.handle_packet(status(StatusChange::AssayComplete), timestamp(10, 0, 30));
        assert_eq!(start_commands(&out), 1);
        assert!(machine.session().assay_running);
        machine
    }

    #[test]
    fn refused_repeat_start_returns_to_idle() {
        let mut machine = repeat_pending_machine();
        let out = machine.handle_packet(
            Packet::XmlFailureResponse(ResponseSummary {
                parameter: Some("Assay Start".into()),
                status: "failure".into(),
                message: "Instrument not ready".into(),
            }),
            timestamp(10, 0, 31),
        );
        assert!(matches!(out.events.as_slice(), [EngineEvent::CommandRejected(_)]));
        assert_eq!(machine.session().assay_state, AssayState::Idle);
        assert!(!machine.session().assay_running);
        assert_eq!(machine.session().repeats_remaining, 0);
        assert!(machine.handle_intent(Intent::SetMethod("Oxide3Phase".into())).is_ok());
    }

    #[test]
    fn disarm_before_repeat_starts_returns_to_idle() {
        let mut machine = repeat_pending_machine();
        machine.handle_packet(status(StatusChange::Armed(false)), timestamp(10, 0, 31));
        assert_eq!(machine.session().assay_state, AssayState::Idle);
        assert_eq!(machine.session().repeats_remaining, 0);
    }

    #[test]
    fn stop_before_repeat_starts_returns_to_idle() {
        let mut machine = repeat_pending_machine();
        assert_eq!(machine.handle_intent(Intent::StopAssay).unwrap(), vec![Command::StopAssay]);
        assert_eq!(machine.session().assay_state, AssayState::Idle);
        assert!(machine.handle_intent(Intent::SetPhaseTimes(vec![Duration::from_secs(5); 3])).is_ok());
    }

    #[test]
    fn confirmed_repeat_survives_disarm_until_complete() {
        let mut machine = repeat_pending_machine();
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 31));
        machine.handle_packet(status(StatusChange::Armed(false)), timestamp(10, 0, 32));
        assert_eq!(machine.session().assay_state, AssayState::PhaseRunning { phase_index: 0 });
        assert_eq!(machine.session().repeats_remaining, 1);
    }

    #[test]
    fn restart_while_running_keeps_repeat_count() {
        let mut machine = machine();
        machine.session.repeats_selected = 2;
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        machine.handle_packet(phase_change(), timestamp(10, 0, 20));
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 21));
        assert_eq!(machine.session().assay_state, AssayState::PhaseRunning { phase_index: 0 });
        assert_eq!(machine.session().repeats_remaining, 1);
    }

    #[test]
    fn missing_results_become_placeholder_row() {
        let mut machine = machine();
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        feed_phase(&mut machine, 1);
        machine.handle_packet(
            Packet::AssayResults(AssayResults { rows: vec![], error: Some("Calculation failed".into()) }),
            timestamp(10, 0, 20),
        );
        machine.handle_packet(status(StatusChange::AssayComplete), timestamp(10, 0, 20));

        let assay = machine.catalogue().latest().unwrap();
        assert_eq!(assay.result_rows, vec![ResultRow::no_results()]);
        assert!(!assay.has_results());
    }

    #[test]
    fn pdz_filename_attaches_to_assay() {
        let mut machine = machine();
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        machine.handle_packet(Packet::PdzFilename("00017-GeoExploration.pdz".into()), timestamp(10, 0, 9));
        machine.handle_packet(status(StatusChange::AssayComplete), timestamp(10, 0, 10));
        let assay = machine.catalogue().latest().unwrap();
        assert_eq!(assay.pdz_filename.as_deref(), Some("00017-GeoExploration.pdz"));
    }

    #[test]
    fn start_from_idle_discards_stale_buffers() {
        let mut machine = machine();
        feed_phase(&mut machine, 2);
        machine.handle_packet(iron_results(), timestamp(9, 59, 0));
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        assert_eq!(machine.buffered_phases(), 0);
        machine.handle_packet(status(StatusChange::AssayComplete), timestamp(10, 0, 1));
        assert!(!machine.catalogue().latest().unwrap().has_results());
    }

    #[test]
    fn start_intent_requires_armed_and_logged_in() {
        let mut machine = machine();
        let before = machine.session().clone();

        let err = machine.handle_intent(Intent::StartAssay).unwrap_err();
        assert!(matches!(err, ProtocolError::Precondition { .. }));
        assert_eq!(machine.session(), &before);

        machine.handle_packet(Packet::XmlArmedState(true), timestamp(10, 0, 0));
        assert_eq!(machine.handle_intent(Intent::StartAssay).unwrap(), vec![Command::StartAssay]);
    }

    #[test]
    fn armed_status_couples_login() {
        let mut machine = machine();
        machine.handle_packet(status(StatusChange::Armed(true)), timestamp(10, 0, 0));
        assert!(machine.session().is_armed && machine.session().is_logged_in);
        machine.handle_packet(status(StatusChange::Armed(false)), timestamp(10, 0, 1));
        assert!(!machine.session().is_armed && !machine.session().is_logged_in);
    }

    #[test]
    fn ackable_report_is_acknowledged_once() {
        let mut machine = machine();
        let report = InstrumentReport {
            kind: ReportKind::Error,
            tx_msg_id: "42".into(),
            user_ackable: true,
            message: "Tube over temperature".into(),
        };
        let out = machine.handle_packet(Packet::ErrorReport(report), timestamp(10, 0, 0));
        assert_eq!(out.commands, vec![Command::Acknowledge { rx_msg_id: "42".into() }]);
        assert!(matches!(
            out.events.as_slice(),
            [EngineEvent::InstrumentMessage { blocking: false, .. }]
        ));
    }

    #[test]
    fn unackable_report_is_blocking_on_every_retransmission() {
        let mut machine = machine();
        let report = InstrumentReport {
            kind: ReportKind::Error,
            tx_msg_id: "43".into(),
            user_ackable: false,
            message: "Interlock open".into(),
        };
        for _ in 0..2 {
            let out = machine.handle_packet(Packet::ErrorReport(report.clone()), timestamp(10, 0, 0));
            assert!(out.commands.is_empty());
            assert!(matches!(
                out.events.as_slice(),
                [EngineEvent::InstrumentMessage { blocking: true, .. }]
            ));
        }
    }

    #[test]
    fn success_responses_chain_follow_up_queries() {
        let mut machine = machine();
        let response = |parameter: Option<&str>, message: &str| {
            Packet::XmlSuccessResponse(ResponseSummary {
                parameter: parameter.map(str::to_string),
                status: "success".into(),
                message: message.into(),
            })
        };

        let out = machine.handle_packet(response(None, "Login"), timestamp(10, 0, 0));
        assert_eq!(
            out.commands,
            vec![
                Command::Query(QueryParameter::LoginState),
                Command::Query(QueryParameter::ArmedState)
            ]
        );

        let out = machine.handle_packet(response(Some("Application"), ""), timestamp(10, 0, 0));
        assert_eq!(
            out.commands,
            vec![
                Command::Query(QueryParameter::ActiveApplication),
                Command::Query(QueryParameter::PhaseTimes)
            ]
        );

        let out = machine.handle_packet(response(Some("Method"), ""), timestamp(10, 0, 0));
        assert_eq!(out.commands.len(), 2);

        let out = machine.handle_packet(response(Some("Phase Times"), ""), timestamp(10, 0, 0));
        assert_eq!(out.commands, vec![Command::Query(QueryParameter::PhaseTimes)]);

        let out = machine.handle_packet(response(Some("Transmit Spectra"), ""), timestamp(10, 0, 0));
        assert!(out.commands.is_empty());
    }

    #[test]
    fn applications_list_queries_active_application() {
        let mut machine = machine();
        let out = machine.handle_packet(
            Packet::XmlApplicationsList(vec!["GeoExploration".into(), "Mining".into()]),
            timestamp(10, 0, 0),
        );
        assert_eq!(out.commands, vec![Command::Query(QueryParameter::ActiveApplication)]);
        assert_eq!(machine.session().available_applications.len(), 2);

        machine.handle_packet(
            Packet::XmlActiveApplication(ActiveApplication {
                application: "Mining".into(),
                active_method: Some("Cu/Zn".into()),
                methods: vec!["Cu/Zn".into(), "Precious".into()],
            }),
            timestamp(10, 0, 0),
        );
        assert_eq!(machine.session().current_application.as_deref(), Some("Mining"));
        assert_eq!(machine.session().available_methods.len(), 2);
    }

    #[test]
    fn configuration_intents_are_guarded() {
        let mut machine = machine();

        assert!(matches!(
            machine.handle_intent(Intent::SetRepeatCount(0)),
            Err(ProtocolError::Precondition { .. })
        ));
        assert!(machine.handle_intent(Intent::SetRepeatCount(4)).unwrap().is_empty());
        assert_eq!(machine.session().repeats_selected, 4);

        assert!(machine.handle_intent(Intent::SetPhaseTimes(vec![Duration::from_secs(5)])).is_err());
        let durations = vec![Duration::from_secs(30); 3];
        assert_eq!(
            machine.handle_intent(Intent::SetPhaseTimes(durations.clone())).unwrap(),
            vec![Command::ConfigurePhaseTimes { durations }]
        );

        machine.session.current_application = None;
        assert!(machine.handle_intent(Intent::SetMethod("Oxide3Phase".into())).is_err());

        machine.session.available_applications = vec!["GeoExploration".into()];
        assert!(
            machine
                .handle_intent(Intent::SetApplication {
                    application: "Alloys".into(),
                    method: "Default".into()
                })
                .is_err()
        );
    }

    #[test]
    fn configuration_is_refused_during_an_assay() {
        let mut machine = machine();
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        let err = machine.handle_intent(Intent::SetMethod("Oxide3Phase".into())).unwrap_err();
        assert!(err.to_string().contains("in progress"));
    }

    #[test]
    fn refresh_reissues_session_queries() {
        let mut machine = machine();
        let commands = machine.handle_intent(Intent::Refresh).unwrap();
        assert_eq!(commands, session_queries());
    }

    #[test]
    fn spectrum_updates_are_published_per_phase() {
        let mut machine = machine();
        machine.handle_packet(status(StatusChange::AssayStart), timestamp(10, 0, 0));
        machine.handle_packet(Packet::SpectrumEnergy(energy(1)), timestamp(10, 0, 1));
        let out = machine.handle_packet(Packet::CookedSpectrum(cooked_spectrum(1, 5)), timestamp(10, 0, 1));
        match out.events.as_slice() {
            [EngineEvent::SpectrumUpdated { phase_index, spectrum, energy }] => {
                assert_eq!(*phase_index, 0);
                assert_eq!(spectrum.counts[0], 5);
                assert!(energy.is_some());
            }
            other => panic!("Expected one spectrum update, got {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn any_repeat_count_yields_that_many_assays(repeats in 1u32..6) {
            let mut machine = machine();
            machine.session.repeats_selected = repeats;
            let mut follow_ups = 0;
            for run in 0..repeats {
                machine.handle_packet(status(StatusChange::AssayStart), timestamp(11, run, 0));
                let out = machine.handle_packet(status(StatusChange::AssayComplete), timestamp(11, run, 20));
                follow_ups += start_commands(&out);
            }
            prop_assert_eq!(follow_ups as u32, repeats - 1);
            prop_assert_eq!(machine.catalogue().len() as u32, repeats);
            prop_assert_eq!(machine.session().assay_state, AssayState::Idle);
        }
    }
}
