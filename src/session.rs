//! Instrument session state
//!
//! [`SessionState`] is the authoritative record of what the client knows about
//! the analyzer: login and armed status, the active application and method,
//! the phase configuration and the assay progress. It has exactly one writer,
//! the pipeline's [`crate::machine::AssayMachine`]; everyone else receives
//! `Arc<SessionState>` snapshots.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

/// One timed phase of the active application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub number: u32,
    pub name: String,
    pub duration_seconds: u32,
}

impl PhaseDefinition {
    /// Legend used for spectra recorded in this phase.
    pub fn legend(&self) -> String {
        if self.name.is_empty() {
            format!("Phase {} ({}s)", self.number, self.duration_seconds)
        } else {
            format!("Phase {}: {} ({}s)", self.number, self.name, self.duration_seconds)
        }
    }
}

/// Identity reported in the instrument definition response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
}

/// Position in the assay lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssayState {
    #[default]
    Idle,
    PhaseRunning {
        phase_index: usize,
    },
    Completing,
}

impl AssayState {
    /// Whether an assay is in progress.
    pub fn is_running(self) -> bool {
        matches!(self, AssayState::PhaseRunning { .. } | AssayState::Completing)
    }
}

/// Everything the client tracks about the connected analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub is_logged_in: bool,
    pub is_armed: bool,
    pub current_application: Option<String>,
    pub current_method: Option<String>,
    pub available_applications: Vec<String>,
    pub available_methods: Vec<String>,
    pub phase_definitions: Vec<PhaseDefinition>,
    pub current_phase_index: Option<usize>,
    pub assay_running: bool,
    pub assay_state: AssayState,
    pub repeats_selected: u32,
    pub repeats_remaining: u32,
    pub instrument: Option<InstrumentDefinition>,
    pub software_version: Option<String>,
    pub nose_temperature_c: Option<f32>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SessionState {
    /// Fresh state for a new connection
    pub fn new(repeats_selected: u32) -> Self {
        Self {
            is_logged_in: false,
            is_armed: false,
            current_application: None,
            current_method: None,
            available_applications: Vec::new(),
            available_methods: Vec::new(),
            phase_definitions: Vec::new(),
            current_phase_index: None,
            assay_running: false,
            assay_state: AssayState::Idle,
            repeats_selected: repeats_selected.max(1),
            repeats_remaining: 0,
            instrument: None,
            software_version: None,
            nose_temperature_c: None,
        }
    }

    /// Apply an armed-state report.
    ///
    /// Disarming on some firmware logs the user out, and arming is never
    /// followed by a separate login announcement.
    pub fn set_armed(&mut self, armed: bool) {
        self.is_armed = armed;
        self.is_logged_in = armed;
    }

    /// Move the assay lifecycle and keep the derived flags consistent.
    pub fn set_assay_state(&mut self, state: AssayState) {
        self.assay_state = state;
        self.assay_running = state.is_running();
        self.current_phase_index = match state {
            AssayState::PhaseRunning { phase_index } => Some(phase_index),
            AssayState::Completing => self.current_phase_index,
            AssayState::Idle => None,
        };
    }

    /// Sum of all configured phase durations in seconds.
    pub fn total_set_duration_seconds(&self) -> u64 {
        self.phase_definitions.iter().map(|p| u64::from(p.duration_seconds)).sum()
    }

    /// Legend for the phase at `index`, falling back to a generic label.
    pub fn phase_legend(&self, index: usize) -> String {
        self.phase_definitions
            .get(index)
            .map(PhaseDefinition::legend)
            .unwrap_or_else(|| format!("Phase {}", index + 1))
    }

    /// Check the guard for starting an assay.
    pub fn check_can_start_assay(&self) -> Result<()> {
        if !self.is_logged_in {
            return Err(ProtocolError::precondition("Assay start", "analyzer is not logged in"));
        }
        if !self.is_armed {
            return Err(ProtocolError::precondition("Assay start", "analyzer is not armed"));
        }
        Ok(())
    }

    /// Human readable one-line status for coarse status displays.
    pub fn status_line(&self) -> String {
        let phase = match self.assay_state {
            AssayState::Idle => "idle".to_string(),
            AssayState::PhaseRunning { phase_index } => {
                format!("phase {}/{}", phase_index + 1, self.phase_definitions.len().max(1))
            }
            AssayState::Completing => "completing".to_string(),
        };
        format!(
            "{} | {} | {} / {} | {}",
            if self.is_logged_in { "logged in" } else { "logged out" },
            if self.is_armed { "armed" } else { "disarmed" },
            self.current_application.as_deref().unwrap_or("-"),
            self.current_method.as_deref().unwrap_or("-"),
            phase
        )
    }
}
