//! Completed assay records and the append-only catalogue

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::packet::{CookedSpectrum, SpectrumEnergy};

/// Label of the placeholder row used when no results arrived for an assay.
pub const NO_RESULTS_LABEL: &str = "No Results";

/// One element or compound line of an assay result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub atomic_number: u32,
    pub compound_label: String,
    pub concentration_percent: f64,
    pub error_one_sigma: f64,
}

impl ResultRow {
    /// Placeholder for assays whose results never arrived (e.g. calculation error).
    pub fn no_results() -> Self {
        Self {
            atomic_number: 0,
            compound_label: NO_RESULTS_LABEL.to_string(),
            concentration_percent: 0.0,
            error_one_sigma: 0.0,
        }
    }

    /// Whether this row is the no-results placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.atomic_number == 0 && self.compound_label == NO_RESULTS_LABEL
    }
}

/// Temperatures observed during an assay, as raw instrument readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSummary {
    /// Detector reading from the last spectrum of each phase.
    pub detector_raw: Vec<i32>,
    /// Ambient reading from the last spectrum of each phase.
    pub ambient_raw: Vec<i32>,
    /// Last nose temperature reported by the instrument.
    pub nose_c: Option<f32>,
}

impl TemperatureSummary {
    /// Collect per-phase readings from the final spectra of an assay.
    pub fn from_spectra(spectra: &[CookedSpectrum], nose_c: Option<f32>) -> Self {
        Self {
            detector_raw: spectra.iter().map(|s| s.detector_temp_raw).collect(),
            ambient_raw: spectra.iter().map(|s| s.ambient_temp_raw).collect(),
            nose_c,
        }
    }
}

/// A completed measurement. Immutable once appended to the catalogue.
#[derive(Debug, Clone, PartialEq)]
pub struct Assay {
    /// Client-side index, starting at 1 and never reused.
    pub sequence_index: u64,
    pub date_completed: NaiveDate,
    pub time_completed: NaiveTime,
    pub elapsed_duration: Duration,
    pub total_set_duration: Duration,
    pub application: Option<String>,
    pub method: Option<String>,
    pub result_rows: Vec<ResultRow>,
    pub per_phase_spectra: Vec<CookedSpectrum>,
    pub per_phase_energies: Vec<SpectrumEnergy>,
    pub per_phase_legends: Vec<String>,
    pub temperatures: TemperatureSummary,
    /// File name the instrument reported for its own copy of the assay.
    pub pdz_filename: Option<String>,
}

impl Assay {
    /// Whether the instrument delivered results for this assay.
    pub fn has_results(&self) -> bool {
        !self.result_rows.iter().all(ResultRow::is_placeholder)
    }

    /// Result row for an element, if reported.
    pub fn row_for(&self, atomic_number: u32) -> Option<&ResultRow> {
        self.result_rows.iter().find(|row| row.atomic_number == atomic_number)
    }
}

/// Everything needed to build an [`Assay`] except its index.
#[derive(Debug, Clone)]
pub struct AssayDraft {
    pub date_completed: NaiveDate,
    pub time_completed: NaiveTime,
    pub elapsed_duration: Duration,
    pub total_set_duration: Duration,
    pub application: Option<String>,
    pub method: Option<String>,
    pub result_rows: Vec<ResultRow>,
    pub per_phase_spectra: Vec<CookedSpectrum>,
    pub per_phase_energies: Vec<SpectrumEnergy>,
    pub per_phase_legends: Vec<String>,
    pub temperatures: TemperatureSummary,
    pub pdz_filename: Option<String>,
}

/// Append-only list of completed assays.
#[derive(Debug, Clone, Default)]
pub struct AssayCatalogue {
    assays: Vec<Arc<Assay>>,
    last_index: u64,
}

impl AssayCatalogue {
    /// Create an empty catalogue
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next index to `draft` and append it.
    pub fn append(&mut self, draft: AssayDraft) -> Arc<Assay> {
        self.last_index += 1;
        let assay = Arc::new(Assay {
            sequence_index: self.last_index,
            date_completed: draft.date_completed,
            time_completed: draft.time_completed,
            elapsed_duration: draft.elapsed_duration,
            total_set_duration: draft.total_set_duration,
            application: draft.application,
            method: draft.method,
            result_rows: draft.result_rows,
            per_phase_spectra: draft.per_phase_spectra,
            per_phase_energies: draft.per_phase_energies,
            per_phase_legends: draft.per_phase_legends,
            temperatures: draft.temperatures,
            pdz_filename: draft.pdz_filename,
        });
        self.assays.push(Arc::clone(&assay));
        assay
    }

    /// Assay by its sequence index.
    pub fn get(&self, sequence_index: u64) -> Option<&Arc<Assay>> {
        // Indices are dense from 1, so position is index - 1.
        let position = usize::try_from(sequence_index.checked_sub(1)?).ok()?;
        self.assays.get(position)
    }

    /// Most recently completed assay.
    pub fn latest(&self) -> Option<&Arc<Assay>> {
        self.assays.last()
    }

    pub fn len(&self) -> usize {
        self.assays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Assay>> {
        self.assays.iter()
    }
}
