//! Spectrum/energy correlation across phases
//!
//! During an assay the analyzer streams two independent binary packets: a
//! [`SpectrumEnergy`] calibration followed by a [`CookedSpectrum`] update.
//! A correlator collects both into per-phase buffers.
//!
//! [`PositionalCorrelator`] is the default and mirrors observed instrument
//! behaviour: pairing is purely by arrival order. [`MatchedCorrelator`] pairs
//! an energy with a spectrum only when the energy's `packet_count` equals the
//! spectrum's accumulation sequence number, and falls back to positional
//! pairing otherwise. Callers only see the [`SpectrumCorrelator`] trait.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::packet::{CookedSpectrum, SpectrumEnergy};

/// Per-phase buffers handed over when an assay completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseBuffers {
    pub spectra: Vec<CookedSpectrum>,
    pub energies: Vec<SpectrumEnergy>,
}

/// Correlation strategy selected in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    #[default]
    Positional,
    Matched,
}

impl CorrelationMode {
    /// Build the correlator for this mode.
    pub fn build(self) -> Box<dyn SpectrumCorrelator> {
        match self {
            CorrelationMode::Positional => Box::new(PositionalCorrelator::new()),
            CorrelationMode::Matched => Box::new(MatchedCorrelator::new()),
        }
    }
}

/// Accumulates spectra and their energy calibrations per phase.
pub trait SpectrumCorrelator: Send + std::fmt::Debug {
    /// Record an energy calibration.
    fn on_spectrum_energy(&mut self, energy: SpectrumEnergy);

    /// Record a spectrum update and return the calibration paired with it
    /// together with the spectrum now current for its phase.
    fn on_cooked_spectrum(
        &mut self,
        spectrum: CookedSpectrum,
    ) -> (Option<SpectrumEnergy>, CookedSpectrum);

    /// Number of phases with at least one spectrum.
    fn phase_count(&self) -> usize;

    /// Move the buffered phases out, leaving the correlator empty.
    fn take(&mut self) -> PhaseBuffers;

    /// Drop all buffered phases.
    fn clear(&mut self) {
        self.take();
    }
}

/// Arrival-order correlation.
///
/// A spectrum with sequence number 1, or any spectrum arriving into an empty
/// buffer, opens a new phase entry; every other spectrum replaces the last
/// entry because counts are cumulative. Energies follow the same positional
/// rule against the spectrum buffer.
#[derive(Debug, Default)]
pub struct PositionalCorrelator {
    buffers: PhaseBuffers,
}

impl PositionalCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered phases without taking them.
    pub fn buffers(&self) -> &PhaseBuffers {
        &self.buffers
    }

    fn push_energy(&mut self, energy: SpectrumEnergy) {
        let energies = &mut self.buffers.energies;
        if energies.is_empty() || energy.packet_count == 1 {
            energies.push(energy);
        } else if let Some(last) = energies.last_mut() {
            *last = energy;
        }
    }

    fn push_spectrum(&mut self, spectrum: CookedSpectrum) -> CookedSpectrum {
        let spectra = &mut self.buffers.spectra;
        if spectra.is_empty() || spectrum.starts_series() {
            trace!(phase = spectra.len(), "Spectrum opens new phase entry");
            spectra.push(spectrum.clone());
        } else if let Some(last) = spectra.last_mut() {
            *last = spectrum.clone();
        }
        spectrum
    }
}

impl SpectrumCorrelator for PositionalCorrelator {
    fn on_spectrum_energy(&mut self, energy: SpectrumEnergy) {
        self.push_energy(energy);
    }

    fn on_cooked_spectrum(
        &mut self,
        spectrum: CookedSpectrum,
    ) -> (Option<SpectrumEnergy>, CookedSpectrum) {
        let current = self.push_spectrum(spectrum);
        (self.buffers.energies.last().copied(), current)
    }

    fn phase_count(&self) -> usize {
        self.buffers.spectra.len()
    }

    fn take(&mut self) -> PhaseBuffers {
        std::mem::take(&mut self.buffers)
    }
}

/// Sequence-matched correlation with positional fallback.
///
/// Energies wait in a pending slot until a spectrum with the same sequence
/// number arrives. A spectrum without a matching pending energy falls back to
/// the most recent energy, as the positional correlator would.
#[derive(Debug, Default)]
pub struct MatchedCorrelator {
    inner: PositionalCorrelator,
    pending: Vec<SpectrumEnergy>,
}

impl MatchedCorrelator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpectrumCorrelator for MatchedCorrelator {
    fn on_spectrum_energy(&mut self, energy: SpectrumEnergy) {
        self.pending.push(energy);
    }

    fn on_cooked_spectrum(
        &mut self,
        spectrum: CookedSpectrum,
    ) -> (Option<SpectrumEnergy>, CookedSpectrum) {
        let wanted = i64::from(spectrum.accumulation_sequence);
        let matched = self.pending.iter().position(|e| i64::from(e.packet_count) == wanted);

        let energy = match matched {
            Some(index) => {
                let energy = self.pending.remove(index);
                // Anything older than the match can never pair any more.
                self.pending.drain(..index);
                Some(energy)
            }
            None => {
                if !self.pending.is_empty() {
                    debug!(
                        sequence = spectrum.accumulation_sequence,
                        pending = self.pending.len(),
                        "No energy matches spectrum sequence, pairing by position"
                    );
                }
                let energy = self.pending.pop();
                self.pending.clear();
                energy
            }
        };

        let is_new_entry = self.inner.buffers.spectra.is_empty() || spectrum.starts_series();
        let current = self.inner.push_spectrum(spectrum);
        let energies = &mut self.inner.buffers.energies;
        match energy {
            Some(energy) if is_new_entry || energies.is_empty() => energies.push(energy),
            Some(energy) => {
                if let Some(last) = energies.last_mut() {
                    *last = energy;
                }
            }
            None => {}
        }

        (self.inner.buffers.energies.last().copied(), current)
    }

    fn phase_count(&self) -> usize {
        self.inner.phase_count()
    }

    fn take(&mut self) -> PhaseBuffers {
        self.pending.clear();
        self.inner.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{cooked_spectrum, energy};

    fn feed(correlator: &mut dyn SpectrumCorrelator, sequence: u32, fill: u32) {
        correlator.on_spectrum_energy(energy(sequence as i32));
        correlator.on_cooked_spectrum(cooked_spectrum(sequence, fill));
    }

    #[test]
    fn first_packet_with_sequence_one_appends() {
        let mut correlator = PositionalCorrelator::new();
        correlator.on_cooked_spectrum(cooked_spectrum(1, 1));
        assert_eq!(correlator.phase_count(), 1);
    }

    #[test]
    fn first_packet_with_other_sequence_appends_into_empty_buffer() {
        let mut correlator = PositionalCorrelator::new();
        correlator.on_cooked_spectrum(cooked_spectrum(5, 1));
        assert_eq!(correlator.phase_count(), 1);
    }

    #[test]
    fn later_sequences_replace_the_last_entry() {
        let mut correlator = PositionalCorrelator::new();
        for sequence in 1..=4 {
            feed(&mut correlator, sequence, sequence);
        }
        assert_eq!(correlator.phase_count(), 1);
        let buffers = correlator.buffers();
        assert_eq!(buffers.spectra[0].accumulation_sequence, 4);
        assert_eq!(buffers.energies.len(), 1);
        assert_eq!(buffers.energies[0].packet_count, 4);
    }

    #[test]
    fn sequence_one_always_opens_a_new_phase() {
        let mut correlator = PositionalCorrelator::new();
        for phase in 0..3 {
            for sequence in 1..=3 {
                feed(&mut correlator, sequence, phase * 10 + sequence);
            }
        }
        let buffers = correlator.take();
        assert_eq!(buffers.spectra.len(), 3);
        assert_eq!(buffers.energies.len(), 3);
        assert!(buffers.spectra.iter().all(|s| s.accumulation_sequence == 3));
        assert_eq!(correlator.phase_count(), 0);
    }

    #[test]
    fn returns_current_calibration_with_spectrum() {
        let mut correlator = PositionalCorrelator::new();
        correlator.on_spectrum_energy(energy(1));
        let (calibration, current) = correlator.on_cooked_spectrum(cooked_spectrum(1, 7));
        assert_eq!(calibration.map(|e| e.packet_count), Some(1));
        assert_eq!(current.counts[0], 7);
    }

    #[test]
    fn clear_empties_buffers() {
        let mut correlator = PositionalCorrelator::new();
        feed(&mut correlator, 1, 1);
        correlator.clear();
        assert_eq!(correlator.phase_count(), 0);
        assert!(correlator.buffers().energies.is_empty());
    }

    #[test]
    fn matched_correlator_behaves_positionally_for_in_order_streams() {
        let mut matched = MatchedCorrelator::new();
        let mut positional = PositionalCorrelator::new();
        for phase in 0..2 {
            for sequence in 1..=3 {
                feed(&mut matched, sequence, phase + sequence);
                feed(&mut positional, sequence, phase + sequence);
            }
        }
        assert_eq!(matched.take(), positional.take());
    }

    #[test]
    fn matched_correlator_pairs_by_sequence_when_energies_arrive_early() {
        let mut matched = MatchedCorrelator::new();
        matched.on_spectrum_energy(energy(1));
        matched.on_spectrum_energy(energy(2));
        let (calibration, _) = matched.on_cooked_spectrum(cooked_spectrum(1, 1));
        assert_eq!(calibration.map(|e| e.packet_count), Some(1));
    }

    #[test]
    fn mode_builds_requested_correlator() {
        let mut correlator = CorrelationMode::Matched.build();
        correlator.on_spectrum_energy(energy(1));
        correlator.on_cooked_spectrum(cooked_spectrum(1, 1));
        assert_eq!(correlator.phase_count(), 1);
    }
}
