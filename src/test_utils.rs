//! Builders and a scripted fake analyzer shared by unit tests and benches.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::io::{DuplexStream, WriteHalf};

use crate::assay::{AssayDraft, ResultRow, TemperatureSummary};
use crate::frame::{Frame, FrameReader, TypeCode, write_frame};
use crate::packet::{CHANNEL_COUNT, CookedSpectrum, SpectrumEnergy};
use crate::session::PhaseDefinition;
use crate::xml::XmlNode;
use crate::Result;

/// Prolog every analyzer XML message starts with.
pub const XML_PROLOG: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

/// Cooked spectrum with every channel set to `fill`.
pub fn cooked_spectrum(accumulation_sequence: u32, fill: u32) -> CookedSpectrum {
    let counts: Arc<[u32]> = vec![fill; CHANNEL_COUNT].into();
    CookedSpectrum {
        detector_temp_raw: -2450,
        ambient_temp_raw: 3120,
        real_time_ms: 1000 * accumulation_sequence,
        live_time_ms: 950 * accumulation_sequence,
        dead_time_ms: 50 * accumulation_sequence,
        reset_time_ms: 3,
        raw_counts: fill.saturating_mul(CHANNEL_COUNT as u32),
        valid_counts: fill.saturating_mul(CHANNEL_COUNT as u32 - 8),
        accumulation_sequence,
        phase_number: 1,
        tube_voltage_adc: 40_000,
        tube_current_adc: 10_500,
        filter_description: "Al 25um".to_string(),
        filter_number: 2,
        counts,
    }
}

/// Energy calibration with a 20 eV channel width.
pub fn energy(packet_count: i32) -> SpectrumEnergy {
    SpectrumEnergy { packet_count, ev_channel_start: -15.0, ev_per_channel: 20.0 }
}

/// Fixed instant used wherever tests need a clock reading.
pub fn timestamp(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 14)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .unwrap_or_default()
}

/// Draft assay with a single phase and the given rows.
pub fn assay_draft(result_rows: Vec<ResultRow>) -> AssayDraft {
    let spectrum = cooked_spectrum(10, 4);
    AssayDraft {
        date_completed: NaiveDate::from_ymd_opt(2024, 3, 14).unwrap_or_default(),
        time_completed: NaiveTime::from_hms_opt(10, 30, 0).unwrap_or_default(),
        elapsed_duration: Duration::from_secs(21),
        total_set_duration: Duration::from_secs(20),
        application: Some("GeoExploration".to_string()),
        method: Some("Oxide3Phase".to_string()),
        result_rows,
        temperatures: TemperatureSummary::from_spectra(std::slice::from_ref(&spectrum), None),
        per_phase_spectra: vec![spectrum],
        per_phase_energies: vec![energy(10)],
        per_phase_legends: vec!["Phase 1: Main (20s)".to_string()],
        pdz_filename: None,
    }
}

/// Three phases of 20, 10 and 10 seconds.
pub fn three_phases() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition { number: 1, name: "Main".into(), duration_seconds: 20 },
        PhaseDefinition { number: 2, name: "Low".into(), duration_seconds: 10 },
        PhaseDefinition { number: 3, name: "Light".into(), duration_seconds: 10 },
    ]
}

/// XML frame carrying `body` after the standard prolog.
pub fn xml_frame(body: &str) -> Frame {
    Frame::xml(&format!("{}{}", XML_PROLOG, body))
}

pub fn status_xml(parameter: &str, value: &str) -> String {
    format!(r#"<Status parameter="{}">{}</Status>"#, parameter, value)
}

pub fn response_xml(parameter: &str, body: &str) -> String {
    format!(r#"<Response parameter="{}" status="success">{}</Response>"#, parameter, body)
}

pub fn error_report_xml(tx_msg_id: &str, ackable: bool, message: &str) -> String {
    format!(
        r#"<ErrorReport TxMsgID="{}" UserAckable="{}">{}</ErrorReport>"#,
        tx_msg_id,
        if ackable { "Yes" } else { "No" },
        message
    )
}

pub fn iron_results_xml() -> String {
    concat!(
        r#"<Data type="Assay"><Elements>"#,
        r#"<ElementData atomicNumber="26"><Compound>Fe</Compound>"#,
        r#"<Concentration>12.5</Concentration><Error>0.1</Error></ElementData>"#,
        r#"</Elements></Data>"#
    )
    .to_string()
}

pub fn phase_times_xml(phases: &[PhaseDefinition]) -> String {
    let mut body = String::from("<PhaseList>");
    for phase in phases {
        body.push_str(&format!(
            r#"<Phase number="{}"><Name>{}</Name><Duration unit="ms">{}</Duration></Phase>"#,
            phase.number,
            phase.name,
            u64::from(phase.duration_seconds) * 1000
        ));
    }
    body.push_str("</PhaseList>");
    response_xml("phase times", &body)
}

/// Cooked spectrum frame preceded by its energy frame.
pub fn spectrum_frames(accumulation_sequence: u32, fill: u32) -> [Frame; 2] {
    [
        Frame::new(TypeCode::SPECTRUM_ENERGY, energy(accumulation_sequence as i32).encode().to_vec()),
        Frame::new(TypeCode::COOKED_SPECTRUM, cooked_spectrum(accumulation_sequence, fill).encode()),
    ]
}

/// Instrument side of an in-memory connection.
///
/// Frames written with [`FakeInstrument::send`] reach the client's reader;
/// frames the client writes are read back with [`FakeInstrument::next_command`].
pub struct FakeInstrument {
    reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

/// Create a connected client stream and fake analyzer.
pub fn fake_instrument() -> (DuplexStream, FakeInstrument) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(server);
    (client, FakeInstrument { reader: FrameReader::new(read_half), writer: write_half })
}

impl FakeInstrument {
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.writer, frame).await
    }

    pub async fn send_xml(&mut self, body: &str) -> Result<()> {
        self.send(&xml_frame(body)).await
    }

    /// Send raw bytes, e.g. a deliberately truncated frame.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next command the client wrote, parsed as XML.
    pub async fn next_command(&mut self) -> Result<XmlNode> {
        let frame = self.reader.read_frame().await?;
        let document = String::from_utf8_lossy(&frame.payload).into_owned();
        XmlNode::parse(&document)
    }

    /// Read commands until one matches `predicate`, returning everything read.
    pub async fn commands_until<F>(&mut self, predicate: F) -> Result<Vec<XmlNode>>
    where
        F: Fn(&XmlNode) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let node = self.next_command().await?;
            let done = predicate(&node);
            seen.push(node);
            if done {
                return Ok(seen);
            }
        }
    }

    /// Close the instrument side; the client sees end of stream.
    pub async fn close(mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.writer.shutdown().await;
    }
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
