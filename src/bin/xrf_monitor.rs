//! Connects to an analyzer and logs session changes and completed assays.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xrf_link::{Analyzer, ConnectionConfig, EngineEvent};

#[derive(Parser)]
#[command(name = "xrf-monitor")]
#[command(about = "Monitor an XRF analyzer and log completed assays")]
struct Cli {
    /// Analyzer address; overrides the configuration file
    #[arg(long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Consecutive assays per start
    #[arg(short, long)]
    repeats: Option<u32>,
    /// Start an assay as soon as the analyzer is armed
    #[arg(long)]
    start: bool,
    /// Exit after this many completed assays
    #[arg(long)]
    count: Option<usize>,
}

impl Cli {
    fn config(&self) -> Result<ConnectionConfig> {
        let mut config = match &self.config {
            Some(path) => ConnectionConfig::from_file(path)
                .with_context(|| format!("Loading configuration from {}", path.display()))?,
            None => ConnectionConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(repeats) = self.repeats {
            config.repeats = repeats;
        }
        config.validate().context("Invalid settings")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;
    let connection = Analyzer::connect(&config)
        .await
        .with_context(|| format!("Connecting to {}", config.address()))?;

    let mut events = connection.events();
    let mut status = Box::pin(connection.status_updates());
    let mut start_pending = cli.start;
    let mut completed = 0usize;
    let mut last_line = String::new();

    loop {
        tokio::select! {
            Some(session) = status.next() => {
                let line = session.status_line();
                if line != last_line {
                    info!(status = %line, "Session");
                    last_line = line;
                }
                if start_pending && session.is_armed && session.is_logged_in {
                    start_pending = false;
                    if let Err(e) = connection.start_assay().await {
                        warn!(error = %e, "Assay start rejected");
                    }
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::AssayCompleted(assay)) => {
                    completed += 1;
                    info!(
                        sequence_index = assay.sequence_index,
                        elapsed_s = assay.elapsed_duration.as_secs_f32(),
                        phases = assay.per_phase_spectra.len(),
                        "Assay complete"
                    );
                    for row in &assay.result_rows {
                        info!(
                            z = row.atomic_number,
                            label = %row.compound_label,
                            percent = row.concentration_percent,
                            error = row.error_one_sigma,
                            "Result"
                        );
                    }
                    if cli.count.is_some_and(|count| completed >= count) {
                        break;
                    }
                }
                Ok(EngineEvent::InstrumentMessage { report, blocking: true }) => {
                    error!(message = %report.message, "Analyzer needs attention");
                }
                Ok(EngineEvent::Disconnected { reason }) => {
                    error!(reason = %reason, "Analyzer disconnected");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    connection.close();
    info!(assays = connection.catalogue().len(), "Monitor finished");
    Ok(())
}
