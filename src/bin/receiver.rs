//! Radio Audio Receiver
//!
//! Connects to the radio server's audio stream and plays it on a local output
//! device. An optional first argument names a TOML config file; otherwise the
//! per-user config is used.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use radio_audio_receiver::{
    audio::{
        buffer::JitterBuffer,
        device::{get_output_device, list_output_devices},
        playback::CpalOutput,
        pull::PullEngine,
    },
    config::{default_config_path, MemoryPreferenceStore, PreferenceStore, ReceiverConfig, TomlPreferenceStore},
    dsp::{SpectrumFrame, SpectrumSink},
    network::{AudioPath, ConnectionSupervisor, WsConnector},
};

/// Logs the strongest bin of each spectrum frame
struct PeakLogger;

impl SpectrumSink for PeakLogger {
    fn accept(&mut self, frame: SpectrumFrame) {
        let peak = frame
            .magnitudes_db
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1));
        if let Some((bin, db)) = peak {
            tracing::debug!("Spectrum peak {:.0} Hz at {:.1} dB", frame.bin_frequency(bin), db);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Radio Audio Receiver");

    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => default_config_path().context("locating config directory")?,
    };
    let config = ReceiverConfig::load_or_default(&config_path);
    tracing::info!("Using config {}", config_path.display());

    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
    }
    println!();

    let device = get_output_device(config.output_device.as_deref())?;
    tracing::info!("Output device: {} ({} Hz)", device.name, device.native_rate()?);

    let buffer = Arc::new(JitterBuffer::new());
    let (engine, events) = PullEngine::new(buffer.clone());
    let control = engine.control();
    let output = CpalOutput::open(device, engine)?;

    let audio = AudioPath {
        native_rate: output.native_rate(),
        output,
        buffer,
        control,
        events,
    };

    let preferences: Box<dyn PreferenceStore> = match TomlPreferenceStore::in_config_dir() {
        Ok(store) => Box::new(store),
        Err(e) => {
            tracing::warn!("Sample rate preference will not persist: {}", e);
            Box::new(MemoryPreferenceStore::default())
        }
    };

    let spectrum_enabled = config.spectrum.enabled;
    let (mut supervisor, handle) = ConnectionSupervisor::new(config, WsConnector, audio, preferences);
    if spectrum_enabled {
        supervisor = supervisor.with_spectrum_sink(Box::new(PeakLogger));
    }
    tracing::info!("Legal sample rates: {:?}", handle.legal_sample_rates());
    let task = tokio::spawn(supervisor.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    handle.shutdown();
    task.await?;

    Ok(())
}
