//! Receiver configuration and the persisted sample-rate preference

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const CONFIG_FILE: &str = "receiver.toml";
const PREFERENCES_FILE: &str = "preferences.toml";

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            factor: 2.0,
        }
    }
}

/// Spectrum tap settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    pub enabled: bool,
    pub fft_size: usize,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fft_size: 1024,
        }
    }
}

/// Top-level receiver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Audio stream endpoint, without the rate query parameter
    pub server_url: String,
    /// Output device name; the system default when absent
    pub output_device: Option<String>,
    /// How often status is published and the output gate is checked
    pub status_interval_ms: u64,
    /// How long the queue must stay empty before the output is stopped
    pub idle_stop_ms: u64,
    /// How often the output is checked for idleness
    pub idle_check_ms: u64,
    pub reconnect: ReconnectConfig,
    pub spectrum: SpectrumConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8100/audio-stream".to_string(),
            output_device: None,
            status_interval_ms: 250,
            idle_stop_ms: 1000,
            idle_check_ms: 1000,
            reconnect: ReconnectConfig::default(),
            spectrum: SpectrumConfig::default(),
        }
    }
}

impl ReceiverConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(10))
    }

    pub fn idle_stop(&self) -> Duration {
        Duration::from_millis(self.idle_stop_ms)
    }

    pub fn idle_check(&self) -> Duration {
        Duration::from_millis(self.idle_check_ms)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from `path`, falling back to defaults on any problem
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(text) => match Self::from_toml(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse {}, using defaults: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}, using defaults: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;
        fs::write(path, text).map_err(|e| ConfigError::Write(e.to_string()))
    }
}

/// Per-user config directory, created on demand
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let dirs = ProjectDirs::from("org", "radio", "audio-receiver").ok_or(ConfigError::NoConfigDir)?;
    let dir = dirs.config_dir();
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| ConfigError::Write(e.to_string()))?;
    }
    Ok(dir.to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Storage for the user's requested receive sample rate
pub trait PreferenceStore: Send {
    fn load_requested_rate(&self) -> Option<u32>;

    fn store_requested_rate(&mut self, rate: u32) -> Result<(), ConfigError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Preferences {
    requested_sample_rate: Option<u32>,
}

/// Preference kept in a small TOML file
pub struct TomlPreferenceStore {
    path: PathBuf,
}

impl TomlPreferenceStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store next to the receiver config
    pub fn in_config_dir() -> Result<Self, ConfigError> {
        Ok(Self::new(config_dir()?.join(PREFERENCES_FILE)))
    }

    fn read(&self) -> Preferences {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| toml::from_str(&text).ok())
            .unwrap_or_default()
    }
}

impl PreferenceStore for TomlPreferenceStore {
    fn load_requested_rate(&self) -> Option<u32> {
        self.read().requested_sample_rate
    }

    fn store_requested_rate(&mut self, rate: u32) -> Result<(), ConfigError> {
        let mut prefs = self.read();
        prefs.requested_sample_rate = Some(rate);
        let text = toml::to_string(&prefs).map_err(|e| ConfigError::Write(e.to_string()))?;
        fs::write(&self.path, text).map_err(|e| ConfigError::Write(e.to_string()))
    }
}

/// Non-persistent preference
#[derive(Debug, Default, Clone)]
pub struct MemoryPreferenceStore {
    rate: Option<u32>,
}

impl MemoryPreferenceStore {
    pub fn with_rate(rate: u32) -> Self {
        Self { rate: Some(rate) }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load_requested_rate(&self) -> Option<u32> {
        self.rate
    }

    fn store_requested_rate(&mut self, rate: u32) -> Result<(), ConfigError> {
        self.rate = Some(rate);
        Ok(())
    }
}
