//! Persistent demo settings

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Master tempo in BPM
    pub tempo: f64,
    /// Number of forked voices
    pub voices: usize,
    /// Length of the piece in master beats
    pub beats: f64,
    /// Optional tempo to ramp the master towards
    pub ramp_to: Option<f64>,
    pub ramp_beats: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { tempo: 120.0, voices: 3, beats: 8.0, ramp_to: None, ramp_beats: 4.0 }
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadenza")
        .join("config.toml")
}

/// Read settings, falling back to defaults if the file is missing or malformed
pub fn load_config(path: &Path) -> AppConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str(&s).ok())
        .unwrap_or_default()
}

pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}
