//! TOML configuration file loading
//!
//! Supports `~/.config/live-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::CapturePolicy;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LiveVoiceConfigFile {
    /// System preamble sent when a session opens
    #[serde(default)]
    pub preamble: Option<String>,

    /// Remote backend configuration
    #[serde(default)]
    pub remote: RemoteFileConfig,

    /// Microphone capture configuration
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Speaker output configuration
    #[serde(default)]
    pub playback: PlaybackFileConfig,
}

/// Remote backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct RemoteFileConfig {
    pub api_key: Option<String>,

    /// Model identifier (e.g. "gemini-1.5-flash-latest")
    pub model: Option<String>,

    /// API base URL
    pub base_url: Option<String>,

    /// Requested reply modalities (e.g. `["AUDIO"]`)
    pub response_modalities: Option<Vec<String>>,
}

/// Microphone capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub policy: Option<CapturePolicy>,
    pub sample_rate: Option<u32>,

    /// Samples per streamed block
    pub chunk_samples: Option<usize>,

    /// Silence that ends a streamed utterance
    pub silence_ms: Option<u32>,

    /// Speech needed before a streamed utterance can end
    pub min_speech_ms: Option<u32>,

    /// Audio kept ahead of a streamed utterance
    pub pre_roll_ms: Option<u32>,
}

/// Speaker output configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub sample_rate: Option<u32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LiveVoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LiveVoiceConfigFile {
    config_file_path().map_or_else(LiveVoiceConfigFile::default, |path| load_from(&path))
}

/// Load a config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> LiveVoiceConfigFile {
    if !path.exists() {
        return LiveVoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LiveVoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LiveVoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/live-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("live-voice").join("config.toml"))
}
