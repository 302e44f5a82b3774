//! Configuration management for live-voice
//!
//! Values resolve env > TOML file > default.

pub mod file;

use serde::Deserialize;

use crate::remote::DEFAULT_PREAMBLE;
use crate::voice::{EndpointConfig, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE};
use crate::{Error, Result};

/// Default Gemini model
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";

/// Default Gemini API base URL
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default streamed block size (100ms at 16kHz)
pub const DEFAULT_CHUNK_SAMPLES: usize = 1600;

/// live-voice configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// System preamble sent when a session opens
    pub preamble: String,

    /// Remote backend configuration
    pub remote: RemoteConfig,

    /// Microphone capture configuration
    pub capture: CaptureConfig,

    /// Speaker output configuration
    pub playback: PlaybackConfig,
}

/// How microphone audio reaches the remote session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CapturePolicy {
    /// Forward fixed-size raw blocks as they are captured
    #[default]
    Streaming,
    /// Record the whole utterance and send it on stop
    Batch,
}

impl std::str::FromStr for CapturePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" => Ok(Self::Streaming),
            "batch" | "record" => Ok(Self::Batch),
            other => Err(Error::Config(format!("unknown capture policy: {other}"))),
        }
    }
}

impl std::fmt::Display for CapturePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => f.write_str("streaming"),
            Self::Batch => f.write_str("batch"),
        }
    }
}

/// Remote backend configuration
#[derive(Clone)]
pub struct RemoteConfig {
    /// Gemini API key
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,

    /// API base URL
    pub base_url: String,

    /// Requested reply modalities; empty leaves the model default
    pub response_modalities: Vec<String>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("response_modalities", &self.response_modalities)
            .finish()
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            response_modalities: Vec::new(),
        }
    }
}

/// Microphone capture configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub policy: CapturePolicy,

    /// Capture sample rate
    pub sample_rate: u32,

    /// Samples per streamed block
    pub chunk_samples: usize,

    /// Utterance endpointing for the streaming policy
    pub endpoint: EndpointConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            policy: CapturePolicy::default(),
            sample_rate: SAMPLE_RATE,
            chunk_samples: DEFAULT_CHUNK_SAMPLES,
            endpoint: EndpointConfig::default(),
        }
    }
}

/// Speaker output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_string(),
            remote: RemoteConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or out of range
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or out of range
    pub fn from_sources(
        fc: file::LiveVoiceConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let parse_env = |key: &str| -> Result<Option<u32>> {
            env(key)
                .map(|v| {
                    v.trim()
                        .parse()
                        .map_err(|_| Error::Config(format!("{key} must be a number, got {v:?}")))
                })
                .transpose()
        };

        // Remote config (env > toml > default)
        let remote = RemoteConfig {
            api_key: env("GEMINI_API_KEY").or(fc.remote.api_key),
            model: env("LIVE_VOICE_MODEL")
                .or(fc.remote.model)
                .unwrap_or(defaults.remote.model),
            base_url: env("LIVE_VOICE_API_URL")
                .or(fc.remote.base_url)
                .unwrap_or(defaults.remote.base_url),
            response_modalities: env("LIVE_VOICE_RESPONSE_MODALITIES")
                .map(|s| {
                    s.split(',')
                        .map(|m| m.trim().to_ascii_uppercase())
                        .filter(|m| !m.is_empty())
                        .collect()
                })
                .or(fc.remote.response_modalities)
                .unwrap_or_default(),
        };

        // Capture config (env > toml > default)
        let policy = match env("LIVE_VOICE_CAPTURE_POLICY") {
            Some(s) => s.parse()?,
            None => fc.capture.policy.unwrap_or(defaults.capture.policy),
        };
        let chunk_samples = match env("LIVE_VOICE_CHUNK_SAMPLES") {
            Some(v) => v.trim().parse().map_err(|_| {
                Error::Config(format!("LIVE_VOICE_CHUNK_SAMPLES must be a number, got {v:?}"))
            })?,
            None => fc
                .capture
                .chunk_samples
                .unwrap_or(defaults.capture.chunk_samples),
        };
        let capture = CaptureConfig {
            policy,
            sample_rate: parse_env("LIVE_VOICE_SAMPLE_RATE")?
                .or(fc.capture.sample_rate)
                .unwrap_or(defaults.capture.sample_rate),
            chunk_samples,
            endpoint: EndpointConfig {
                min_speech_ms: parse_env("LIVE_VOICE_MIN_SPEECH_MS")?
                    .or(fc.capture.min_speech_ms)
                    .unwrap_or(defaults.capture.endpoint.min_speech_ms),
                silence_ms: parse_env("LIVE_VOICE_SILENCE_MS")?
                    .or(fc.capture.silence_ms)
                    .unwrap_or(defaults.capture.endpoint.silence_ms),
                pre_roll_ms: parse_env("LIVE_VOICE_PRE_ROLL_MS")?
                    .or(fc.capture.pre_roll_ms)
                    .unwrap_or(defaults.capture.endpoint.pre_roll_ms),
            },
        };

        let playback = PlaybackConfig {
            sample_rate: parse_env("LIVE_VOICE_PLAYBACK_RATE")?
                .or(fc.playback.sample_rate)
                .unwrap_or(defaults.playback.sample_rate),
        };

        let preamble = env("LIVE_VOICE_PREAMBLE")
            .or(fc.preamble)
            .unwrap_or(defaults.preamble);

        let config = Self {
            preamble,
            remote,
            capture,
            playback,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.capture.sample_rate == 0 {
            return Err(Error::Config("capture sample rate must be positive".to_string()));
        }
        if self.playback.sample_rate == 0 {
            return Err(Error::Config("playback sample rate must be positive".to_string()));
        }
        if self.capture.chunk_samples == 0 {
            return Err(Error::Config("chunk size must be positive".to_string()));
        }
        if self.preamble.trim().is_empty() {
            return Err(Error::Config("preamble must not be empty".to_string()));
        }
        Ok(())
    }
}
