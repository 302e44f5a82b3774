//! Error types for live-voice

use thiserror::Error;

/// Result type alias for live-voice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in live-voice
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone missing, busy, or permission denied
    #[error("microphone access denied: {0}")]
    DeviceAccessDenied(String),

    /// Remote session could not be opened
    #[error("remote connect failed: {0}")]
    RemoteConnectFailed(String),

    /// Remote response stream failed mid-session
    #[error("remote stream error: {0}")]
    RemoteStreamError(String),

    /// Audio fragment could not be decoded or rendered
    #[error("fragment decode failed: {0}")]
    FragmentDecodeFailed(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Transport encoding error
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    /// Status line shown to the user when this error ends a session
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::DeviceAccessDenied(_) => "Microphone access failed.",
            Self::RemoteConnectFailed(_) => "Failed to connect. Check API key.",
            Self::Config(_) => "Configuration error.",
            _ => "Error. Try again.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        assert_eq!(
            Error::DeviceAccessDenied("denied".into()).user_message(),
            "Microphone access failed."
        );
        assert_eq!(
            Error::RemoteConnectFailed("401".into()).user_message(),
            "Failed to connect. Check API key."
        );
        assert_eq!(
            Error::RemoteStreamError("reset".into()).user_message(),
            "Error. Try again."
        );
    }
}
