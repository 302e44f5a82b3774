//! Remote conversational session
//!
//! The backend is an external collaborator. These traits are the whole of
//! what the capture pipeline and the controller rely on: open a session with
//! a system preamble, push audio into it, and read response events until the
//! stream ends or fails.

mod gemini;
mod sse;

pub use gemini::{GeminiConnector, MAX_TURN_SECS, READY_ACK};
pub use sse::SseDecoder;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Default system preamble sent when a session opens
pub const DEFAULT_PREAMBLE: &str =
    "You are a helpful and responsive AI voice assistant. Keep your answers brief and clear.";

/// Transport-encoded audio carried by a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudio {
    /// Payload in the transport encoding (base64)
    pub data: String,
    /// MIME type reported by the backend
    pub mime_type: Option<String>,
}

/// One event from the response stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEvent {
    pub text: Option<String>,
    pub audio: Option<EncodedAudio>,
    /// The backend finished answering the current turn
    pub turn_complete: bool,
}

impl ResponseEvent {
    /// Event carrying only text
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Event carrying only audio
    #[must_use]
    pub fn audio(data: impl Into<String>, mime_type: Option<String>) -> Self {
        Self {
            audio: Some(EncodedAudio {
                data: data.into(),
                mime_type,
            }),
            ..Self::default()
        }
    }

    /// End-of-turn marker
    #[must_use]
    pub fn turn_complete() -> Self {
        Self {
            turn_complete: true,
            ..Self::default()
        }
    }
}

/// A whole recorded utterance, already transport-encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: String,
}

/// Response events; the channel closes when the session ends
pub type ResponseStream = mpsc::Receiver<Result<ResponseEvent>>;

/// An open session. Dropping it cancels any in-flight work.
#[async_trait]
pub trait RemoteSession: Send {
    /// Forward one block of raw mono samples
    async fn send_chunk(&mut self, samples: &[f32]) -> Result<()>;

    /// Mark the end of the streamed utterance so the backend can answer
    async fn end_turn(&mut self) -> Result<()>;

    /// Drop streamed audio that preceded speech, keeping the newest `keep` samples
    async fn trim_turn(&mut self, keep: usize) -> Result<()>;

    /// Send a complete utterance as one message
    async fn send_attachment(&mut self, attachment: Attachment) -> Result<()>;
}

/// Opens sessions against a backend
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Open a session seeded with `preamble`
    ///
    /// # Errors
    ///
    /// Returns `RemoteConnectFailed` if the backend rejects the session
    async fn connect(&self, preamble: &str) -> Result<(Box<dyn RemoteSession>, ResponseStream)>;
}
