//! Live Voice - push-to-talk voice chat with a conversational AI backend
//!
//! This library provides the pieces behind the `live-voice` binary:
//! - Microphone capture, streamed in blocks or recorded whole
//! - A remote conversational session (Gemini over SSE)
//! - Ordered, one-at-a-time playback of reply audio
//! - The controller tying them to a single start/stop toggle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   blocks / WAV    ┌──────────────────┐
//! │  Microphone  │ ────────────────▶ │  Remote session  │
//! └──────────────┘                   └────────┬─────────┘
//!        ▲                                    │ text + audio events
//!        │ toggle                             ▼
//! ┌──────┴───────┐   transcript      ┌──────────────────┐
//! │  Controller  │ ◀──────────────── │ Response router  │
//! └──────────────┘                   └────────┬─────────┘
//!                                             │ fragments
//!                                    ┌────────▼─────────┐
//!                                    │ Playback queue   │ ──▶ speakers
//!                                    └──────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod remote;
pub mod session;
pub mod voice;

pub use codec::{Base64Codec, TransportCodec};
pub use config::{CapturePolicy, Config};
pub use error::{Error, Result};
pub use remote::{
    Attachment, EncodedAudio, GeminiConnector, RemoteSession, ResponseEvent, ResponseStream,
    SessionConnector,
};
pub use session::{
    CaptureState, ControlEvent, ControlEvents, SessionSettings, Status, StopHandle,
    VoiceController,
};
pub use voice::{AudioFragment, AudioOutput, PlaybackSequencer, PlaybackState};
