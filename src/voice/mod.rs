//! Voice processing module
//!
//! Microphone capture, utterance endpointing, fragment decoding, and the
//! playback sequencer that renders reply audio to the speakers.

mod capture;
mod decode;
mod endpoint;
mod playback;
mod sequencer;

pub use capture::{
    CaptureHandle, ChunkSink, Chunker, CpalMicrophone, InputDevice, Recorder, SAMPLE_RATE,
    samples_to_wav,
};
pub use decode::{decode_fragment, resample};
pub use endpoint::{EndpointConfig, EndpointState, UtteranceDetector, rms_energy};
pub use playback::{CpalOutput, PLAYBACK_SAMPLE_RATE};
pub use sequencer::{
    AudioFragment, AudioOutput, Completion, DecodedAudio, PlaybackSequencer, PlaybackState,
};
