//! Audio playback to speakers

use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::voice::decode::{decode_fragment, resample};
use crate::voice::sequencer::{AudioFragment, AudioOutput, Completion, DecodedAudio};
use crate::{Error, Result};

/// Default playback rate (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Grace period past the expected end before a render is abandoned
const RENDER_GRACE: Duration = Duration::from_millis(500);

/// Lets the device flush its last buffer before the stream is dropped
const TAIL_FLUSH: Duration = Duration::from_millis(100);

/// Renders decoded fragments on the default output device
///
/// Each render runs on its own thread holding the cpal stream, so the
/// completion callback fires only after the stream has been dropped.
#[derive(Debug, Clone)]
pub struct CpalOutput {
    config: StreamConfig,
    sample_rate: u32,
}

impl CpalOutput {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports the rate
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports_rate(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports_rate(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            config,
            sample_rate,
        })
    }

    /// Device sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioOutput for CpalOutput {
    fn decode(&self, fragment: &AudioFragment) -> Result<DecodedAudio> {
        let audio = decode_fragment(fragment)?;
        let samples = resample(&audio.samples, audio.sample_rate, self.sample_rate)
            .map_err(|e| Error::FragmentDecodeFailed(e.to_string()))?;
        Ok(DecodedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    fn render(&self, audio: DecodedAudio, done: Completion) -> Result<()> {
        let config = self.config.clone();
        std::thread::Builder::new()
            .name("live-voice-playback".to_string())
            .spawn(move || {
                let result = play_blocking(&config, audio);
                done(result);
            })?;
        Ok(())
    }
}

/// Play samples and block until the device has consumed them
fn play_blocking(config: &StreamConfig, audio: DecodedAudio) -> Result<()> {
    if audio.samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let channels = usize::from(config.channels);
    let expected = Duration::from_millis(audio.duration_ms());
    let samples = audio.samples;
    let sample_count = samples.len();
    let mut position = 0_usize;

    let (finished_tx, finished_rx) = mpsc::sync_channel::<()>(1);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    if position < samples.len() {
                        position += 1;
                    }
                }
                if position >= samples.len() {
                    // Full channel means the end was already signalled
                    let _ = finished_tx.try_send(());
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    match finished_rx.recv_timeout(expected + RENDER_GRACE) {
        Ok(()) => std::thread::sleep(TAIL_FLUSH),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(samples = sample_count, "playback did not finish in time");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(Error::Audio("playback stream closed".to_string()));
        }
    }

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");

    Ok(())
}
