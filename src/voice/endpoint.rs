//! Utterance endpointing for the streaming capture policy
//!
//! Energy-based: a block above the threshold is speech. Once enough speech has
//! been heard, a long enough run of silence closes the utterance so the remote
//! session can answer while the microphone keeps streaming.

/// Minimum RMS energy to consider a block speech
pub const ENERGY_THRESHOLD: f32 = 0.03;

/// Timing knobs, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Speech needed before an utterance can end
    pub min_speech_ms: u32,
    /// Silence that ends an utterance
    pub silence_ms: u32,
    /// Audio kept ahead of detected speech so its onset is not clipped
    pub pre_roll_ms: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            min_speech_ms: 300,
            silence_ms: 800,
            pre_roll_ms: 300,
        }
    }
}

/// Endpointer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Waiting for speech
    Idle,
    /// Inside an utterance
    Speaking,
}

/// Detects the end of a spoken utterance in a live sample stream
#[derive(Debug)]
pub struct UtteranceDetector {
    state: EndpointState,
    min_speech_samples: usize,
    silence_samples: usize,
    pre_roll_samples: usize,
    utterance_len: usize,
    silence_counter: usize,
}

impl UtteranceDetector {
    /// Create a detector for audio at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32, config: EndpointConfig) -> Self {
        let to_samples =
            |ms: u32| usize::try_from(u64::from(sample_rate) * u64::from(ms) / 1000).unwrap_or(usize::MAX);

        Self {
            state: EndpointState::Idle,
            min_speech_samples: to_samples(config.min_speech_ms),
            silence_samples: to_samples(config.silence_ms),
            pre_roll_samples: to_samples(config.pre_roll_ms),
            utterance_len: 0,
            silence_counter: 0,
        }
    }

    /// Process a block of samples
    ///
    /// Returns true when this block completes an utterance. The detector
    /// resets itself afterwards.
    pub fn process(&mut self, samples: &[f32]) -> bool {
        let energy = rms_energy(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            EndpointState::Idle => {
                if is_speech {
                    self.state = EndpointState::Speaking;
                    self.utterance_len = samples.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected");
                }
            }
            EndpointState::Speaking => {
                self.utterance_len += samples.len();

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                let speech_len = self.utterance_len - self.silence_counter;
                if self.silence_counter > self.silence_samples {
                    if speech_len > self.min_speech_samples {
                        tracing::debug!(samples = self.utterance_len, "utterance complete");
                        self.reset();
                        return true;
                    }

                    // Too short to be speech: a click or a cough
                    tracing::trace!("discarding short noise burst");
                    self.reset();
                }
            }
        }

        false
    }

    /// Reset to idle
    pub const fn reset(&mut self) {
        self.state = EndpointState::Idle;
        self.utterance_len = 0;
        self.silence_counter = 0;
    }

    #[must_use]
    pub const fn state(&self) -> EndpointState {
        self.state
    }

    /// Samples of non-speech worth keeping in front of the next utterance
    #[must_use]
    pub const fn pre_roll_samples(&self) -> usize {
        self.pre_roll_samples
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
