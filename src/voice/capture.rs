//! Audio capture from microphone
//!
//! The microphone is opened through [`InputDevice`], which hands every batch of
//! samples to a [`ChunkSink`]. What the sink does with them depends on the
//! capture policy: [`Chunker`] cuts fixed-size blocks for streaming, while
//! [`Recorder`] keeps the whole utterance for a single upload.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Receives mono samples from the capture thread
pub type ChunkSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A microphone that can be opened on demand
pub trait InputDevice: Send + Sync + 'static {
    /// Acquire the device and start delivering samples to `sink`
    ///
    /// # Errors
    ///
    /// Returns `DeviceAccessDenied` if the device is missing or refused
    fn open(&self, sink: ChunkSink) -> Result<Box<dyn CaptureHandle>>;
}

/// A live capture; stopping it releases the device
pub trait CaptureHandle: Send {
    /// Stop delivering samples and release the device
    ///
    /// Returns only once the sink will not be called again.
    fn stop(&mut self);

    /// Rate of the samples being delivered
    fn sample_rate(&self) -> u32;
}

/// Default input device via cpal
#[derive(Debug, Clone, Copy)]
pub struct CpalMicrophone {
    sample_rate: u32,
}

impl CpalMicrophone {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

impl InputDevice for CpalMicrophone {
    fn open(&self, sink: ChunkSink) -> Result<Box<dyn CaptureHandle>> {
        let sample_rate = self.sample_rate;
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        // cpal streams are not Send, so the stream lives and dies on this thread
        let thread = std::thread::Builder::new()
            .name("live-voice-capture".to_string())
            .spawn(move || {
                let stream = match start_input_stream(sample_rate, sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns on stop or when the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(sample_rate, "audio capture started");
                Ok(Box::new(MicrophoneHandle {
                    stop: Some(stop_tx),
                    thread: Some(thread),
                    sample_rate,
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::DeviceAccessDenied(
                    "capture thread exited before the device opened".to_string(),
                ))
            }
        }
    }
}

/// Build and start an input stream that feeds `sink` with mono samples
#[allow(clippy::cast_precision_loss)]
fn start_input_stream(sample_rate: u32, mut sink: ChunkSink) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceAccessDenied("no input device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    // Prefer mono, otherwise downmix in the callback
    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceAccessDenied(e.to_string()))?
        .filter(|c| supports_rate(c))
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::DeviceAccessDenied("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let mut mono = Vec::new();
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels <= 1 {
                    sink(data);
                    return;
                }
                mono.clear();
                mono.extend(
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                );
                sink(&mono);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::DeviceAccessDenied(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceAccessDenied(e.to_string()))?;

    Ok(stream)
}

/// Handle to a running cpal capture thread
struct MicrophoneHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl CaptureHandle for MicrophoneHandle {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("audio capture thread panicked");
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for MicrophoneHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cuts an arbitrary sample stream into fixed-size blocks
#[derive(Debug)]
pub struct Chunker {
    block: usize,
    pending: Vec<f32>,
}

impl Chunker {
    /// Create a chunker emitting blocks of `block` samples
    #[must_use]
    pub fn new(block: usize) -> Self {
        let block = block.max(1);
        Self {
            block,
            pending: Vec::with_capacity(block),
        }
    }

    /// Feed samples, calling `emit` for every completed block
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        while !samples.is_empty() {
            let take = (self.block - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.block {
                emit(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.block),
                ));
            }
        }
    }

    /// Samples held back waiting for a full block
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Accumulates everything the microphone delivers
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    buffer: Arc<Mutex<Vec<f32>>>,
}

impl Recorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that appends into this recorder
    #[must_use]
    pub fn sink(&self) -> ChunkSink {
        let buffer = Arc::clone(&self.buffer);
        Box::new(move |samples| {
            buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(samples);
        })
    }

    /// Take the recording, leaving the recorder empty
    #[must_use]
    pub fn take(&self) -> Vec<f32> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Copy of the recording so far
    #[must_use]
    pub fn peek(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Discard the recording
    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of recorded samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Convert f32 samples to WAV bytes for upload
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
