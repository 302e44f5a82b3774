//! Ordered, exclusive playback of audio fragments
//!
//! Fragments arrive whenever the remote stream produces them, with no relation
//! to how long each one takes to play. The sequencer owns the queue and the
//! playing flag behind one lock, so a new arrival and a playback-finished event
//! can interleave in any order without two fragments ever rendering at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::codec::TransportCodec;
use crate::{Error, Result};

/// One independently playable unit of response audio
///
/// Immutable once built; the bytes are the container as it came off the
/// transport (after transport decoding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    data: Arc<[u8]>,
    mime_type: Option<String>,
}

impl AudioFragment {
    /// Wrap already-decoded container bytes
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>, mime_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            mime_type,
        }
    }

    /// Build a fragment from its transport encoding
    ///
    /// # Errors
    ///
    /// Returns `FragmentDecodeFailed` if the payload is not valid for `codec`
    pub fn from_transport(
        codec: &dyn TransportCodec,
        encoded: &str,
        mime_type: Option<String>,
    ) -> Result<Self> {
        let data = codec
            .decode(encoded)
            .map_err(|e| Error::FragmentDecodeFailed(e.to_string()))?;
        Ok(Self::new(data, mime_type))
    }

    /// Container bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// MIME type hint from the transport, if any
    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }
}

/// Mono f32 samples ready for the output device
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback length in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate)
    }
}

/// Called exactly once when a render ends, successfully or not
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// An output device that renders one decoded resource at a time
pub trait AudioOutput: Send + Sync + 'static {
    /// Decode a fragment into something this device can render
    ///
    /// # Errors
    ///
    /// Returns `FragmentDecodeFailed` for undecodable input
    fn decode(&self, fragment: &AudioFragment) -> Result<DecodedAudio>;

    /// Begin rendering `audio` and return without waiting for it to finish
    ///
    /// `done` fires when rendering ends. If this returns an error, `done` is
    /// never called.
    ///
    /// # Errors
    ///
    /// Returns error if rendering could not be started
    fn render(&self, audio: DecodedAudio, done: Completion) -> Result<()>;
}

/// Whether a fragment is currently being rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
}

#[derive(Default)]
struct Shared {
    queue: VecDeque<AudioFragment>,
    state: PlaybackState,
}

struct Inner {
    shared: Mutex<Shared>,
    output: Arc<dyn AudioOutput>,
    idle: Notify,
    played: AtomicU64,
    skipped: AtomicU64,
}

/// Plays fragments strictly one at a time, in enqueue order
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct PlaybackSequencer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PlaybackSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("PlaybackSequencer")
            .field("state", &shared.state)
            .field("pending", &shared.queue.len())
            .finish_non_exhaustive()
    }
}

impl PlaybackSequencer {
    /// Create a sequencer rendering to `output`
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared::default()),
                output,
                idle: Notify::new(),
                played: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
        }
    }

    /// Append a fragment and start playback if nothing is playing
    pub fn enqueue(&self, fragment: AudioFragment) {
        {
            let mut shared = self.inner.lock();
            shared.queue.push_back(fragment);
            tracing::trace!(pending = shared.queue.len(), "fragment enqueued");
        }
        self.inner.drain();
    }

    /// Current playback state
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    /// Fragments waiting behind the one playing
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Fragments rendered to completion so far
    #[must_use]
    pub fn played(&self) -> u64 {
        self.inner.played.load(Ordering::Relaxed)
    }

    /// Fragments dropped because they failed to decode or render
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.inner.skipped.load(Ordering::Relaxed)
    }

    /// Wait until the queue is empty and nothing is playing
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let shared = self.inner.lock();
                if shared.state == PlaybackState::Idle && shared.queue.is_empty() {
                    return;
                }
            }

            notified.await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the head fragment unless one is already playing
    fn drain(self: &Arc<Self>) {
        loop {
            let fragment = {
                let mut shared = self.lock();
                if shared.state == PlaybackState::Playing {
                    return;
                }
                let Some(fragment) = shared.queue.pop_front() else {
                    drop(shared);
                    self.idle.notify_waiters();
                    return;
                };
                shared.state = PlaybackState::Playing;
                fragment
            };

            let mut guard = SlotGuard::new(self);

            let audio = match self.output.decode(&fragment) {
                Ok(audio) => audio,
                Err(e) => {
                    guard.disarm();
                    self.skip(&e);
                    continue;
                }
            };

            tracing::debug!(
                samples = audio.samples.len(),
                duration_ms = audio.duration_ms(),
                "starting fragment playback"
            );

            let inner = Arc::clone(self);
            let done: Completion = Box::new(move |result| inner.finish(result));

            let rendered = self.output.render(audio, done);
            guard.disarm();
            match rendered {
                Ok(()) => return,
                Err(e) => self.skip(&e),
            }
        }
    }

    /// Completion callback: release the slot and move to the next fragment
    fn finish(self: &Arc<Self>, result: Result<()>) {
        match result {
            Ok(()) => {
                self.played.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("fragment playback complete");
            }
            Err(e) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "fragment playback failed");
            }
        }
        self.lock().state = PlaybackState::Idle;
        self.drain();
    }

    /// Consume a fragment that could not be played
    fn skip(&self, error: &Error) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %error, "skipping undecodable fragment");
        self.lock().state = PlaybackState::Idle;
    }
}

/// Frees the playing slot if decode or render unwinds
struct SlotGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::error!("fragment playback panicked, releasing output");
            self.inner.lock().state = PlaybackState::Idle;
            self.inner.idle.notify_waiters();
        }
    }
}
