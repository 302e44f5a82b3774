//! Shared test utilities
//!
//! Fakes for the microphone, the remote backend, and the speaker so the
//! controller and the playback queue can run without hardware or network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use live_voice::voice::{
    AudioFragment, AudioOutput, CaptureHandle, ChunkSink, Completion, DecodedAudio, InputDevice,
};
use live_voice::{
    Attachment, Error, RemoteSession, ResponseEvent, ResponseStream, Result, SessionConnector,
};

/// Microphone that hands its sink to the test
#[derive(Default)]
pub struct FakeMicrophone {
    deny: bool,
    opened: AtomicUsize,
    released: Arc<AtomicBool>,
    sink: Arc<Mutex<Option<ChunkSink>>>,
}

impl FakeMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Microphone whose permission request is always denied
    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Self::default()
        })
    }

    /// Push samples as if the audio thread captured them
    pub fn feed(&self, samples: &[f32]) {
        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            sink(samples);
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// True once a handle was stopped and nothing holds the device
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst) && self.sink.lock().unwrap().is_none()
    }
}

impl InputDevice for FakeMicrophone {
    fn open(&self, sink: ChunkSink) -> Result<Box<dyn CaptureHandle>> {
        if self.deny {
            return Err(Error::DeviceAccessDenied("permission denied".to_string()));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);

        Ok(Box::new(FakeCapture {
            released: Arc::clone(&self.released),
            sink: Arc::clone(&self.sink),
        }))
    }
}

struct FakeCapture {
    released: Arc<AtomicBool>,
    sink: Arc<Mutex<Option<ChunkSink>>>,
}

impl CaptureHandle for FakeCapture {
    fn stop(&mut self) {
        self.sink.lock().unwrap().take();
        self.released.store(true, Ordering::SeqCst);
    }

    fn sample_rate(&self) -> u32 {
        16000
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What a fake session was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Chunk(usize),
    EndTurn,
    Trim(usize),
    Attachment { mime_type: String, data: String },
}

/// Backend that records calls and lets the test script responses
#[derive(Default)]
pub struct FakeConnector {
    fail: bool,
    preambles: Mutex<Vec<String>>,
    calls: Arc<Mutex<Vec<SessionCall>>>,
    dropped: Arc<AtomicBool>,
    responder: Mutex<Option<mpsc::Sender<Result<ResponseEvent>>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend that rejects every session
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn preambles(&self) -> Vec<String> {
        self.preambles.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    /// True once the last session object was dropped
    pub fn session_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Send a response event on the open session's stream
    pub async fn respond(&self, event: Result<ResponseEvent>) {
        let tx = self.responder.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Close the response stream
    pub fn close_stream(&self) {
        self.responder.lock().unwrap().take();
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, preamble: &str) -> Result<(Box<dyn RemoteSession>, ResponseStream)> {
        if self.fail {
            return Err(Error::RemoteConnectFailed("bad key".to_string()));
        }

        self.preambles.lock().unwrap().push(preamble.to_string());
        self.dropped.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(32);
        *self.responder.lock().unwrap() = Some(tx);

        let session = FakeSession {
            calls: Arc::clone(&self.calls),
            dropped: Arc::clone(&self.dropped),
        };
        Ok((Box::new(session), rx))
    }
}

struct FakeSession {
    calls: Arc<Mutex<Vec<SessionCall>>>,
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn send_chunk(&mut self, samples: &[f32]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(SessionCall::Chunk(samples.len()));
        Ok(())
    }

    async fn end_turn(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(SessionCall::EndTurn);
        Ok(())
    }

    async fn trim_turn(&mut self, keep: usize) -> Result<()> {
        self.calls.lock().unwrap().push(SessionCall::Trim(keep));
        Ok(())
    }

    async fn send_attachment(&mut self, attachment: Attachment) -> Result<()> {
        self.calls.lock().unwrap().push(SessionCall::Attachment {
            mime_type: attachment.mime_type,
            data: attachment.data,
        });
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// Speaker that logs fragment bodies as text and finishes on its own thread
///
/// Fragments whose bytes start with `bad` fail to decode.
#[derive(Default)]
pub struct RecordingOutput {
    played: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    /// Most fragments ever rendering at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl AudioOutput for RecordingOutput {
    fn decode(&self, fragment: &AudioFragment) -> Result<DecodedAudio> {
        if fragment.data().starts_with(b"bad") {
            return Err(Error::FragmentDecodeFailed("not audio".to_string()));
        }
        Ok(DecodedAudio {
            samples: fragment.data().iter().map(|b| f32::from(*b)).collect(),
            sample_rate: 24000,
        })
    }

    fn render(&self, audio: DecodedAudio, done: Completion) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let label: String = audio.samples.iter().map(|s| char::from(*s as u8)).collect();
        self.played.lock().unwrap().push(label);

        // Finish off the caller's stack, like a real device callback
        let active = Arc::clone(&self.active);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            done(Ok(()));
        });
        Ok(())
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
