//! Capture sessions and the voice controller
//!
//! One [`VoiceController`] exists per run. It owns the single toggle's
//! behavior: start opens a remote session and the microphone, stop releases
//! both. Asynchronous outcomes (reply turns finishing, the response stream
//! failing) come back as [`ControlEvent`]s that the caller feeds into
//! [`VoiceController::handle`], so every state change happens on the owner's
//! task.
//!
//! ```text
//! Idle ──start──▶ RequestingDevice ──▶ Capturing ──stop──▶ Stopping ──▶ Idle
//!                       │                  │
//!                       └──────▶ Error ◀───┘ ──(released)──▶ Idle
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::{Base64Codec, TransportCodec};
use crate::config::{CapturePolicy, Config};
use crate::remote::{Attachment, RemoteSession, ResponseStream, SessionConnector};
use crate::voice::{
    AudioFragment, CaptureHandle, ChunkSink, Chunker, EndpointConfig, EndpointState, InputDevice,
    PlaybackSequencer, Recorder, UtteranceDetector, samples_to_wav,
};
use crate::Error;

/// Streamed blocks buffered between the audio thread and the forwarder
const CHUNK_QUEUE: usize = 64;

/// Capture session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Opening the remote session and acquiring the microphone
    RequestingDevice,
    Capturing,
    Stopping,
    /// Failed; resources are being released
    Error,
}

/// User-visible status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ready,
    Connecting,
    Listening,
    /// Batch recording sent, reply pending
    AwaitingReply,
    Failed(&'static str),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => f.write_str("Press Enter to start"),
            Self::Connecting => f.write_str("Connecting to AI..."),
            Self::Listening => f.write_str("Connected. Start speaking."),
            Self::AwaitingReply => f.write_str("Waiting for reply..."),
            Self::Failed(message) => f.write_str(message),
        }
    }
}

/// Asynchronous outcome of a session, tagged with the session it belongs to
#[derive(Debug)]
pub enum ControlEvent {
    /// The response stream or the chunk forwarder failed
    StreamFailed { generation: u64, error: Error },
    /// The backend finished answering a turn
    TurnComplete { generation: u64 },
    /// The response stream ended
    StreamClosed { generation: u64 },
}

impl ControlEvent {
    const fn generation(&self) -> u64 {
        match self {
            Self::StreamFailed { generation, .. }
            | Self::TurnComplete { generation }
            | Self::StreamClosed { generation } => *generation,
        }
    }
}

/// Receiving end of a controller's events
#[derive(Debug)]
pub struct ControlEvents(mpsc::UnboundedReceiver<ControlEvent>);

impl ControlEvents {
    /// Next event; `None` once the controller is gone
    pub async fn recv(&mut self) -> Option<ControlEvent> {
        self.0.recv().await
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.requested.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Cancels a start that is still connecting or acquiring the microphone
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<StopSignal>);

impl StopHandle {
    pub fn request(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }
}

/// Per-session settings taken from [`Config`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub policy: CapturePolicy,
    pub preamble: String,
    pub chunk_samples: usize,
    pub endpoint: EndpointConfig,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            policy: config.capture.policy,
            preamble: config.preamble.clone(),
            chunk_samples: config.capture.chunk_samples,
            endpoint: config.capture.endpoint,
        }
    }
}

enum Binding {
    /// The forwarder task owns the remote session
    Streaming { forwarder: JoinHandle<()> },
    Batch {
        session: Box<dyn RemoteSession>,
        recorder: Recorder,
        sample_rate: u32,
    },
}

enum PendingBinding {
    Streaming(mpsc::Receiver<Vec<f32>>),
    Batch(Recorder),
}

struct ActiveSession {
    generation: u64,
    /// `None` once the microphone has been released
    capture: Option<Box<dyn CaptureHandle>>,
    binding: Binding,
    responses: JoinHandle<()>,
}

/// Drives capture sessions from a single start/stop toggle
pub struct VoiceController {
    settings: SessionSettings,
    input: Arc<dyn InputDevice>,
    connector: Arc<dyn SessionConnector>,
    sequencer: PlaybackSequencer,
    codec: Arc<dyn TransportCodec>,
    state: CaptureState,
    generation: u64,
    active: Option<ActiveSession>,
    stop_signal: Arc<StopSignal>,
    events: mpsc::UnboundedSender<ControlEvent>,
    status: watch::Sender<Status>,
    transcript: Arc<watch::Sender<String>>,
}

impl std::fmt::Debug for VoiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceController")
            .field("policy", &self.settings.policy)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("active", &self.active.is_some())
            .finish_non_exhaustive()
    }
}

impl VoiceController {
    /// Create a controller and the event receiver its owner must poll
    #[must_use]
    pub fn new(
        settings: SessionSettings,
        input: Arc<dyn InputDevice>,
        connector: Arc<dyn SessionConnector>,
        sequencer: PlaybackSequencer,
    ) -> (Self, ControlEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status::Ready);
        let (transcript, _) = watch::channel(String::new());

        let controller = Self {
            settings,
            input,
            connector,
            sequencer,
            codec: Arc::new(Base64Codec),
            state: CaptureState::Idle,
            generation: 0,
            active: None,
            stop_signal: Arc::new(StopSignal::default()),
            events,
            status,
            transcript: Arc::new(transcript),
        };

        (controller, ControlEvents(events_rx))
    }

    /// Replace the transport codec
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn TransportCodec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub const fn state(&self) -> CaptureState {
        self.state
    }

    /// Whether a remote session is still referenced
    #[must_use]
    pub const fn has_session(&self) -> bool {
        self.active.is_some()
    }

    /// Whether the microphone is held
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.capture.is_some())
    }

    /// Current status line
    #[must_use]
    pub fn current_status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Subscribe to the running transcript
    #[must_use]
    pub fn transcript(&self) -> watch::Receiver<String> {
        self.transcript.subscribe()
    }

    /// Handle for cancelling a start in progress
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_signal))
    }

    #[must_use]
    pub const fn sequencer(&self) -> &PlaybackSequencer {
        &self.sequencer
    }

    /// The single user control: start when idle, stop otherwise
    pub async fn toggle(&mut self) {
        match self.state {
            CaptureState::Capturing => self.stop().await,
            CaptureState::Idle if self.active.is_some() => {
                tracing::info!("reply cancelled");
                self.teardown().await;
                self.status.send_replace(Status::Ready);
            }
            CaptureState::Idle => self.start().await,
            state => tracing::debug!(?state, "toggle ignored during transition"),
        }
    }

    /// Open a remote session and start capturing
    pub async fn start(&mut self) {
        if self.active.is_some() {
            self.teardown().await;
        }

        self.stop_signal.reset();
        self.generation += 1;
        let generation = self.generation;
        self.state = CaptureState::RequestingDevice;
        self.transcript.send_replace(String::new());
        self.status.send_replace(Status::Connecting);
        tracing::info!(generation, policy = %self.settings.policy, "starting capture session");

        let signal = Arc::clone(&self.stop_signal);
        let connector = Arc::clone(&self.connector);
        let preamble = self.settings.preamble.clone();

        let connected = tokio::select! {
            biased;
            () = signal.wait() => None,
            result = connector.connect(&preamble) => Some(result),
        };
        let Some(connected) = connected else {
            self.cancelled();
            return;
        };
        let (session, responses) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        let responses = tokio::spawn(pump_responses(
            responses,
            self.sequencer.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.transcript),
            self.events.clone(),
            generation,
        ));

        let (sink, pending) = match self.settings.policy {
            CapturePolicy::Streaming => {
                let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
                let sink = streaming_sink(self.settings.chunk_samples, chunk_tx);
                (sink, PendingBinding::Streaming(chunk_rx))
            }
            CapturePolicy::Batch => {
                let recorder = Recorder::new();
                (recorder.sink(), PendingBinding::Batch(recorder))
            }
        };

        let input = Arc::clone(&self.input);
        let mut opening = tokio::task::spawn_blocking(move || input.open(sink));
        let opened = tokio::select! {
            biased;
            () = signal.wait() => None,
            joined = &mut opening => Some(joined),
        };

        let Some(joined) = opened else {
            // The device may still open after we gave up; release it when it does
            tokio::spawn(async move {
                if let Ok(Ok(mut handle)) = opening.await {
                    handle.stop();
                }
            });
            drop(session);
            abort_and_wait(responses).await;
            self.cancelled();
            return;
        };

        let capture = match joined {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                drop(session);
                abort_and_wait(responses).await;
                self.fail(e).await;
                return;
            }
            Err(e) => {
                drop(session);
                abort_and_wait(responses).await;
                self.fail(Error::Audio(e.to_string())).await;
                return;
            }
        };

        let sample_rate = capture.sample_rate();
        let binding = match pending {
            PendingBinding::Streaming(chunk_rx) => {
                let detector = UtteranceDetector::new(sample_rate, self.settings.endpoint);
                Binding::Streaming {
                    forwarder: tokio::spawn(forward_chunks(
                        session,
                        chunk_rx,
                        detector,
                        self.events.clone(),
                        generation,
                    )),
                }
            }
            PendingBinding::Batch(recorder) => Binding::Batch {
                session,
                recorder,
                sample_rate,
            },
        };

        self.active = Some(ActiveSession {
            generation,
            capture: Some(capture),
            binding,
            responses,
        });
        self.state = CaptureState::Capturing;
        self.status.send_replace(Status::Listening);
        tracing::info!(generation, sample_rate, "capturing");
    }

    /// Stop capturing
    ///
    /// Streaming sessions are torn down completely. Batch sessions release
    /// the microphone and send the recording, keeping the remote session
    /// until its reply finishes.
    pub async fn stop(&mut self) {
        if self.state != CaptureState::Capturing {
            return;
        }

        if self.settings.policy == CapturePolicy::Streaming {
            self.teardown().await;
            self.status.send_replace(Status::Ready);
            tracing::info!("capture stopped");
            return;
        }

        self.state = CaptureState::Stopping;
        let Some(active) = self.active.as_mut() else {
            self.state = CaptureState::Idle;
            return;
        };

        if let Some(mut capture) = active.capture.take() {
            capture.stop();
        }

        let Binding::Batch {
            session,
            recorder,
            sample_rate,
        } = &mut active.binding
        else {
            return;
        };

        let samples = recorder.take();
        if samples.is_empty() {
            tracing::info!("nothing recorded");
            self.teardown().await;
            self.status.send_replace(Status::Ready);
            return;
        }

        tracing::info!(samples = samples.len(), "sending recording");
        let sent = match samples_to_wav(&samples, *sample_rate) {
            Ok(wav) => {
                session
                    .send_attachment(Attachment {
                        mime_type: "audio/wav".to_string(),
                        data: self.codec.encode(&wav),
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                self.state = CaptureState::Idle;
                self.status.send_replace(Status::AwaitingReply);
            }
            Err(e) => self.fail(e).await,
        }
    }

    /// Apply an asynchronous session outcome
    pub async fn handle(&mut self, event: ControlEvent) {
        let current = self.active.as_ref().map(|a| a.generation);
        if current != Some(event.generation()) {
            tracing::trace!(?event, "ignoring event from a closed session");
            return;
        }

        match event {
            ControlEvent::StreamFailed { error, .. } => self.fail(error).await,
            ControlEvent::TurnComplete { .. } => {
                if !self.is_capturing() {
                    tracing::debug!("reply complete");
                    self.teardown().await;
                    self.status.send_replace(Status::Ready);
                }
            }
            ControlEvent::StreamClosed { .. } => {
                tracing::info!("remote session ended");
                self.teardown().await;
                self.status.send_replace(Status::Ready);
            }
        }
    }

    /// Release everything before exit
    pub async fn shutdown(&mut self) {
        self.stop_signal.reset();
        self.teardown().await;
    }

    async fn fail(&mut self, error: Error) {
        tracing::warn!(error = %error, state = ?self.state, "capture session failed");
        self.state = CaptureState::Error;
        self.teardown().await;
        self.status.send_replace(Status::Failed(error.user_message()));
    }

    fn cancelled(&mut self) {
        tracing::info!("start cancelled");
        self.state = CaptureState::Idle;
        self.status.send_replace(Status::Ready);
    }

    /// Release the microphone, the forwarder, and the session reference
    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            self.state = CaptureState::Idle;
            return;
        };

        if self.state == CaptureState::Capturing {
            self.state = CaptureState::Stopping;
        }

        if let Some(mut capture) = active.capture {
            capture.stop();
        }
        match active.binding {
            Binding::Streaming { forwarder } => abort_and_wait(forwarder).await,
            Binding::Batch { session, .. } => drop(session),
        }
        abort_and_wait(active.responses).await;

        tracing::debug!(generation = active.generation, "capture session released");
        self.state = CaptureState::Idle;
    }
}

/// Abort a task and wait until its future (and everything it owns) is dropped
async fn abort_and_wait(task: JoinHandle<()>) {
    task.abort();
    let _ = task.await;
}

/// Sink that cuts captured audio into blocks and queues them for forwarding
fn streaming_sink(block: usize, chunks: mpsc::Sender<Vec<f32>>) -> ChunkSink {
    let mut chunker = Chunker::new(block);
    Box::new(move |samples| {
        chunker.push(samples, |chunk| {
            if let Err(mpsc::error::TrySendError::Full(_)) = chunks.try_send(chunk) {
                tracing::warn!("chunk queue full, dropping audio block");
            }
        });
    })
}

/// Forward streamed blocks to the session, closing turns at utterance ends
async fn forward_chunks(
    mut session: Box<dyn RemoteSession>,
    mut chunks: mpsc::Receiver<Vec<f32>>,
    mut detector: UtteranceDetector,
    events: mpsc::UnboundedSender<ControlEvent>,
    generation: u64,
) {
    while let Some(chunk) = chunks.recv().await {
        if let Err(error) = session.send_chunk(&chunk).await {
            let _ = events.send(ControlEvent::StreamFailed { generation, error });
            return;
        }

        let result = if detector.process(&chunk) {
            tracing::debug!("utterance ended, requesting reply");
            session.end_turn().await
        } else if detector.state() == EndpointState::Idle {
            // Nobody is talking: only a short lead-in is worth sending later
            session.trim_turn(detector.pre_roll_samples()).await
        } else {
            Ok(())
        };

        if let Err(error) = result {
            let _ = events.send(ControlEvent::StreamFailed { generation, error });
            return;
        }
    }
}

/// Route response events: text to the transcript, audio to the sequencer
async fn pump_responses(
    mut responses: ResponseStream,
    sequencer: PlaybackSequencer,
    codec: Arc<dyn TransportCodec>,
    transcript: Arc<watch::Sender<String>>,
    events: mpsc::UnboundedSender<ControlEvent>,
    generation: u64,
) {
    while let Some(item) = responses.recv().await {
        let event = match item {
            Ok(event) => event,
            Err(error) => {
                let _ = events.send(ControlEvent::StreamFailed { generation, error });
                return;
            }
        };

        if let Some(text) = event.text {
            transcript.send_modify(|t| t.push_str(&text));
        }

        if let Some(audio) = event.audio {
            match AudioFragment::from_transport(codec.as_ref(), &audio.data, audio.mime_type) {
                Ok(fragment) => sequencer.enqueue(fragment),
                Err(e) => tracing::warn!(error = %e, "dropping undecodable audio payload"),
            }
        }

        if event.turn_complete {
            let _ = events.send(ControlEvent::TurnComplete { generation });
        }
    }

    let _ = events.send(ControlEvent::StreamClosed { generation });
}
