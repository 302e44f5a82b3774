//! Voice controller integration tests
//!
//! Drives the toggle against fake hardware and a scripted backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use live_voice::voice::{EndpointConfig, PlaybackSequencer};
use live_voice::{
    Base64Codec, CapturePolicy, CaptureState, ControlEvent, ControlEvents, Error, RemoteSession,
    ResponseEvent, ResponseStream, Result, SessionConnector, SessionSettings, Status,
    TransportCodec, VoiceController,
};

mod common;

use common::{FakeConnector, FakeMicrophone, RecordingOutput, SessionCall, eventually};

fn settings(policy: CapturePolicy) -> SessionSettings {
    SessionSettings {
        policy,
        preamble: "be brief".to_string(),
        chunk_samples: 4,
        endpoint: EndpointConfig {
            min_speech_ms: 0,
            silence_ms: 0,
            pre_roll_ms: 0,
        },
    }
}

fn controller(
    policy: CapturePolicy,
    mic: &Arc<FakeMicrophone>,
    connector: Arc<dyn SessionConnector>,
    output: &Arc<RecordingOutput>,
) -> (VoiceController, ControlEvents) {
    VoiceController::new(
        settings(policy),
        mic.clone(),
        connector,
        PlaybackSequencer::new(output.clone()),
    )
}

fn audio(body: &str) -> Result<ResponseEvent> {
    Ok(ResponseEvent::audio(
        Base64Codec.encode(body.as_bytes()),
        Some("audio/wav".to_string()),
    ))
}

/// Deliver the next controller event
async fn pump_one(controller: &mut VoiceController, events: &mut ControlEvents) {
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no control event")
        .expect("event channel closed");
    controller.handle(event).await;
}

#[tokio::test]
async fn test_start_opens_session_then_microphone() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    assert_eq!(controller.current_status(), Status::Ready);
    controller.toggle().await;

    assert_eq!(controller.state(), CaptureState::Capturing);
    assert_eq!(controller.current_status(), Status::Listening);
    assert_eq!(connector.preambles(), vec!["be brief".to_string()]);
    assert_eq!(mic.opened(), 1);
    assert!(controller.is_capturing());
}

#[tokio::test]
async fn test_denied_microphone_reports_and_releases_session() {
    let mic = FakeMicrophone::denied();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;

    assert_eq!(controller.state(), CaptureState::Idle);
    assert_eq!(
        controller.current_status(),
        Status::Failed("Microphone access failed.")
    );
    assert!(!controller.has_session());
    assert!(connector.session_dropped());
}

#[tokio::test]
async fn test_connect_failure_never_touches_microphone() {
    let mic = FakeMicrophone::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) = controller(
        CapturePolicy::Streaming,
        &mic,
        FakeConnector::failing(),
        &output,
    );

    controller.toggle().await;

    assert_eq!(controller.state(), CaptureState::Idle);
    assert_eq!(
        controller.current_status(),
        Status::Failed("Failed to connect. Check API key.")
    );
    assert_eq!(mic.opened(), 0);
}

#[tokio::test]
async fn test_stop_releases_microphone_and_session() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;
    controller.toggle().await;

    // Released by the time stop returns
    assert!(mic.is_released());
    assert!(connector.session_dropped());
    assert!(!controller.has_session());
    assert_eq!(controller.state(), CaptureState::Idle);
    assert_eq!(controller.current_status(), Status::Ready);
}

#[tokio::test]
async fn test_streaming_forwards_blocks_and_closes_turns() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;

    // Blocks are cut at four samples regardless of how the device delivers
    mic.feed(&[0.5; 6]);
    mic.feed(&[0.0; 2]);
    mic.feed(&[0.0; 4]);
    mic.feed(&[0.0; 3]);

    assert!(
        eventually(|| connector.calls()
            == vec![
                SessionCall::Chunk(4),
                SessionCall::Chunk(4),
                SessionCall::Chunk(4),
                SessionCall::EndTurn,
            ])
        .await,
        "calls were {:?}",
        connector.calls()
    );
}

#[tokio::test]
async fn test_streaming_trims_audio_before_speech() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;

    // Two silent blocks, then a short utterance
    mic.feed(&[0.0; 8]);
    mic.feed(&[0.5; 4]);
    mic.feed(&[0.0; 4]);

    assert!(
        eventually(|| connector.calls()
            == vec![
                SessionCall::Chunk(4),
                SessionCall::Trim(0),
                SessionCall::Chunk(4),
                SessionCall::Trim(0),
                SessionCall::Chunk(4),
                SessionCall::Chunk(4),
                SessionCall::EndTurn,
            ])
        .await,
        "calls were {:?}",
        connector.calls()
    );

    // Back to idle after the turn: trimming resumes
    mic.feed(&[0.0; 4]);
    assert!(
        eventually(|| connector.calls().last() == Some(&SessionCall::Trim(0))).await,
        "calls were {:?}",
        connector.calls()
    );
}

#[tokio::test]
async fn test_reply_audio_plays_in_arrival_order() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;
    connector.respond(audio("A")).await;
    connector.respond(audio("B")).await;
    connector.respond(audio("C")).await;

    assert!(eventually(|| output.played().len() == 3).await);
    controller.sequencer().wait_idle().await;

    assert_eq!(output.played(), vec!["A", "B", "C"]);
    assert_eq!(output.max_concurrent(), 1);
}

#[tokio::test]
async fn test_undecodable_fragments_are_skipped() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;
    connector.respond(audio("bad data")).await;
    connector
        .respond(Ok(ResponseEvent::audio("!!not base64!!", None)))
        .await;
    connector.respond(audio("ok")).await;

    assert!(eventually(|| output.played() == vec!["ok"]).await);
    assert!(eventually(|| controller.sequencer().skipped() == 1).await);
    assert_eq!(controller.state(), CaptureState::Capturing);
}

#[tokio::test]
async fn test_transcript_accumulates_and_resets_on_start() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);
    let transcript = controller.transcript();

    controller.toggle().await;
    connector.respond(Ok(ResponseEvent::text("Hel"))).await;
    connector.respond(Ok(ResponseEvent::text("lo"))).await;

    assert!(eventually(|| *transcript.borrow() == "Hello").await);

    controller.toggle().await;
    assert_eq!(*transcript.borrow(), "Hello");

    controller.toggle().await;
    assert_eq!(*transcript.borrow(), "");
}

#[tokio::test]
async fn test_stream_error_tears_session_down() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, mut events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;
    connector
        .respond(Err(Error::RemoteStreamError("connection reset".to_string())))
        .await;
    pump_one(&mut controller, &mut events).await;

    assert_eq!(controller.state(), CaptureState::Idle);
    assert_eq!(controller.current_status(), Status::Failed("Error. Try again."));
    assert!(mic.is_released());
    assert!(connector.session_dropped());
}

#[tokio::test]
async fn test_stream_end_returns_to_idle() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, mut events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;
    connector.close_stream();
    pump_one(&mut controller, &mut events).await;

    assert_eq!(controller.state(), CaptureState::Idle);
    assert_eq!(controller.current_status(), Status::Ready);
    assert!(mic.is_released());
}

#[tokio::test]
async fn test_events_from_old_sessions_are_ignored() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Streaming, &mic, connector.clone(), &output);

    controller.toggle().await;
    controller
        .handle(ControlEvent::StreamFailed {
            generation: 0,
            error: Error::RemoteStreamError("stale".to_string()),
        })
        .await;

    assert_eq!(controller.state(), CaptureState::Capturing);
    assert!(!mic.is_released());
}

#[tokio::test]
async fn test_batch_sends_recording_and_waits_for_reply() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, mut events) =
        controller(CapturePolicy::Batch, &mic, connector.clone(), &output);

    controller.toggle().await;
    mic.feed(&[0.25; 160]);
    mic.feed(&[-0.25; 160]);
    controller.toggle().await;

    // Microphone is free but the session stays open for the reply
    assert!(mic.is_released());
    assert!(controller.has_session());
    assert!(!connector.session_dropped());
    assert_eq!(controller.current_status(), Status::AwaitingReply);

    let calls = connector.calls();
    assert_eq!(calls.len(), 1);
    let SessionCall::Attachment { mime_type, data } = &calls[0] else {
        panic!("expected an attachment, got {calls:?}");
    };
    assert_eq!(mime_type, "audio/wav");
    let wav = Base64Codec.decode(data).unwrap();
    let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
    assert_eq!(reader.spec().sample_rate, 16000);
    assert_eq!(reader.len(), 320);

    connector.respond(audio("reply")).await;
    connector
        .respond(Ok(ResponseEvent::turn_complete()))
        .await;
    pump_one(&mut controller, &mut events).await;

    assert!(connector.session_dropped());
    assert!(!controller.has_session());
    assert_eq!(controller.current_status(), Status::Ready);
    assert!(eventually(|| output.played() == vec!["reply"]).await);
}

#[tokio::test]
async fn test_batch_with_nothing_recorded_sends_nothing() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Batch, &mic, connector.clone(), &output);

    controller.toggle().await;
    controller.toggle().await;

    assert!(connector.calls().is_empty());
    assert!(connector.session_dropped());
    assert_eq!(controller.current_status(), Status::Ready);
}

#[tokio::test]
async fn test_toggle_while_awaiting_reply_cancels_it() {
    let mic = FakeMicrophone::new();
    let connector = FakeConnector::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) =
        controller(CapturePolicy::Batch, &mic, connector.clone(), &output);

    controller.toggle().await;
    mic.feed(&[0.25; 32]);
    controller.toggle().await;
    assert!(controller.has_session());

    controller.toggle().await;

    assert!(connector.session_dropped());
    assert_eq!(controller.state(), CaptureState::Idle);
    assert_eq!(controller.current_status(), Status::Ready);
    assert_eq!(mic.opened(), 1);
}

/// Backend whose handshake never finishes
struct HangingConnector;

#[async_trait]
impl SessionConnector for HangingConnector {
    async fn connect(&self, _preamble: &str) -> Result<(Box<dyn RemoteSession>, ResponseStream)> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_stop_during_connect_cancels_start() {
    let mic = FakeMicrophone::new();
    let output = RecordingOutput::new();
    let (mut controller, _events) = controller(
        CapturePolicy::Streaming,
        &mic,
        Arc::new(HangingConnector),
        &output,
    );
    let stop = controller.stop_handle();

    tokio::join!(controller.toggle(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.request();
    });

    assert_eq!(controller.state(), CaptureState::Idle);
    assert_eq!(controller.current_status(), Status::Ready);
    assert_eq!(mic.opened(), 0);
}
