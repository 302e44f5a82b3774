//! Gemini backend over HTTP streaming (SSE)
//!
//! Each user turn is posted to `streamGenerateContent?alt=sse` with the
//! conversation history. Answered voice turns stay in the history as short
//! text notes so only the newest turn carries audio. Turns are handled one at a time by a worker task so
//! replies never interleave; the worker owns the history and the response
//! sender, and the response stream closes when the worker exits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    Attachment, EncodedAudio, RemoteSession, ResponseEvent, ResponseStream, SessionConnector,
    SseDecoder,
};
use crate::codec::{Base64Codec, TransportCodec};
use crate::config::RemoteConfig;
use crate::voice::samples_to_wav;
use crate::{Error, Result};

/// Model acknowledgement that follows the preamble in the seeded history
pub const READY_ACK: &str = "OK, I'm ready to help!";

/// Preamble and acknowledgement that open every history
const SEEDED_TURNS: usize = 2;

/// Buffered response events per session
const EVENT_BUFFER: usize = 64;

/// Stands in for user audio once its turn has been answered
const PAST_AUDIO_NOTE: &str = "[earlier voice message]";

/// Stands in for a reply that carried no text
const SPOKEN_REPLY_NOTE: &str = "[spoken reply]";

/// Longest streamed turn before it is sent without waiting for silence
pub const MAX_TURN_SECS: u32 = 30;

/// Opens Gemini sessions
pub struct GeminiConnector {
    client: reqwest::Client,
    config: RemoteConfig,
    sample_rate: u32,
    codec: Arc<dyn TransportCodec>,
}

impl std::fmt::Debug for GeminiConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConnector")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl GeminiConnector {
    /// Create a connector for audio captured at `sample_rate`
    #[must_use]
    pub fn new(config: &RemoteConfig, sample_rate: u32) -> Self {
        Self::with_codec(config, sample_rate, Arc::new(Base64Codec))
    }

    /// Create a connector with a custom transport codec
    #[must_use]
    pub fn with_codec(
        config: &RemoteConfig,
        sample_rate: u32,
        codec: Arc<dyn TransportCodec>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: config.clone(),
            sample_rate,
            codec,
        }
    }

    fn model_url(&self) -> String {
        format!(
            "{}/models/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl SessionConnector for GeminiConnector {
    async fn connect(&self, preamble: &str) -> Result<(Box<dyn RemoteSession>, ResponseStream)> {
        let api_key = self
            .config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::RemoteConnectFailed("GEMINI_API_KEY is not set".to_string()))?;

        // Handshake: make sure the key and model are accepted before opening the mic
        let model_url = self.model_url();
        let response = self
            .client
            .get(&model_url)
            .header("x-goog-api-key", &api_key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Gemini handshake request failed");
                Error::RemoteConnectFailed(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Gemini handshake rejected");
            return Err(Error::RemoteConnectFailed(format!(
                "Gemini API error {status}: {body}"
            )));
        }

        tracing::info!(model = %self.config.model, "Gemini session opened");

        let generation_config = (!self.config.response_modalities.is_empty()).then(|| {
            GenerationConfig {
                response_modalities: self.config.response_modalities.clone(),
            }
        });

        let worker = TurnWorker {
            client: self.client.clone(),
            url: format!("{model_url}:streamGenerateContent?alt=sse"),
            api_key,
            history: vec![Content::user_text(preamble), Content::model_text(READY_ACK)],
            generation_config,
        };

        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(worker.run(turn_rx, event_tx));

        let session = GeminiSession {
            turns: turn_tx,
            worker: handle,
            pending: Vec::new(),
            sample_rate: self.sample_rate,
            codec: Arc::clone(&self.codec),
        };

        Ok((Box::new(session), event_rx))
    }
}

/// Client half of an open Gemini session
struct GeminiSession {
    turns: mpsc::UnboundedSender<Content>,
    worker: JoinHandle<()>,
    /// Samples streamed since the last turn boundary
    pending: Vec<f32>,
    sample_rate: u32,
    codec: Arc<dyn TransportCodec>,
}

impl GeminiSession {
    fn max_turn_samples(&self) -> usize {
        self.sample_rate as usize * MAX_TURN_SECS as usize
    }

    fn flush_turn(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let samples = std::mem::take(&mut self.pending);
        let wav = samples_to_wav(&samples, self.sample_rate)?;
        self.queue_turn(Attachment {
            mime_type: "audio/wav".to_string(),
            data: self.codec.encode(&wav),
        })
    }

    fn queue_turn(&self, attachment: Attachment) -> Result<()> {
        tracing::debug!(
            mime_type = %attachment.mime_type,
            encoded_len = attachment.data.len(),
            "queueing user turn"
        );
        self.turns
            .send(Content::user_audio(attachment))
            .map_err(|_| Error::RemoteStreamError("session closed".to_string()))
    }
}

#[async_trait]
impl RemoteSession for GeminiSession {
    async fn send_chunk(&mut self, samples: &[f32]) -> Result<()> {
        if self.turns.is_closed() {
            return Err(Error::RemoteStreamError("session closed".to_string()));
        }
        self.pending.extend_from_slice(samples);

        if self.pending.len() >= self.max_turn_samples() {
            tracing::warn!(
                samples = self.pending.len(),
                "streamed turn hit the length limit, sending it now"
            );
            self.flush_turn()?;
        }
        Ok(())
    }

    async fn end_turn(&mut self) -> Result<()> {
        self.flush_turn()
    }

    async fn trim_turn(&mut self, keep: usize) -> Result<()> {
        let excess = self.pending.len().saturating_sub(keep);
        if excess > 0 {
            self.pending.drain(..excess);
            tracing::trace!(dropped = excess, kept = self.pending.len(), "trimmed leading audio");
        }
        Ok(())
    }

    async fn send_attachment(&mut self, attachment: Attachment) -> Result<()> {
        self.queue_turn(attachment)
    }
}

impl Drop for GeminiSession {
    fn drop(&mut self) {
        self.worker.abort();
        tracing::debug!("Gemini session closed");
    }
}

/// Owns the history and runs turns sequentially
struct TurnWorker {
    client: reqwest::Client,
    url: String,
    api_key: String,
    history: Vec<Content>,
    generation_config: Option<GenerationConfig>,
}

impl TurnWorker {
    async fn run(
        mut self,
        mut turns: mpsc::UnboundedReceiver<Content>,
        events: mpsc::Sender<Result<ResponseEvent>>,
    ) {
        while let Some(user) = turns.recv().await {
            self.history.push(user);

            match self.stream_turn(&events).await {
                Ok(reply) => {
                    // Only the turn being answered carries audio
                    if let Some(answered) = self.history.last_mut() {
                        answered.drop_audio();
                    }
                    let reply = if reply.is_empty() {
                        SPOKEN_REPLY_NOTE.to_string()
                    } else {
                        reply
                    };
                    self.history.push(Content::model_text(reply));

                    if events.send(Ok(ResponseEvent::turn_complete())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Gemini turn failed");
                    let _ = events.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    fn is_first_turn(&self) -> bool {
        self.history.len() == SEEDED_TURNS + 1
    }

    /// Post the history and forward every streamed part; returns the reply text
    async fn stream_turn(&self, events: &mpsc::Sender<Result<ResponseEvent>>) -> Result<String> {
        let request = GenerateRequest {
            contents: &self.history,
            generation_config: self.generation_config.as_ref(),
        };

        let response = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::RemoteStreamError(e.to_string()))?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Gemini API error {status}: {body}");

            // A rejected first turn means the session never really opened
            let rejected = matches!(status.as_u16(), 401 | 403 | 404);
            return Err(if rejected && self.is_first_turn() {
                Error::RemoteConnectFailed(message)
            } else {
                Error::RemoteStreamError(message)
            });
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut reply = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::RemoteStreamError(e.to_string()))?;
            for payload in decoder.push(&chunk) {
                forward(&payload, events, &mut reply).await?;
            }
        }
        if let Some(payload) = decoder.finish() {
            forward(&payload, events, &mut reply).await?;
        }

        tracing::debug!(reply_chars = reply.len(), "turn complete");
        Ok(reply)
    }
}

async fn forward(
    payload: &str,
    events: &mpsc::Sender<Result<ResponseEvent>>,
    reply: &mut String,
) -> Result<()> {
    for event in response_events(payload)? {
        if let Some(text) = &event.text {
            reply.push_str(text);
        }
        events
            .send(Ok(event))
            .await
            .map_err(|_| Error::RemoteStreamError("response stream closed".to_string()))?;
    }
    Ok(())
}

/// Parse one SSE payload into response events, one per content part
pub(crate) fn response_events(payload: &str) -> Result<Vec<ResponseEvent>> {
    let response: GenerateResponse = serde_json::from_str(payload)
        .map_err(|e| Error::RemoteStreamError(format!("malformed response: {e}")))?;

    if let Some(error) = response.error {
        return Err(Error::RemoteStreamError(format!(
            "Gemini API error {}: {}",
            error.code, error.message
        )));
    }

    let events = response
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|c| c.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| {
            let audio = part
                .inline_data
                .filter(|d| d.mime_type.starts_with("audio/"))
                .map(|d| EncodedAudio {
                    data: d.data,
                    mime_type: Some(d.mime_type),
                });
            let text = part.text.filter(|t| !t.is_empty());
            (text.is_some() || audio.is_some()).then_some(ResponseEvent {
                text,
                audio,
                turn_complete: false,
            })
        })
        .collect();

    Ok(events)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn user_text(text: &str) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }

    fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("model".to_string()),
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }

    /// Replace inline audio with a short note
    fn drop_audio(&mut self) {
        for part in &mut self.parts {
            if part.inline_data.take().is_some() {
                part.text = Some(PAST_AUDIO_NOTE.to_string());
            }
        }
    }

    fn user_audio(attachment: Attachment) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: attachment.mime_type,
                    data: attachment.data,
                }),
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<&'a GenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}
