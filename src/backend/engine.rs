//! Chat engine backend: an OpenAI-compatible chat completions server
//! (MLC LLM, llama.cpp server, vLLM and friends) streaming over SSE.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Backend, Outbox, StoppingCriteria, TokenRate};
use crate::consts::{MAX_NEW_TOKENS, TEMPERATURE};
use crate::error::BridgeError;
use crate::protocol::{ChatMessage, Reply};

/// [`Backend`] that talks to a chat engine over HTTP.
pub struct ChatEngineBackend {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    loaded: AtomicBool,
    stop: StoppingCriteria,
}

impl ChatEngineBackend {
    /// `endpoint` is the API base, e.g. `http://127.0.0.1:8000/v1`.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
            loaded: AtomicBool::new(false),
            stop: StoppingCriteria::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn post_completion(&self, body: &ApiRequest<'_>) -> Result<reqwest::Response, BridgeError> {
        let resp = self
            .authorize(self.client.post(self.url("chat/completions")))
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BridgeError::BackendFault(format!(
                "chat engine error ({status}): {text}"
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Backend for ChatEngineBackend {
    fn name(&self) -> &str {
        "engine"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn check_capability(&self) -> Result<(), BridgeError> {
        let resp = self
            .authorize(self.client.get(self.url("models")))
            .send()
            .await
            .map_err(|e| {
                BridgeError::CapabilityUnavailable(format!(
                    "chat engine unreachable at {}: {e}",
                    self.endpoint
                ))
            })?;

        if !resp.status().is_success() {
            return Err(BridgeError::CapabilityUnavailable(format!(
                "chat engine at {} answered {}",
                self.endpoint,
                resp.status()
            )));
        }

        match resp.json::<ModelList>().await {
            Ok(list) if !list.data.is_empty() => {
                if !list.data.iter().any(|m| m.id == self.model) {
                    let served: Vec<&str> = list.data.iter().map(|m| m.id.as_str()).collect();
                    return Err(BridgeError::CapabilityUnavailable(format!(
                        "model {} is not served (available: {})",
                        self.model,
                        served.join(", ")
                    )));
                }
            }
            Ok(_) => debug!("chat engine lists no models, assuming it serves {}", self.model),
            Err(e) => warn!("could not parse model list, continuing: {e}"),
        }
        Ok(())
    }

    async fn load(&self, outbox: &Outbox) -> Result<(), BridgeError> {
        if self.is_loaded() {
            return Ok(());
        }
        outbox.loading(format!("Initializing {}...", self.model));

        // The first request makes the engine page weights in.
        outbox.loading("Warming up (95%)...");
        let warm_up = [ChatMessage::user("a")];
        let body = ApiRequest {
            model: &self.model,
            messages: &warm_up,
            max_tokens: 1,
            temperature: TEMPERATURE,
            stream: false,
        };
        self.post_completion(&body).await?;

        self.loaded.store(true, Ordering::SeqCst);
        info!(model = %self.model, endpoint = %self.endpoint, "chat engine ready");
        Ok(())
    }

    async fn generate(&self, messages: &[ChatMessage], outbox: &Outbox) -> Result<String, BridgeError> {
        if !self.is_loaded() {
            return Err(BridgeError::NotReady);
        }

        let body = ApiRequest {
            model: &self.model,
            messages,
            max_tokens: MAX_NEW_TOKENS,
            temperature: TEMPERATURE,
            stream: true,
        };
        let resp = self.post_completion(&body).await?;

        let mut rate = TokenRate::new();
        let mut full = String::new();
        let mut decoder = SseDecoder::default();
        let mut body = resp.bytes_stream();

        'stream: while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for data in decoder.push(&chunk) {
                if self.stop.is_interrupted() {
                    debug!("generation interrupted");
                    break 'stream;
                }
                if data == "[DONE]" {
                    break 'stream;
                }
                let delta = match serde_json::from_str::<StreamChunk>(&data) {
                    Ok(chunk) => chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .unwrap_or_default(),
                    Err(e) => {
                        warn!("skipping unparseable stream chunk: {e}");
                        continue;
                    }
                };
                if delta.is_empty() {
                    continue;
                }
                rate.record_token();
                full.push_str(&delta);
                outbox.send(Reply::Update {
                    output: delta,
                    tps: rate.per_second(),
                    num_tokens: rate.tokens(),
                });
            }
        }

        Ok(full)
    }

    fn begin_generation(&self) {
        self.stop.reset();
    }

    fn interrupt(&self) {
        self.stop.interrupt();
    }

    async fn reset(&self) {
        // Each request carries its whole conversation; there is no cache to drop.
        self.stop.interrupt();
    }
}

/// Splits a server-sent event byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes; returns payloads of every complete `data:` line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim_end().strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

// --- API types ---

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    id: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
