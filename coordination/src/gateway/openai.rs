//! OpenAI-compatible chat completions adapter.
//!
//! Works against any endpoint that speaks `POST {base_url}/chat/completions`
//! (OpenAI, vLLM, llama.cpp server, most proxies). Streaming responses are
//! server-sent events decoded by `eventsource-stream`; each event carries one
//! JSON delta and the stream ends with `data: [DONE]`.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::provider::{
    ChatMessage, ChunkStream, GenerateOptions, LlmResponse, ProviderAdapter, ProviderError,
    ProviderErrorKind, TokenUsage,
};

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatConfig {
    /// Provider name used in logs and breaker bookkeeping.
    pub name: String,
    /// Base URL without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    /// Bearer token. Local servers usually need none.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Chat completions client for one endpoint.
pub struct OpenAiCompatProvider {
    config: OpenAiCompatConfig,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| ProviderError::other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }
        let response = request.send().await.map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }
        Ok(response)
    }
}

fn map_reqwest(e: reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else if e.is_connect() || e.is_request() {
        ProviderErrorKind::Network
    } else if let Some(status) = e.status() {
        return ProviderError::from_status(status.as_u16(), &e.to_string());
    } else {
        ProviderErrorKind::Other
    };
    ProviderError::new(kind, e.to_string())
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_available(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<LlmResponse, ProviderError> {
        let body = self.request_body(messages, options, false);
        let response = self.send(&body).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::other(format!("unparseable completion: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::other("completion had no content"))?;
        Ok(LlmResponse {
            content,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let body = self.request_body(messages, options, true);
        let response = self.send(&body).await?;
        debug!(provider = %self.config.name, "SSE stream opened");
        Ok(delta_stream(response.bytes_stream(), map_reqwest))
    }
}

/// Decode an SSE byte stream into completion text chunks.
///
/// Ends at `[DONE]`, at end of input, or after the first error item.
fn delta_stream<S, B, E>(bytes: S, map_transport: fn(E) -> ProviderError) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = Box::pin(bytes.eventsource());
    let stream = futures::stream::unfold(Some(events), move |events| async move {
        let mut events = events?;
        loop {
            let event = match events.next().await? {
                Ok(event) => event,
                Err(EventStreamError::Transport(e)) => return Some((Err(map_transport(e)), None)),
                Err(e) => {
                    let err = ProviderError::other(format!("malformed event stream: {e}"));
                    return Some((Err(err), None));
                }
            };
            let data = event.data.trim();
            if data == "[DONE]" {
                return None;
            }
            if data.is_empty() {
                continue;
            }
            match parse_delta(data) {
                Ok(Some(text)) => return Some((Ok(text), Some(events))),
                Ok(None) => {}
                Err(e) => return Some((Err(e), None)),
            }
        }
    });
    Box::pin(stream)
}

fn parse_delta(payload: &str) -> Result<Option<String>, ProviderError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| ProviderError::other(format!("malformed stream event: {e}")))?;
    if let Some(err) = value.get("error") {
        let message = err["message"].as_str().unwrap_or("stream error").to_string();
        return Err(ProviderError::other(message));
    }
    Ok(value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}
