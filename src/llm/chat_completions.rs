//! OpenAI-compatible Chat Completions streaming client.
//!
//! This module implements [`UpstreamStream`] for `/v1/chat/completions`
//! with `stream: true`. The response body is read as an event stream of
//! `data: <json>` lines terminated by `data: [DONE]`.

use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::RelayError;

use super::{Delta, DeltaStream, LlmSettings, Provider, Turn, UpstreamStream};

/// Sentinel payload that closes the event stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Client for the Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsClient {
    /// Create a new client with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, transcript: &[Turn]) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model,
            "messages": transcript,
            "stream": true,
            "max_tokens": self.settings.max_tokens,
        })
    }
}

#[async_trait::async_trait]
impl UpstreamStream for ChatCompletionsClient {
    async fn stream(&self, transcript: &[Turn]) -> Result<DeltaStream, RelayError> {
        let url = self.settings.provider.chat_url(&self.settings.base_url)?;

        debug!(
            name: "upstream.request",
            url = %url,
            model = %self.settings.model,
            turns = transcript.len(),
            "Sending transcript upstream"
        );

        let mut rb = self.http.post(url).json(&self.request_body(transcript));
        if let Some(k) = &self.settings.api_key {
            rb = match self.settings.provider {
                Provider::AzureOpenAI { .. } => rb.header("api-key", k),
                _ => rb.bearer_auth(k),
            };
        }
        for (name, value) in self.settings.provider.extra_headers() {
            rb = rb.header(*name, *value);
        }

        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Upstream(format!("{status}: {body}")));
        }
        let byte_stream = resp.bytes_stream();

        let out = async_stream::stream! {
            let mut lines = SseLineBuffer::default();

            futures::pin_mut!(byte_stream);
            'read: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(RelayError::from(e));
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    match parse_data_line(&line) {
                        DataLine::Fragment(text) => yield Ok(Delta::fragment(text)),
                        DataLine::Done => {
                            debug!(name: "upstream.done", "Upstream stream completed");
                            break 'read;
                        }
                        DataLine::Ignored => {}
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Splits a byte stream into complete text lines.
///
/// Bytes after the last newline are held back until the next push, so a
/// line split across network chunks is only emitted once it is whole.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    /// Append `bytes` and drain every complete line (without the line
    /// terminator).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.drain(..=pos).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

/// Interpretation of one event-stream line.
#[derive(Debug, PartialEq, Eq)]
pub enum DataLine {
    /// A non-empty text fragment.
    Fragment(String),
    /// The end-of-stream sentinel.
    Done,
    /// Not a data line, an empty delta, or an undecodable payload.
    Ignored,
}

/// Parse one line of the event stream.
///
/// Malformed JSON payloads are logged and ignored; they never end the
/// stream.
pub fn parse_data_line(line: &str) -> DataLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return DataLine::Ignored;
    };
    let data = data.trim();

    if data == DONE_SENTINEL {
        return DataLine::Done;
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(name: "upstream.decode_failed", payload = %data, error = %e, "Skipping malformed event payload");
            return DataLine::Ignored;
        }
    };

    match value["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => DataLine::Fragment(text.to_string()),
        _ => DataLine::Ignored,
    }
}
