//! OpenAI-compatible chat client (blocking) with SSE streaming.
//!
//! The conversation layer drives this from its own worker thread, so the
//! client is plain blocking reqwest. Streaming responses arrive as
//! `data: …\n\n` server-sent events terminated by `[DONE]`; parsing is a
//! buffer-and-scan over event boundaries. Transient upstream failures
//! (429 and the 5xx gateway family) are retried with exponential backoff
//! capped at two seconds.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP statuses worth retrying.
const RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Exponential backoff: base doubling per attempt, capped here.
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 2000;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_RETRY: u32 = 3;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authorization failed: {0}")]
    Authorization(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limited: {0}")]
    RateLimit(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Response parse error: {0}")]
    Parser(String),
    #[error("Request aborted")]
    Aborted,
    #[error("Unknown LLM error: {0}")]
    Unknown(String),
}

fn map_status(status: u16, detail: String) -> LlmError {
    match status {
        400 => LlmError::InvalidArgument(detail),
        401 | 403 => LlmError::Authorization(detail),
        404 => LlmError::NotFound(detail),
        429 => LlmError::RateLimit(detail),
        500..=599 => LlmError::Network(detail),
        _ => LlmError::Unknown(format!("HTTP {}: {}", status, detail)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Pull complete SSE events out of `buffer` (delimited by `\n\n`) and feed
/// each `data: ` payload to `on_data`. Returns true once `[DONE]` is seen.
/// Partial trailing events stay in the buffer for the next read.
fn drain_sse_events(buffer: &mut Vec<u8>, mut on_data: impl FnMut(&str)) -> bool {
    loop {
        let boundary = buffer.windows(2).position(|w| w == b"\n\n");
        let Some(pos) = boundary else {
            return false;
        };
        let event: Vec<u8> = buffer.drain(..pos + 2).collect();
        let event = String::from_utf8_lossy(&event);
        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data.trim() == "[DONE]" {
                    return true;
                }
                on_data(data);
            }
        }
    }
}

/// Blocking chat-completions client for one endpoint.
pub struct LlmClient {
    http: reqwest::blocking::Client,
    api_url: String,
    api_key: String,
    max_retry: u32,
    stop: AtomicBool,
}

impl LlmClient {
    pub fn new(api_key: &str, api_url: &str) -> Result<Self, LlmError> {
        Self::with_options(api_key, api_url, DEFAULT_MAX_RETRY, DEFAULT_CONNECT_TIMEOUT_SECS)
    }

    pub fn with_options(
        api_key: &str,
        api_url: &str,
        max_retry: u32,
        connect_timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            max_retry,
            stop: AtomicBool::new(false),
        })
    }

    /// Cooperatively abort the in-flight request (and any retries). Safe
    /// to call from another thread.
    pub fn abort(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Clear a previous abort before reuse.
    pub fn reset_abort(&self) {
        self.stop.store(false, Ordering::Relaxed);
    }

    fn aborted(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn execute(&self, request: &ChatRequest<'_>) -> Result<reqwest::blocking::Response, LlmError> {
        let mut attempt: u32 = 0;
        loop {
            if self.aborted() {
                return Err(LlmError::Aborted);
            }
            let result = self
                .http
                .post(&self.api_url)
                .bearer_auth(&self.api_key)
                .json(request)
                .send();

            let retryable_detail = match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return Ok(response);
                    }
                    let detail = response.text().unwrap_or_default();
                    if !RETRY_STATUSES.contains(&status) || attempt >= self.max_retry {
                        return Err(map_status(status, detail));
                    }
                    format!("HTTP {}", status)
                }
                Err(e) => {
                    if attempt >= self.max_retry {
                        return Err(LlmError::Network(e.to_string()));
                    }
                    e.to_string()
                }
            };

            let wait = (BACKOFF_BASE_MS << attempt).min(BACKOFF_CAP_MS);
            tracing::debug!(attempt = attempt, wait_ms = wait, detail = %retryable_detail, "retrying LLM request");
            std::thread::sleep(Duration::from_millis(wait));
            attempt += 1;
        }
    }

    /// Non-streaming completion. Returns the assistant message and token
    /// usage when the server reports it.
    pub fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<(String, Option<TokenUsage>), LlmError> {
        let request = ChatRequest {
            model,
            messages,
            stream: false,
        };
        let response = self.execute(&request)?;
        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::Parser(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Parser("response carried no choices".into()))?;
        Ok((content, parsed.usage))
    }

    /// Streaming completion: `on_delta` receives each content fragment as
    /// it arrives; the full concatenated answer is returned.
    pub fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(String, Option<TokenUsage>), LlmError> {
        let request = ChatRequest {
            model,
            messages,
            stream: true,
        };
        let mut response = self.execute(&request)?;

        let mut buffer: Vec<u8> = Vec::new();
        let mut full = String::new();
        let mut usage: Option<TokenUsage> = None;
        let mut read_buf = [0u8; 4096];
        let mut done = false;

        while !done {
            if self.aborted() {
                return Err(LlmError::Aborted);
            }
            let n = response
                .read(&mut read_buf)
                .map_err(|e| LlmError::Network(e.to_string()))?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&read_buf[..n]);
            done = drain_sse_events(&mut buffer, |data| match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    for choice in chunk.choices {
                        if let Some(fragment) = choice.delta.content {
                            full.push_str(&fragment);
                            on_delta(&fragment);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed SSE chunk");
                }
            });
        }
        Ok((full, usage))
    }
}

/// One conversation: message history against a fixed model.
pub struct LlmConv {
    client: Arc<LlmClient>,
    model: String,
    history: Vec<ChatMessage>,
    last_usage: Option<TokenUsage>,
}

impl LlmConv {
    pub fn new(client: Arc<LlmClient>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            history: Vec::new(),
            last_usage: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_message(&mut self, role: &str, content: &str) {
        self.history.push(ChatMessage::new(role, content));
    }

    /// Send the history and append the assistant's reply to it.
    pub fn get_response(&mut self) -> Result<String, LlmError> {
        let (content, usage) = self.client.chat(&self.model, &self.history)?;
        self.last_usage = usage;
        self.history.push(ChatMessage::new("assistant", &content));
        Ok(content)
    }

    /// Streaming variant of [`LlmConv::get_response`].
    pub fn get_stream_response(
        &mut self,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String, LlmError> {
        let (content, usage) = self
            .client
            .chat_stream(&self.model, &self.history, on_delta)?;
        self.last_usage = usage;
        self.history.push(ChatMessage::new("assistant", &content));
        Ok(content)
    }

    pub fn last_usage(&self) -> Option<TokenUsage> {
        self.last_usage
    }

    pub fn export_history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn import_history(&mut self, history: Vec<ChatMessage>) {
        self.history = history;
    }

    /// Thread-safe abort of whatever this conversation's client is doing.
    pub fn stop_connection(&self) {
        self.client.abort();
    }
}
