//! Backend adapter capability and shared upstream plumbing.
//!
//! One adapter instance serves one named backend. Adapters classify every
//! upstream outcome into the closed `ErrorKind` set; the pipeline owns all
//! recovery decisions.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;

use crate::config::{BackendKind, GatewayConfig};
use crate::models::anthropic::{
    CountTokensRequest, CountTokensResponse, MessagesRequest, MessagesResponse, StreamEvent,
    SystemPrompt,
};
use crate::oauth::OAuthManager;

/// Closed classification of upstream outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    AuthFailed,
    NoRoute,
    RateLimited,
    InsufficientCredits,
    UpstreamError,
    NetworkError,
    Timeout,
    Canceled,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::AuthFailed => 401,
            ErrorKind::NoRoute => 404,
            ErrorKind::RateLimited => 429,
            ErrorKind::InsufficientCredits => 402,
            ErrorKind::UpstreamError | ErrorKind::NetworkError => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Canceled => 499,
            ErrorKind::Internal => 500,
        }
    }

    pub fn wire_type(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::NoRoute => "no_route",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Ranking used when failover exhausts every candidate: the most severe
    /// recorded error is surfaced.
    pub fn severity(self) -> u8 {
        match self {
            ErrorKind::AuthFailed => 8,
            ErrorKind::BadRequest => 7,
            ErrorKind::RateLimited | ErrorKind::InsufficientCredits => 6,
            ErrorKind::UpstreamError => 5,
            ErrorKind::NetworkError => 4,
            ErrorKind::Timeout => 3,
            ErrorKind::NoRoute => 2,
            ErrorKind::Internal => 1,
            ErrorKind::Canceled => 0,
        }
    }

    /// Only quota-style failures put a model into cool-down.
    pub fn disables_model(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::InsufficientCredits)
    }

    pub fn allows_failover(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::InsufficientCredits
                | ErrorKind::UpstreamError
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
        )
    }
}

#[derive(Debug, Clone)]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
    pub backend: Option<String>,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    /// Classify an upstream HTTP status, peeking at the body for vendor
    /// credit messages that hide behind generic statuses.
    pub fn from_status(status: u16, body: &str) -> Self {
        let lower = body.to_ascii_lowercase();
        let kind = match status {
            401 | 403 => ErrorKind::AuthFailed,
            402 => ErrorKind::InsufficientCredits,
            429 => ErrorKind::RateLimited,
            s if (400..500).contains(&s) => {
                if lower.contains("insufficient credit") || lower.contains("credit balance") {
                    ErrorKind::InsufficientCredits
                } else {
                    ErrorKind::BadRequest
                }
            }
            _ => ErrorKind::UpstreamError,
        };
        let message = if body.is_empty() {
            format!("upstream returned status {}", status)
        } else {
            body.chars().take(500).collect()
        };
        Self::new(kind, message)
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::NetworkError
        };
        Self::new(kind, err.to_string())
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backend {
            Some(backend) => write!(f, "{} ({}): {}", self.kind.wire_type(), backend, self.message),
            None => write!(f, "{}: {}", self.kind.wire_type(), self.message),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Per-request credentials lifted from the inbound headers.
#[derive(Debug, Clone, Default)]
pub struct RequestAuth {
    pub x_api_key: Option<String>,
    pub anthropic_version: Option<String>,
    pub anthropic_beta: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub name: String,
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AdapterError>> + Send>>;

/// Raw upstream body stream, boxed so adapters can wrap it in re-framers.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// The uniform capability every backend exposes.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        request: &MessagesRequest,
        auth: &RequestAuth,
    ) -> Result<MessagesResponse, AdapterError>;

    /// Returns `Err` for every failure before the first event; once `Ok`,
    /// the stream is committed and mid-stream failures surface in-band.
    async fn chat_stream(
        &self,
        request: &MessagesRequest,
        auth: &RequestAuth,
    ) -> Result<EventStream, AdapterError>;

    async fn count_tokens(
        &self,
        request: &CountTokensRequest,
        auth: &RequestAuth,
    ) -> Result<CountTokensResponse, AdapterError>;

    async fn health(&self) -> HealthStatus;
}

/// Chars-over-four token estimate, used when a backend offers no counting
/// endpoint or the call fails.
pub fn estimate_input_tokens(request: &CountTokensRequest) -> u64 {
    let mut chars = 0usize;
    for message in &request.messages {
        chars += message.content.text().len();
    }
    if let Some(system) = &request.system {
        chars += match system {
            SystemPrompt::Text(s) => s.len(),
            SystemPrompt::Blocks(blocks) => blocks.iter().map(|b| b.text.len()).sum(),
        };
    }
    (chars / 4) as u64
}

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame decoder over a byte stream.
///
/// Frames are delimited by a blank line; multi-line `data:` segments join
/// with `\n` and a trailing `\r` per line is tolerated.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Option<SseFrame> {
        let pos = self.buffer.windows(2).position(|window| window == b"\n\n")?;
        let raw: Vec<u8> = self.buffer.drain(..pos + 2).collect();

        let mut event = None;
        let mut data_segments: Vec<String> = Vec::new();
        for line in raw[..raw.len() - 2].split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let Some(rest) = line.strip_prefix(b"event:") {
                event = Some(String::from_utf8_lossy(rest).trim().to_string());
            } else if let Some(rest) = line.strip_prefix(b"data:") {
                data_segments.push(String::from_utf8_lossy(rest).trim().to_string());
            }
        }

        Some(SseFrame {
            event,
            data: data_segments.join("\n"),
        })
    }
}

/// Applies the backend's timeout as an idle deadline between stream items.
///
/// The deadline resets on every item; if it fires while the inner stream is
/// pending, one `timeout` error is yielded and the stream ends.
pub struct WithIdleTimeout<S> {
    inner: S,
    idle: Duration,
    sleep: Pin<Box<tokio::time::Sleep>>,
    timed_out: bool,
}

impl<S> WithIdleTimeout<S> {
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            sleep: Box::pin(tokio::time::sleep(idle)),
            timed_out: false,
        }
    }
}

impl<S> Stream for WithIdleTimeout<S>
where
    S: Stream<Item = Result<StreamEvent, AdapterError>> + Unpin,
{
    type Item = Result<StreamEvent, AdapterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.timed_out {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(item) => {
                let deadline = tokio::time::Instant::now() + this.idle;
                this.sleep.as_mut().reset(deadline);
                Poll::Ready(item)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.timed_out = true;
                    Poll::Ready(Some(Err(AdapterError::new(
                        ErrorKind::Timeout,
                        "idle timeout between stream events",
                    ))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Maps backend name to its adapter instance.
///
/// Construction is a pure function of the config snapshot.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn from_config(
        config: &GatewayConfig,
        http: reqwest::Client,
        oauth: Arc<OAuthManager>,
    ) -> Self {
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        for (name, backend) in &config.backends {
            let adapter: Arc<dyn Adapter> = match backend.kind {
                BackendKind::Anthropic => Arc::new(crate::anthropic::AnthropicAdapter::new(
                    backend.clone(),
                    http.clone(),
                    oauth.clone(),
                )),
                BackendKind::OpenAiCompatible => Arc::new(
                    crate::openai_compat::OpenAiCompatAdapter::new(backend.clone(), http.clone()),
                ),
            };
            adapters.insert(name.clone(), adapter);
        }
        Self { adapters }
    }

    /// Build a registry from pre-constructed adapters (tests inject fakes).
    pub fn from_adapters(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        Self {
            adapters: adapters
                .into_iter()
                .map(|a| (a.name().to_string(), a))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Adapter>)> {
        self.adapters.iter()
    }
}
