//! Anthropic Messages adapter.
//!
//! The canonical request is already Anthropic-shaped, so the body goes out
//! nearly verbatim and streaming is a passthrough of the upstream event
//! framing. Authorization prefers a live OAuth bearer token (fetched fresh
//! per request; the OAuth manager handles refresh) and falls back to the
//! client's `x-api-key` or the configured key.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::adapter::{
    estimate_input_tokens, Adapter, AdapterError, ByteStream, ErrorKind, EventStream,
    HealthStatus, RequestAuth, SseFrameDecoder, WithIdleTimeout,
};
use crate::config::BackendConfig;
use crate::models::anthropic::{
    CountTokensRequest, CountTokensResponse, MessagesRequest, MessagesResponse, StreamEvent,
};
use crate::models::openai::ModelList;
use crate::oauth::{OAuthManager, OAUTH_BETA};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// System block Anthropic requires on OAuth-authenticated traffic.
const OAUTH_IDENTITY: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

pub struct AnthropicAdapter {
    config: BackendConfig,
    http: reqwest::Client,
    oauth: Arc<OAuthManager>,
}

struct ResolvedAuth {
    oauth_token: Option<String>,
}

impl AnthropicAdapter {
    pub fn new(config: BackendConfig, http: reqwest::Client, oauth: Arc<OAuthManager>) -> Self {
        Self {
            config,
            http,
            oauth,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    async fn resolve_auth(&self) -> ResolvedAuth {
        ResolvedAuth {
            oauth_token: self.oauth.bearer_token().await,
        }
    }

    fn apply_headers(
        &self,
        mut builder: reqwest::RequestBuilder,
        auth: &RequestAuth,
        resolved: &ResolvedAuth,
    ) -> reqwest::RequestBuilder {
        let version = auth
            .anthropic_version
            .as_deref()
            .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
        builder = builder
            .header("anthropic-version", version)
            .header("content-type", "application/json");

        match &resolved.oauth_token {
            Some(token) => {
                builder = builder.bearer_auth(token);
                let beta = match auth.anthropic_beta.as_deref() {
                    Some(extra) if !extra.is_empty() => format!("{},{}", OAUTH_BETA, extra),
                    _ => OAUTH_BETA.to_string(),
                };
                builder = builder.header("anthropic-beta", beta);
            }
            None => {
                let key = auth
                    .x_api_key
                    .clone()
                    .or_else(|| self.config.api_key.clone());
                if let Some(key) = key {
                    builder = builder.header("x-api-key", key);
                }
                if let Some(beta) = auth.anthropic_beta.as_deref() {
                    builder = builder.header("anthropic-beta", beta);
                }
            }
        }
        builder
    }

    fn build_body(&self, request: &MessagesRequest, resolved: &ResolvedAuth, stream: bool) -> Value {
        let mut body = serde_json::to_value(request).unwrap_or(Value::Null);
        if let Some(obj) = body.as_object_mut() {
            if stream {
                obj.insert("stream".to_string(), Value::Bool(true));
            } else {
                obj.remove("stream");
            }
            // OAuth traffic must identify as Claude Code; prepend the
            // identity block to whatever system prompt the client sent.
            if resolved.oauth_token.is_some() {
                let identity = json!({"type": "text", "text": OAUTH_IDENTITY});
                let system = match obj.remove("system") {
                    Some(Value::String(text)) => {
                        json!([identity, {"type": "text", "text": text}])
                    }
                    Some(Value::Array(mut blocks)) => {
                        let mut combined = vec![identity];
                        combined.append(&mut blocks);
                        Value::Array(combined)
                    }
                    _ => json!([identity]),
                };
                obj.insert("system".to_string(), system);
            }
        }
        body
    }

    fn classify_send_error(&self, err: reqwest::Error) -> AdapterError {
        AdapterError::from_reqwest(err).with_backend(&self.config.name)
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn chat(
        &self,
        request: &MessagesRequest,
        auth: &RequestAuth,
    ) -> Result<MessagesResponse, AdapterError> {
        let resolved = self.resolve_auth().await;
        let body = self.build_body(request, &resolved, false);

        let builder = self
            .http
            .post(self.messages_url())
            .timeout(self.config.timeout())
            .json(&body);
        let response = self
            .apply_headers(builder, auth, &resolved)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let status = response.status();
        let payload = response.bytes().await.unwrap_or_default();
        if !status.is_success() {
            let text = String::from_utf8_lossy(&payload);
            return Err(
                AdapterError::from_status(status.as_u16(), &text).with_backend(&self.config.name)
            );
        }

        serde_json::from_slice(&payload).map_err(|err| {
            AdapterError::new(
                ErrorKind::UpstreamError,
                format!("unparseable messages response: {}", err),
            )
            .with_backend(&self.config.name)
        })
    }

    async fn chat_stream(
        &self,
        request: &MessagesRequest,
        auth: &RequestAuth,
    ) -> Result<EventStream, AdapterError> {
        let resolved = self.resolve_auth().await;
        let body = self.build_body(request, &resolved, true);

        let builder = self
            .http
            .post(self.messages_url())
            .header("accept", "text/event-stream")
            .json(&body);
        let response = self
            .apply_headers(builder, auth, &resolved)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(
                AdapterError::from_status(status.as_u16(), &text).with_backend(&self.config.name)
            );
        }

        let bytes: ByteStream = Box::pin(response.bytes_stream());
        let events = AnthropicEventStream::new(bytes, self.config.name.clone());
        Ok(Box::pin(WithIdleTimeout::new(events, self.config.timeout())))
    }

    async fn count_tokens(
        &self,
        request: &CountTokensRequest,
        auth: &RequestAuth,
    ) -> Result<CountTokensResponse, AdapterError> {
        let resolved = self.resolve_auth().await;
        let url = format!(
            "{}/v1/messages/count_tokens",
            self.config.base_url.trim_end_matches('/')
        );
        let mut body = json!({
            "model": &request.model,
            "messages": &request.messages,
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::to_value(system).unwrap_or(Value::Null);
        }

        let builder = self
            .http
            .post(url)
            .timeout(self.config.timeout())
            .json(&body);
        let outcome = self.apply_headers(builder, auth, &resolved).send().await;

        match outcome {
            Ok(response) if response.status().is_success() => response
                .json::<CountTokensResponse>()
                .await
                .map_err(|e| self.classify_send_error(e)),
            _ => {
                // No usable endpoint response; estimate locally.
                Ok(CountTokensResponse {
                    input_tokens: estimate_input_tokens(request),
                })
            }
        }
    }

    async fn health(&self) -> HealthStatus {
        let url = format!("{}/v1/models", self.config.base_url.trim_end_matches('/'));
        let started = std::time::Instant::now();
        let resolved = self.resolve_auth().await;
        let builder = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(10));
        let outcome = self
            .apply_headers(builder, &RequestAuth::default(), &resolved)
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) if response.status().is_success() => {
                let models = response
                    .json::<ModelList>()
                    .await
                    .ok()
                    .map(|list| list.data.into_iter().map(|m| m.id).take(5).collect());
                HealthStatus {
                    name: self.config.name.clone(),
                    ok: true,
                    latency_ms,
                    models,
                    error: None,
                }
            }
            Ok(response) => HealthStatus {
                name: self.config.name.clone(),
                ok: false,
                latency_ms,
                models: None,
                error: Some(format!("status {}", response.status())),
            },
            Err(err) => HealthStatus {
                name: self.config.name.clone(),
                ok: false,
                latency_ms,
                models: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Parses the upstream SSE body into typed events, passthrough-style.
struct AnthropicEventStream {
    inner: ByteStream,
    decoder: SseFrameDecoder,
    pending: VecDeque<StreamEvent>,
    backend: String,
    done: bool,
}

impl AnthropicEventStream {
    fn new(inner: ByteStream, backend: String) -> Self {
        Self {
            inner,
            decoder: SseFrameDecoder::new(),
            pending: VecDeque::new(),
            backend,
            done: false,
        }
    }

    fn drain_frames(&mut self) {
        while let Some(frame) = self.decoder.next_frame() {
            if frame.data.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&frame.data) {
                Ok(event) => self.pending.push_back(event),
                Err(err) => {
                    tracing::warn!(%err, event = ?frame.event, "skipping unparseable stream event")
                }
            }
        }
    }
}

impl Stream for AnthropicEventStream {
    type Item = Result<StreamEvent, AdapterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.decoder.push(&chunk);
                    this.drain_frames();
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(
                        AdapterError::from_reqwest(err).with_backend(&this.backend)
                    )));
                }
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
