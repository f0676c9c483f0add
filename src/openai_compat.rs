//! OpenAI-compatible adapter.
//!
//! Serves OpenAI, OpenRouter, LM-Studio and any user-declared backend that
//! speaks Chat Completions. Requests translate canonical → OpenAI on the way
//! out and OpenAI → canonical on the way back; upstream `data:` SSE framing
//! is consumed here and re-emitted as Anthropic events.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};

use crate::adapter::{
    estimate_input_tokens, Adapter, AdapterError, ByteStream, ErrorKind, EventStream,
    HealthStatus, RequestAuth, SseFrameDecoder, WithIdleTimeout,
};
use crate::config::BackendConfig;
use crate::conversion::{
    anthropic_to_openai_request, openai_to_anthropic_response, OpenAiStreamTranslator,
};
use crate::models::anthropic::{
    CountTokensRequest, CountTokensResponse, MessagesRequest, MessagesResponse, StreamEvent,
};
use crate::models::openai::{ChatCompletionChunk, ChatCompletionResponse, ModelList};

pub struct OpenAiCompatAdapter {
    config: BackendConfig,
    http: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(config: BackendConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    /// Bases that already carry `/v1` (OpenRouter) are not doubled.
    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/{}", base, path)
        } else {
            format!("{}/v1/{}", base, path)
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl Adapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn chat(
        &self,
        request: &MessagesRequest,
        _auth: &RequestAuth,
    ) -> Result<MessagesResponse, AdapterError> {
        let mut outbound = anthropic_to_openai_request(request);
        outbound.stream = None;

        let response = self
            .authorize(
                self.http
                    .post(self.endpoint("chat/completions"))
                    .timeout(self.config.timeout())
                    .json(&outbound),
            )
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(e).with_backend(&self.config.name))?;

        let status = response.status();
        let payload = response.bytes().await.unwrap_or_default();
        if !status.is_success() {
            let text = String::from_utf8_lossy(&payload);
            return Err(
                AdapterError::from_status(status.as_u16(), &text).with_backend(&self.config.name)
            );
        }

        let parsed: ChatCompletionResponse = serde_json::from_slice(&payload).map_err(|err| {
            AdapterError::new(
                ErrorKind::UpstreamError,
                format!("unparseable chat completion: {}", err),
            )
            .with_backend(&self.config.name)
        })?;
        Ok(openai_to_anthropic_response(&parsed))
    }

    async fn chat_stream(
        &self,
        request: &MessagesRequest,
        _auth: &RequestAuth,
    ) -> Result<EventStream, AdapterError> {
        let mut outbound = anthropic_to_openai_request(request);
        outbound.stream = Some(true);

        let response = self
            .authorize(
                self.http
                    .post(self.endpoint("chat/completions"))
                    .header("accept", "text/event-stream")
                    .json(&outbound),
            )
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(e).with_backend(&self.config.name))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(
                AdapterError::from_status(status.as_u16(), &text).with_backend(&self.config.name)
            );
        }

        let bytes: ByteStream = Box::pin(response.bytes_stream());
        let events = OpenAiEventStream::new(bytes, self.config.name.clone());
        Ok(Box::pin(WithIdleTimeout::new(events, self.config.timeout())))
    }

    async fn count_tokens(
        &self,
        request: &CountTokensRequest,
        _auth: &RequestAuth,
    ) -> Result<CountTokensResponse, AdapterError> {
        // No counting endpoint on this wire; estimate locally.
        Ok(CountTokensResponse {
            input_tokens: estimate_input_tokens(request),
        })
    }

    async fn health(&self) -> HealthStatus {
        let started = std::time::Instant::now();
        let outcome = self
            .authorize(
                self.http
                    .get(self.endpoint("models"))
                    .timeout(std::time::Duration::from_secs(10)),
            )
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

/// Consumes `data: <json>` / `data: [DONE]` framing and emits Anthropic
/// events through the stateful translator.
struct OpenAiEventStream {
    inner: ByteStream,
    decoder: SseFrameDecoder,
    translator: OpenAiStreamTranslator,
    pending: VecDeque<StreamEvent>,
    backend: String,
    done: bool,
}

impl OpenAiEventStream {
    fn new(inner: ByteStream, backend: String) -> Self {
        Self {
            inner,
            decoder: SseFrameDecoder::new(),
            translator: OpenAiStreamTranslator::new(),
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
            if frame.data == "[DONE]" {
                self.pending.extend(self.translator.finish());
                self.done = true;
                continue;
            }
            match serde_json::from_str::<ChatCompletionChunk>(&frame.data) {
                Ok(chunk) => self.pending.extend(self.translator.on_chunk(&chunk)),
                Err(err) => tracing::warn!(%err, "skipping unparseable upstream chunk"),
            }
        }
    }
}

impl Stream for OpenAiEventStream {
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
                    // Upstream closed without [DONE]: end the stream without
                    // fabricating a clean termination.
                    this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
