//! Request pipeline.
//!
//! The orchestrator: validate, apply overrides, consult the cache, route,
//! then walk the candidate list with failover. Failover is only legal before
//! the first byte reaches the client, so streaming commits at stream
//! establishment; afterwards the candidate's outcome is final. Quota
//! failures put the model into cool-down, successes clear it, and clean
//! streaming terminations are buffered and admitted to the cache as their
//! unary equivalent.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::adapter::{AdapterError, AdapterRegistry, ErrorKind, EventStream, RequestAuth};
use crate::availability::AvailabilityRegistry;
use crate::cache::{fingerprint, ResponseCache};
use crate::chat_template::convert_to_chat_template;
use crate::config::GatewayConfig;
use crate::conversion::{stream_events_to_unary, unary_to_stream_events};
use crate::models::anthropic::{
    ContentBlock, MessagesRequest, MessagesResponse, Role, StreamEvent, Usage,
};
use crate::router::ModelRouter;

/// What the pipeline hands back to the HTTP layer.
pub enum PipelineReply {
    Unary(MessagesResponse),
    Stream(EventStream),
}

impl std::fmt::Debug for PipelineReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineReply::Unary(resp) => f.debug_tuple("Unary").field(resp).finish(),
            PipelineReply::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

pub struct RequestPipeline {
    config: Arc<GatewayConfig>,
    adapters: Arc<AdapterRegistry>,
    router: Arc<ModelRouter>,
    cache: Arc<ResponseCache>,
    availability: Arc<AvailabilityRegistry>,
}

impl RequestPipeline {
    pub fn new(
        config: Arc<GatewayConfig>,
        adapters: Arc<AdapterRegistry>,
        router: Arc<ModelRouter>,
        cache: Arc<ResponseCache>,
        availability: Arc<AvailabilityRegistry>,
    ) -> Self {
        Self {
            config,
            adapters,
            router,
            cache,
            availability,
        }
    }

    pub fn availability(&self) -> &Arc<AvailabilityRegistry> {
        &self.availability
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Run one request through validation, cache, routing and failover.
    ///
    /// `explicit_backend` is the `x-backend` header when present.
    pub async fn handle(
        &self,
        request: MessagesRequest,
        auth: RequestAuth,
        explicit_backend: Option<String>,
    ) -> Result<PipelineReply, AdapterError> {
        validate(&request)?;

        // Overrides apply to the client-supplied model before anything else;
        // the fingerprint is keyed on this client-facing model, not on
        // whatever the router later picks.
        let client_model = self.config.override_model(&request.model).to_string();

        if !self.config.proxy_mode {
            let response = ok_response(&request, &client_model);
            return Ok(if request.stream {
                PipelineReply::Stream(stream_from_events(unary_to_stream_events(&response)))
            } else {
                PipelineReply::Unary(response)
            });
        }

        let cache_key = fingerprint(&MessagesRequest {
            model: client_model.clone(),
            ..request.clone()
        });

        if self.config.cache.enabled {
            if let Some(body) = self.cache.get(&cache_key, Instant::now()) {
                tracing::info!(model = %client_model, "cache hit");
                return replay_cached(&body, request.stream);
            }
        }

        let template_messages = convert_to_chat_template(&request);
        let decision = self
            .router
            .decide(
                &request.model,
                explicit_backend.as_deref(),
                &template_messages,
                Instant::now(),
            )
            .map_err(|e| AdapterError::new(ErrorKind::NoRoute, e.message))?;

        let mut recorded: Vec<AdapterError> = Vec::new();

        for candidate in &decision.candidates {
            let Some(adapter) = self.adapters.get(&candidate.backend) else {
                recorded.push(AdapterError::new(
                    ErrorKind::Internal,
                    format!("no adapter registered for backend {:?}", candidate.backend),
                ));
                continue;
            };

            let mut upstream_request = request.clone();
            upstream_request.model = candidate.model.clone();

            tracing::info!(
                backend = %candidate.backend,
                model = %candidate.model,
                expert = decision.expert.as_deref(),
                difficulty = decision.difficulty.map(f64::from),
                stream = request.stream,
                "dispatching to upstream"
            );

            if request.stream {
                match adapter.chat_stream(&upstream_request, &auth).await {
                    Ok(stream) => {
                        // Committed: bytes are about to reach the client, no
                        // more failover for this request.
                        let recorder = CacheRecorder {
                            inner: stream,
                            cache: self
                                .config
                                .cache
                                .enabled
                                .then(|| self.cache.clone()),
                            availability: self.availability.clone(),
                            fingerprint: cache_key.clone(),
                            model: candidate.model.clone(),
                            events: Vec::new(),
                            buffered_bytes: 0,
                            buffer_limit: self.config.stream_buffer_limit,
                            overflowed: false,
                            finished: false,
                        };
                        return Ok(PipelineReply::Stream(Box::pin(recorder)));
                    }
                    Err(err) => {
                        if self.record_failure(&candidate.model, err, &mut recorded) {
                            break;
                        }
                    }
                }
            } else {
                match adapter.chat(&upstream_request, &auth).await {
                    Ok(response) => {
                        self.availability.mark_success(&candidate.model);
                        if self.config.cache.enabled {
                            if let Ok(body) = serde_json::to_vec(&response) {
                                self.cache
                                    .put(&cache_key, Bytes::from(body), Instant::now());
                            }
                        }
                        return Ok(PipelineReply::Unary(response));
                    }
                    Err(err) => {
                        if self.record_failure(&candidate.model, err, &mut recorded) {
                            break;
                        }
                    }
                }
            }
        }

        Err(most_severe(recorded))
    }

    /// Returns true when the failure ends the candidate loop.
    fn record_failure(
        &self,
        model: &str,
        err: AdapterError,
        recorded: &mut Vec<AdapterError>,
    ) -> bool {
        tracing::warn!(model, error = %err, "upstream candidate failed");
        if err.kind.disables_model() {
            self.availability.disable(model, Instant::now());
        }
        let fatal = !err.kind.allows_failover();
        recorded.push(err);
        fatal
    }
}

fn validate(request: &MessagesRequest) -> Result<(), AdapterError> {
    if request.model.trim().is_empty() {
        return Err(AdapterError::new(ErrorKind::BadRequest, "model is required"));
    }
    if request.messages.is_empty() {
        return Err(AdapterError::new(
            ErrorKind::BadRequest,
            "messages must not be empty",
        ));
    }
    if request.max_tokens == 0 {
        return Err(AdapterError::new(
            ErrorKind::BadRequest,
            "max_tokens must be a positive integer",
        ));
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=1.0).contains(&temperature) {
            return Err(AdapterError::new(
                ErrorKind::BadRequest,
                "temperature must be between 0 and 1",
            ));
        }
    }
    if let Some(top_p) = request.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(AdapterError::new(
                ErrorKind::BadRequest,
                "top_p must be between 0 and 1",
            ));
        }
    }
    // top_k >= 0 is enforced by the unsigned type: a negative value fails
    // deserialization and is rejected as bad_request at the HTTP boundary.
    Ok(())
}

fn replay_cached(body: &Bytes, stream: bool) -> Result<PipelineReply, AdapterError> {
    let response: MessagesResponse = serde_json::from_slice(body).map_err(|err| {
        AdapterError::new(
            ErrorKind::Internal,
            format!("corrupt cache entry: {}", err),
        )
    })?;
    Ok(if stream {
        PipelineReply::Stream(stream_from_events(unary_to_stream_events(&response)))
    } else {
        PipelineReply::Unary(response)
    })
}

fn stream_from_events(events: Vec<StreamEvent>) -> EventStream {
    Box::pin(futures_util::stream::iter(events.into_iter().map(Ok)))
}

/// Canned reply for non-proxy mode.
fn ok_response(request: &MessagesRequest, model: &str) -> MessagesResponse {
    let input_tokens = request
        .messages
        .iter()
        .map(|m| m.content.text().len() as u64 / 4)
        .sum();
    MessagesResponse {
        id: "msg_ok_response".to_string(),
        kind: "message".to_string(),
        role: Role::Assistant,
        content: vec![ContentBlock::Text {
            text: "OK".to_string(),
        }],
        model: model.to_string(),
        stop_reason: Some("end_turn".to_string()),
        stop_sequence: None,
        usage: Some(Usage {
            input_tokens,
            output_tokens: 10,
            extra: serde_json::Map::new(),
        }),
    }
}

fn most_severe(mut errors: Vec<AdapterError>) -> AdapterError {
    if errors.is_empty() {
        return AdapterError::new(ErrorKind::NoRoute, "no route candidates succeeded");
    }
    let mut best = errors.remove(0);
    for err in errors {
        if err.kind.severity() > best.kind.severity() {
            best = err;
        }
    }
    best
}

/// Forwards events while buffering them for cache admission.
///
/// Admission happens exactly once, on a clean `message_stop`; overflow past
/// the buffer cap or early termination forwards the stream untouched but
/// never caches.
struct CacheRecorder {
    inner: EventStream,
    cache: Option<Arc<ResponseCache>>,
    availability: Arc<AvailabilityRegistry>,
    fingerprint: String,
    model: String,
    events: Vec<StreamEvent>,
    buffered_bytes: usize,
    buffer_limit: usize,
    overflowed: bool,
    finished: bool,
}

impl CacheRecorder {
    fn observe(&mut self, event: &StreamEvent) {
        if !self.overflowed {
            let size = serde_json::to_string(event).map(|s| s.len()).unwrap_or(0);
            self.buffered_bytes += size;
            if self.buffered_bytes > self.buffer_limit {
                self.overflowed = true;
                self.events.clear();
                tracing::debug!(
                    fingerprint = %self.fingerprint,
                    "response exceeds admission buffer, streaming through uncached"
                );
            } else {
                self.events.push(event.clone());
            }
        }

        if matches!(event, StreamEvent::MessageStop) && !self.finished {
            self.finished = true;
            self.availability.mark_success(&self.model);
            if self.overflowed {
                return;
            }
            if let Some(cache) = &self.cache {
                if let Some(unary) = stream_events_to_unary(&self.events) {
                    if let Ok(body) = serde_json::to_vec(&unary) {
                        cache.put(&self.fingerprint, Bytes::from(body), Instant::now());
                        tracing::debug!(fingerprint = %self.fingerprint, "stream admitted to cache");
                    }
                }
            }
        }
    }
}

impl Stream for CacheRecorder {
    type Item = Result<StreamEvent, AdapterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(event))) => {
                this.observe(&event);
                Poll::Ready(Some(Ok(event)))
            }
            other => other,
        }
    }
}
