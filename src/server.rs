//! HTTP surface.
//!
//! Actix handlers for the Anthropic Messages endpoints, the OpenAI Chat
//! Completions shim, gateway introspection (backends, cache) and the OAuth
//! management surface.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::adapter::{ErrorKind, EventStream, RequestAuth};
use crate::chat_template::{apply_chat_template, convert_to_chat_template};
use crate::conversion::{
    anthropic_to_openai_response, openai_to_anthropic_request, AnthropicStreamToChatChunks,
};
use crate::models::anthropic::{CountTokensRequest, MessagesRequest, StreamEvent};
use crate::models::openai::ChatCompletionRequest;
use crate::pipeline::PipelineReply;
use crate::util::{anthropic_error_response, openai_error_response, AppState};

/// Configure all gateway routes.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/v1/messages", web::post().to(messages))
            .route("/v1/messages/count_tokens", web::post().to(count_tokens))
            .route("/v1/messages/count-tokens", web::post().to(count_tokens))
            .route("/v1/messages/chat-template", web::post().to(chat_template))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/backends/status", web::get().to(backends_status))
            .route("/cache/stats", web::get().to(cache_stats))
            .route("/cache/clear", web::post().to(cache_clear))
            .route("/oauth/authorize", web::get().to(oauth_authorize))
            .route("/oauth/callback", web::get().to(oauth_callback))
            .route("/oauth/status", web::get().to(oauth_status))
            .route("/oauth/refresh", web::post().to(oauth_refresh))
            .route("/oauth/logout", web::post().to(oauth_logout)),
    );
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

fn bearer(req: &HttpRequest) -> Option<String> {
    header(req, "authorization").and_then(|value| {
        let value = value.trim();
        if value.len() > 7 && value[..6].eq_ignore_ascii_case("bearer") {
            Some(value[6..].trim().to_string())
        } else {
            None
        }
    })
}

fn request_auth(req: &HttpRequest) -> RequestAuth {
    RequestAuth {
        x_api_key: header(req, "x-api-key"),
        anthropic_version: header(req, "anthropic-version"),
        anthropic_beta: header(req, "anthropic-beta"),
    }
}

/// Emit a pipeline event stream as `text/event-stream`.
///
/// Mid-stream failures surface as in-band `error` events; the response
/// status is already committed by then.
fn sse_response(stream: EventStream) -> HttpResponse {
    let body = stream.map(|item| {
        let bytes = match item {
            Ok(event) => event.to_sse_bytes(),
            Err(err) => StreamEvent::Error {
                error: json!({"type": err.kind.wire_type(), "message": err.message}),
            }
            .to_sse_bytes(),
        };
        Ok::<Bytes, std::io::Error>(bytes)
    });
    HttpResponse::Ok()
        .insert_header(("content-type", "text/event-stream"))
        .insert_header(("cache-control", "no-cache"))
        .insert_header(("connection", "keep-alive"))
        .streaming(body)
}

/// POST /v1/messages
async fn messages(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let auth = request_auth(&req);
    if auth.x_api_key.is_none() && state.oauth.load_token().is_none() {
        return anthropic_error_response(
            ErrorKind::AuthFailed,
            "missing x-api-key header or OAuth token",
        );
    }
    if auth.anthropic_version.is_none() {
        return anthropic_error_response(ErrorKind::BadRequest, "missing anthropic-version header");
    }

    let request: MessagesRequest = match serde_json::from_value(body.into_inner()) {
        Ok(request) => request,
        Err(err) => {
            return anthropic_error_response(
                ErrorKind::BadRequest,
                &format!("invalid request body: {}", err),
            )
        }
    };

    let explicit_backend = header(&req, "x-backend");
    match state.pipeline.handle(request, auth, explicit_backend).await {
        Ok(PipelineReply::Unary(response)) => HttpResponse::Ok().json(response),
        Ok(PipelineReply::Stream(stream)) => sse_response(stream),
        Err(err) => anthropic_error_response(err.kind, &err.message),
    }
}

/// POST /v1/messages/count_tokens
async fn count_tokens(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let auth = request_auth(&req);
    if auth.x_api_key.is_none() && state.oauth.load_token().is_none() {
        return anthropic_error_response(
            ErrorKind::AuthFailed,
            "missing x-api-key header or OAuth token",
        );
    }
    if auth.anthropic_version.is_none() {
        return anthropic_error_response(ErrorKind::BadRequest, "missing anthropic-version header");
    }

    let request: CountTokensRequest = match serde_json::from_value(body.into_inner()) {
        Ok(request) => request,
        Err(err) => {
            return anthropic_error_response(
                ErrorKind::BadRequest,
                &format!("invalid request body: {}", err),
            )
        }
    };

    let model = state.config.override_model(&request.model).to_string();
    let backend = state
        .config
        .backend_for_model(&model)
        .unwrap_or_else(|| "anthropic".to_string());

    match state.adapters.get(&backend) {
        Some(adapter) => match adapter.count_tokens(&request, &auth).await {
            Ok(response) => HttpResponse::Ok().json(response),
            Err(err) => anthropic_error_response(err.kind, &err.message),
        },
        None => HttpResponse::Ok().json(crate::models::anthropic::CountTokensResponse {
            input_tokens: crate::adapter::estimate_input_tokens(&request),
        }),
    }
}

/// POST /v1/messages/chat-template
///
/// Utility endpoint: formats the request as Hugging Face chat-template
/// messages plus a rendered ChatML string. No upstream call.
async fn chat_template(body: web::Json<serde_json::Value>) -> impl Responder {
    let request: MessagesRequest = match serde_json::from_value(body.into_inner()) {
        Ok(request) => request,
        Err(err) => {
            return anthropic_error_response(
                ErrorKind::BadRequest,
                &format!("invalid request body: {}", err),
            )
        }
    };

    let chat_messages = convert_to_chat_template(&request);
    let chatml = apply_chat_template(&chat_messages, true);
    let chatml_no_prompt = apply_chat_template(&chat_messages, false);
    let roles: Vec<String> = chat_messages.iter().map(|m| m.role.clone()).collect();
    let message_count = chat_messages.len();
    HttpResponse::Ok().json(json!({
        "chat_messages": chat_messages,
        "formatted": {
            "chatml": chatml,
            "chatml_no_prompt": chatml_no_prompt,
        },
        "message_count": message_count,
        "roles": roles,
    }))
}

/// POST /v1/chat/completions — OpenAI shim.
async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let chat_request: ChatCompletionRequest = match serde_json::from_value(body.into_inner()) {
        Ok(request) => request,
        Err(err) => {
            return openai_error_response(
                ErrorKind::BadRequest,
                &format!("invalid request body: {}", err),
            )
        }
    };

    // Bearer auth is accepted as equivalent to x-api-key on this surface.
    let auth = RequestAuth {
        x_api_key: bearer(&req).or_else(|| header(&req, "x-api-key")),
        anthropic_version: header(&req, "anthropic-version"),
        anthropic_beta: header(&req, "anthropic-beta"),
    };

    let model = chat_request.model.clone();
    let canonical = openai_to_anthropic_request(&chat_request);

    // OpenAI-shaped requests for non-Anthropic models default to the local
    // OpenAI-compatible backend unless pinned.
    let explicit_backend = header(&req, "x-backend").or_else(|| {
        let lower = model.to_ascii_lowercase();
        if lower.contains("claude") || lower.contains("anthropic") {
            None
        } else {
            Some("lm-studio".to_string())
        }
    });

    match state.pipeline.handle(canonical, auth, explicit_backend).await {
        Ok(PipelineReply::Unary(response)) => {
            HttpResponse::Ok().json(anthropic_to_openai_response(&response))
        }
        Ok(PipelineReply::Stream(stream)) => {
            let shim = ChatShimStream::new(stream, &model);
            HttpResponse::Ok()
                .insert_header(("content-type", "text/event-stream"))
                .insert_header(("cache-control", "no-cache"))
                .insert_header(("connection", "keep-alive"))
                .streaming(shim)
        }
        Err(err) => openai_error_response(err.kind, &err.message),
    }
}

/// Re-frames Anthropic pipeline events as OpenAI `data:` chunks.
struct ChatShimStream {
    inner: EventStream,
    translator: AnthropicStreamToChatChunks,
    pending: VecDeque<Bytes>,
    done_sent: bool,
}

impl ChatShimStream {
    fn new(inner: EventStream, model: &str) -> Self {
        Self {
            inner,
            translator: AnthropicStreamToChatChunks::new(model),
            pending: VecDeque::new(),
            done_sent: false,
        }
    }

    fn push_chunk(&mut self, payload: &impl serde::Serialize) {
        if let Ok(data) = serde_json::to_string(payload) {
            self.pending.push_back(Bytes::from(format!("data: {}\n\n", data)));
        }
    }

    fn push_done(&mut self) {
        if !self.done_sent {
            self.pending.push_back(Bytes::from_static(b"data: [DONE]\n\n"));
            self.done_sent = true;
        }
    }
}

impl Stream for ChatShimStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(bytes) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(bytes)));
            }
            if this.done_sent {
                return Poll::Ready(None);
            }
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    let chunks = this.translator.on_event(&event);
                    for chunk in &chunks {
                        this.push_chunk(chunk);
                    }
                    if this.translator.done() {
                        this.push_done();
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.push_chunk(&json!({
                        "error": {"message": err.message, "type": err.kind.wire_type()}
                    }));
                    this.push_done();
                }
                Poll::Ready(None) => {
                    this.push_done();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// GET /backends/status
async fn backends_status(state: web::Data<AppState>) -> impl Responder {
    let checks = state
        .adapters
        .iter()
        .map(|(_, adapter)| adapter.health());
    let mut backends = futures_util::future::join_all(checks).await;
    backends.sort_by(|a, b| a.name.cmp(&b.name));

    let disabled: Vec<serde_json::Value> = state
        .availability
        .snapshot(std::time::Instant::now())
        .into_iter()
        .map(|(model, remaining)| {
            json!({"model": model, "disabled_for_seconds": remaining.as_secs()})
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "backends": backends,
        "disabled_models": disabled,
    }))
}

/// GET /cache/stats
async fn cache_stats(state: web::Data<AppState>) -> impl Responder {
    if !state.config.cache.enabled {
        return HttpResponse::Ok().json(json!({"enabled": false}));
    }
    let stats = state.cache.stats();
    let mut body = serde_json::to_value(&stats).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("enabled".to_string(), json!(true));
    }
    HttpResponse::Ok().json(body)
}

/// POST /cache/clear
async fn cache_clear(state: web::Data<AppState>) -> impl Responder {
    let cleared = state.cache.clear();
    HttpResponse::Ok().json(json!({"cleared": cleared}))
}

/// GET /oauth/authorize
async fn oauth_authorize(state: web::Data<AppState>) -> impl Responder {
    let (auth_url, oauth_state, code_verifier) = state.oauth.authorization_url();
    HttpResponse::Ok().json(json!({
        "auth_url": auth_url,
        "state": oauth_state,
        "code_verifier": code_verifier,
        "instructions": "Visit auth_url, then call /oauth/callback with code, state and code_verifier",
    }))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: String,
    #[allow(dead_code)]
    state: Option<String>,
    code_verifier: String,
}

/// GET /oauth/callback
async fn oauth_callback(
    state: web::Data<AppState>,
    query: web::Query<CallbackQuery>,
) -> impl Responder {
    match state
        .oauth
        .exchange_code(&query.code, &query.code_verifier)
        .await
    {
        Ok(token) => HttpResponse::Ok().json(json!({
            "message": "OAuth authentication successful",
            "token_type": &token.token_type,
            "expires_in": token.expires_in_seconds(),
            "has_refresh_token": token.refresh_token.is_some(),
        })),
        Err(err) => anthropic_error_response(ErrorKind::BadRequest, &err.to_string()),
    }
}

/// GET /oauth/status
async fn oauth_status(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.oauth.status())
}

/// POST /oauth/refresh
async fn oauth_refresh(state: web::Data<AppState>) -> impl Responder {
    let Some(token) = state.oauth.load_token() else {
        return anthropic_error_response(ErrorKind::AuthFailed, "no OAuth token found");
    };
    let Some(refresh_token) = token.refresh_token else {
        return anthropic_error_response(ErrorKind::BadRequest, "no refresh token available");
    };
    match state.oauth.refresh(&refresh_token).await {
        Ok(fresh) => HttpResponse::Ok().json(json!({
            "message": "Token refreshed successfully",
            "expires_in_seconds": fresh.expires_in_seconds(),
        })),
        Err(err) => anthropic_error_response(ErrorKind::BadRequest, &err.to_string()),
    }
}

/// POST /oauth/logout
async fn oauth_logout(state: web::Data<AppState>) -> impl Responder {
    state.oauth.clear_tokens();
    HttpResponse::Ok().json(json!({"message": "OAuth tokens cleared"}))
}
