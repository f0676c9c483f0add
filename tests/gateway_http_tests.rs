use actix_web::{test, web, App};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use inferswitch::config::GatewayConfig;
use inferswitch::server::config_routes;
use inferswitch::util::AppState;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// What the mock upstream answers with.
#[derive(Clone)]
enum MockReply {
    Json(Value),
    Status(u16, Value),
    Sse(String),
}

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<Value>>>,
    reply: Arc<AsyncMutex<MockReply>>,
}

async fn handle_chat(State(state): State<UpstreamState>, Json(payload): Json<Value>) -> Response {
    state.requests.lock().await.push(payload);
    match state.reply.lock().await.clone() {
        MockReply::Json(body) => Json(body).into_response(),
        MockReply::Status(code, body) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(body),
        )
            .into_response(),
        MockReply::Sse(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from(body))
            .unwrap(),
    }
}

struct MockUpstream {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<Value>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(reply: MockReply) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            reply: Arc::new(AsyncMutex::new(reply)),
        };

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("upstream server error");
        });

        Self {
            base_url,
            requests,
            join,
        }
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    async fn last_request(&self) -> Value {
        self.requests
            .lock()
            .await
            .last()
            .cloned()
            .unwrap_or_else(|| json!({}))
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn chat_completion_body(text: &str) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1,
        "model": "mock-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
    })
}

fn load_state(config: Value) -> Arc<AppState> {
    let path = std::env::temp_dir().join(format!(
        "inferswitch-http-test-{}.json",
        uuid::Uuid::new_v4()
    ));
    std::fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();
    let config = GatewayConfig::load_from(&path).expect("config loads");
    std::fs::remove_file(&path).ok();
    Arc::new(AppState::from_config(config))
}

fn messages_payload(model: &str, text: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "max_tokens": 64,
        "messages": [{"role": "user", "content": text}],
        "stream": stream
    })
}

#[actix_web::test]
async fn backend_header_overrides_routing_and_translates() {
    let _guard = ENV_LOCK.lock().unwrap();
    let upstream = MockUpstream::start(MockReply::Json(chat_completion_body("from lm-studio"))).await;

    let state = load_state(json!({
        "backends": {"lm-studio": {"base_url": upstream.base_url}}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .insert_header(("x-backend", "lm-studio"))
        .set_json(messages_payload("claude-3-5-sonnet-20241022", "hello", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "from lm-studio");
    assert_eq!(body["stop_reason"], "end_turn");

    // The upstream saw an OpenAI-shaped request for the pinned backend.
    let forwarded = upstream.last_request().await;
    assert_eq!(forwarded["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(forwarded["messages"][0]["role"], "user");
}

#[actix_web::test]
async fn rate_limited_candidate_disables_and_fails_over() {
    let _guard = ENV_LOCK.lock().unwrap();
    let limited = MockUpstream::start(MockReply::Status(
        429,
        json!({"error": {"message": "rate limited"}}),
    ))
    .await;
    let healthy = MockUpstream::start(MockReply::Json(chat_completion_body("fallback answer"))).await;

    let state = load_state(json!({
        "backends": {
            "mock-a": {"base_url": limited.base_url},
            "mock-b": {"base_url": healthy.base_url}
        },
        "model_providers": {"model-a": "mock-a", "model-b": "mock-b"},
        "expert_models": {"coding": ["model-a", "model-b"]},
        "expert_definitions": {"coding": "programming"},
        "force_expert_routing": true
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("model-a", "write code", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["content"][0]["text"], "fallback answer");

    assert_eq!(limited.request_count().await, 1);
    assert_eq!(healthy.request_count().await, 1);

    // The rate-limited model shows up under disabled_models.
    let req = test::TestRequest::get().uri("/backends/status").to_request();
    let resp = test::call_service(&app, req).await;
    let status: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let disabled: Vec<&str> = status["disabled_models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["model"].as_str().unwrap())
        .collect();
    assert_eq!(disabled, vec!["model-a"]);

    // One miss recorded, no hits yet.
    let req = test::TestRequest::get().uri("/cache/stats").to_request();
    let resp = test::call_service(&app, req).await;
    let stats: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(stats["misses"], 1);
    assert_eq!(stats["hits"], 0);
}

#[actix_web::test]
async fn auth_failure_returns_401_without_failover_or_disable() {
    let _guard = ENV_LOCK.lock().unwrap();
    let upstream = MockUpstream::start(MockReply::Status(
        401,
        json!({"error": {"message": "invalid api key"}}),
    ))
    .await;

    let state = load_state(json!({
        "backends": {"mock": {"base_url": upstream.base_url}},
        "model_providers": {"mock-model": "mock"}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "bad-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("mock-model", "hello", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "auth_failed");

    let req = test::TestRequest::get().uri("/backends/status").to_request();
    let resp = test::call_service(&app, req).await;
    let status: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(status["disabled_models"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn identical_requests_hit_the_cache_despite_metadata() {
    let _guard = ENV_LOCK.lock().unwrap();
    let upstream = MockUpstream::start(MockReply::Json(chat_completion_body("cached"))).await;

    let state = load_state(json!({
        "backends": {"mock": {"base_url": upstream.base_url}},
        "model_providers": {"mock-model": "mock"}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("mock-model", "same question", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // Second request differs only in metadata.
    let mut payload = messages_payload("mock-model", "same question", false);
    payload["metadata"] = json!({"user_id": "someone-else"});
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["content"][0]["text"], "cached");

    assert_eq!(upstream.request_count().await, 1);

    let req = test::TestRequest::get().uri("/cache/stats").to_request();
    let resp = test::call_service(&app, req).await;
    let stats: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(stats["hits"], 1);
}

#[actix_web::test]
async fn streaming_miss_then_unary_reconstructs_from_cache() {
    let _guard = ENV_LOCK.lock().unwrap();
    let sse = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"mock-model\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"mock-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n"
    );
    let upstream = MockUpstream::start(MockReply::Sse(sse.to_string())).await;

    let state = load_state(json!({
        "backends": {"mock": {"base_url": upstream.base_url}},
        "model_providers": {"mock-model": "mock"}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("mock-model", "stream it", true))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    let start = body.find("event: message_start").unwrap();
    let stop = body.find("event: message_stop").unwrap();
    assert!(start < stop);
    assert!(body.contains("content_block_delta"));
    assert!(body.contains("Hello"));

    // The buffered stream was admitted: the unary form comes from cache.
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("mock-model", "stream it", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["content"][0]["text"], "Hello world");
    assert_eq!(body["stop_reason"], "end_turn");

    assert_eq!(upstream.request_count().await, 1);

    let req = test::TestRequest::get().uri("/cache/stats").to_request();
    let resp = test::call_service(&app, req).await;
    let stats: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(stats["hits"], 1);
}

#[actix_web::test]
async fn chat_completions_shim_round_trips_openai_shape() {
    let _guard = ENV_LOCK.lock().unwrap();
    let upstream = MockUpstream::start(MockReply::Json(chat_completion_body("shim reply"))).await;

    let state = load_state(json!({
        "backends": {"lm-studio": {"base_url": upstream.base_url}}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("authorization", "Bearer client-key"))
        .set_json(json!({
            "model": "local-model",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 32
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "shim reply");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    // System turn traveled through the canonical form and back out.
    let forwarded = upstream.last_request().await;
    assert_eq!(forwarded["messages"][0]["role"], "system");
    assert_eq!(forwarded["messages"][0]["content"], "Be brief.");
    assert_eq!(forwarded["max_tokens"], 32);
}

#[actix_web::test]
async fn count_tokens_estimates_for_openai_backends() {
    let _guard = ENV_LOCK.lock().unwrap();
    let upstream = MockUpstream::start(MockReply::Json(json!({}))).await;

    let state = load_state(json!({
        "backends": {"mock": {"base_url": upstream.base_url}},
        "model_providers": {"mock-model": "mock"}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages/count_tokens")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(json!({
            "model": "mock-model",
            "messages": [{"role": "user", "content": "twelve chars"}]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["input_tokens"], 3);
    assert_eq!(upstream.request_count().await, 0);
}

#[actix_web::test]
async fn chat_template_endpoint_formats_chatml() {
    let _guard = ENV_LOCK.lock().unwrap();
    let state = load_state(json!({}));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages/chat-template")
        .set_json(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 16,
            "system": "Stay calm.",
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["message_count"], 2);
    assert_eq!(body["roles"], json!(["system", "user"]));
    let chatml = body["formatted"]["chatml"].as_str().unwrap();
    assert!(chatml.starts_with("<|im_start|>system\nStay calm.<|im_end|>"));
    assert!(chatml.ends_with("<|im_start|>assistant\n"));
}

#[actix_web::test]
async fn missing_headers_reject_before_routing() {
    let _guard = ENV_LOCK.lock().unwrap();
    let state = load_state(json!({}));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    // No x-api-key and no stored OAuth token.
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("gpt-4", "hi", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 401);

    // Key present but anthropic-version missing.
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .set_json(messages_payload("gpt-4", "hi", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
}

#[actix_web::test]
async fn out_of_range_sampling_params_reject_before_upstream() {
    let _guard = ENV_LOCK.lock().unwrap();
    let upstream = MockUpstream::start(MockReply::Json(chat_completion_body("never"))).await;

    let state = load_state(json!({
        "backends": {"mock": {"base_url": upstream.base_url}},
        "model_providers": {"mock-model": "mock"}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let mut payload = messages_payload("mock-model", "hello", false);
    payload["temperature"] = json!(1.5);
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["error"]["type"], "bad_request");

    let mut payload = messages_payload("mock-model", "hello", false);
    payload["top_p"] = json!(-0.5);
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);

    // Negative top_k never deserializes into the unsigned field.
    let mut payload = messages_payload("mock-model", "hello", false);
    payload["top_k"] = json!(-1);
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);

    assert_eq!(upstream.request_count().await, 0);
}

#[actix_web::test]
async fn unroutable_model_is_404_no_route() {
    let _guard = ENV_LOCK.lock().unwrap();
    let state = load_state(json!({}));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("mystery-model", "hi", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 404);
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["error"]["type"], "no_route");
}

#[actix_web::test]
async fn cache_clear_reports_removed_entries() {
    let _guard = ENV_LOCK.lock().unwrap();
    let upstream = MockUpstream::start(MockReply::Json(chat_completion_body("x"))).await;
    let state = load_state(json!({
        "backends": {"mock": {"base_url": upstream.base_url}},
        "model_providers": {"mock-model": "mock"}
    }));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "test-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_json(messages_payload("mock-model", "warm the cache", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post().uri("/cache/clear").to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["cleared"], 1);
}

#[actix_web::test]
async fn oauth_status_reports_unauthenticated_and_authorize_returns_pkce() {
    let _guard = ENV_LOCK.lock().unwrap();
    let token_path = std::env::temp_dir().join(format!(
        "inferswitch-oauth-http-{}.json",
        uuid::Uuid::new_v4()
    ));
    std::env::set_var("INFERSWITCH_OAUTH_TOKEN_PATH", &token_path);

    let state = load_state(json!({}));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/oauth/status").to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["authenticated"], false);

    let req = test::TestRequest::get().uri("/oauth/authorize").to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let auth_url = body["auth_url"].as_str().unwrap();
    assert!(auth_url.contains("code_challenge_method=S256"));
    assert!(body["code_verifier"].as_str().unwrap().len() >= 43);

    std::env::remove_var("INFERSWITCH_OAUTH_TOKEN_PATH");
}
