//! Shared helpers: env/tracing bootstrap, HTTP client construction, the
//! actix app state, and wire error envelopes.

use std::sync::Arc;

use actix_web::HttpResponse;

use crate::adapter::{AdapterRegistry, ErrorKind};
use crate::availability::AvailabilityRegistry;
use crate::cache::ResponseCache;
use crate::classifier::{Classifier, KeywordClassifier};
use crate::config::GatewayConfig;
use crate::oauth::{OAuthConfig, OAuthManager};
use crate::pipeline::RequestPipeline;
use crate::router::ModelRouter;

/// Initialize dotenv and structured tracing.
///
/// Filter comes from `RUST_LOG` when set, else `LOG_LEVEL`, else `info`.
pub fn init_tracing() {
    let env_loaded = dotenvy::dotenv().is_ok();

    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if env_loaded {
        tracing::info!("environment loaded from .env");
    }
}

/// Bind address: `INFERSWITCH_PORT` (default 1235) on all interfaces.
pub fn env_bind_addr() -> String {
    let port = std::env::var("INFERSWITCH_PORT")
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(1235);
    format!("0.0.0.0:{}", port)
}

/// Build the shared upstream HTTP client.
///
/// Environment:
/// - INFERSWITCH_NO_PROXY = 1|true|yes|on -> disable all proxies
/// - INFERSWITCH_PROXY_URL = <url>        -> proxy for all schemes
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    let no_proxy = std::env::var("INFERSWITCH_NO_PROXY")
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false);
    if no_proxy {
        builder = builder.no_proxy();
    } else if let Ok(url) = std::env::var("INFERSWITCH_PROXY_URL") {
        let url = url.trim();
        if !url.is_empty() {
            if let Ok(proxy) = reqwest::Proxy::all(url) {
                builder = builder.proxy(proxy);
            }
        }
    }

    builder = builder.user_agent(format!("inferswitch/{}", env!("CARGO_PKG_VERSION")));
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Shared application state used by the HTTP handlers.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pipeline: Arc<RequestPipeline>,
    pub adapters: Arc<AdapterRegistry>,
    pub cache: Arc<ResponseCache>,
    pub availability: Arc<AvailabilityRegistry>,
    pub oauth: Arc<OAuthManager>,
}

impl AppState {
    /// Wire the whole dependency graph from one config snapshot.
    pub fn from_config(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let http = build_http_client_from_env();

        let oauth = Arc::new(OAuthManager::new(
            OAuthConfig::with_client_id(config.oauth_client_id.clone()),
            http.clone(),
        ));
        let adapters = Arc::new(AdapterRegistry::from_config(&config, http, oauth.clone()));
        let availability = Arc::new(AvailabilityRegistry::new(config.disable_duration));
        let cache = Arc::new(ResponseCache::new(
            config.cache.max_entries,
            config.cache.ttl,
        ));
        let classifier: Option<Arc<dyn Classifier>> = Some(Arc::new(KeywordClassifier::new()));
        let router = Arc::new(ModelRouter::new(
            config.clone(),
            availability.clone(),
            classifier,
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            config.clone(),
            adapters.clone(),
            router,
            cache.clone(),
            availability.clone(),
        ));

        Self {
            config,
            pipeline,
            adapters,
            cache,
            availability,
            oauth,
        }
    }
}

fn status_code(kind: ErrorKind) -> actix_web::http::StatusCode {
    actix_web::http::StatusCode::from_u16(kind.http_status())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
}

/// Anthropic error envelope for `/v1/messages`.
pub fn anthropic_error_response(kind: ErrorKind, message: &str) -> HttpResponse {
    HttpResponse::build(status_code(kind)).json(serde_json::json!({
        "type": "error",
        "error": {"type": kind.wire_type(), "message": message}
    }))
}

/// OpenAI error envelope for `/v1/chat/completions`.
pub fn openai_error_response(kind: ErrorKind, message: &str) -> HttpResponse {
    HttpResponse::build(status_code(kind)).json(serde_json::json!({
        "error": {
            "message": message,
            "type": kind.wire_type(),
            "code": kind.http_status(),
        }
    }))
}

/// Permissive-by-default CORS, narrowed via CORS_ALLOWED_ORIGINS.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allow_any_method()
        .allow_any_header();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for origin in origins.split(',') {
                let origin = origin.trim();
                if !origin.is_empty() {
                    cors = cors.allowed_origin(origin);
                }
            }
        }
        _ => cors = cors.allow_any_origin(),
    }
    cors
}
