//! OAuth credential channel for Anthropic.
//!
//! Device-facing PKCE flow plus persisted token state. The pipeline only
//! consumes `bearer_token()`, which returns a live access token and handles
//! refresh internally; refreshes serialize through a lock so concurrent
//! requests do not race the token endpoint.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Beta header value Anthropic requires on OAuth-authenticated calls.
pub const OAUTH_BETA: &str = "oauth-2025-04-20";

const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REFRESH_BUFFER_SECONDS: f64 = 300.0;

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            redirect_uri: "https://console.anthropic.com/oauth/code/callback".to_string(),
            auth_url: "https://claude.ai/oauth/authorize".to_string(),
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
            scopes: "org:create_api_key user:profile user:inference".to_string(),
        }
    }
}

impl OAuthConfig {
    pub fn with_client_id(client_id: Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(id) = client_id {
            config.client_id = id;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: f64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenInfo {
    pub fn expires_in_seconds(&self) -> f64 {
        (self.expires_at - unix_now()).max(0.0)
    }

    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn default_storage_path() -> PathBuf {
    if let Ok(path) = std::env::var("INFERSWITCH_OAUTH_TOKEN_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".inferswitch").join("oauth_tokens.json")
}

pub struct OAuthManager {
    config: OAuthConfig,
    storage_path: PathBuf,
    http: reqwest::Client,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl OAuthManager {
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            storage_path: default_storage_path(),
            http,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_storage_path(mut self, path: PathBuf) -> Self {
        self.storage_path = path;
        self
    }

    /// Generate a PKCE verifier/challenge pair (S256).
    pub fn generate_pkce_pair(&self) -> (String, String) {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        (verifier, challenge)
    }

    /// Build the authorization URL. Returns `(url, state, code_verifier)`;
    /// the caller keeps the verifier for the callback exchange.
    pub fn authorization_url(&self) -> (String, String, String) {
        let state = uuid::Uuid::new_v4().simple().to_string();
        let (verifier, challenge) = self.generate_pkce_pair();
        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.config.auth_url,
            self.config.client_id,
            urlencode(&self.config.redirect_uri),
            urlencode(&self.config.scopes),
            state,
            challenge,
        );
        (url, state, verifier)
    }

    /// Exchange an authorization code for tokens and persist them.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenInfo> {
        // The token endpoint expects the verifier in `state` as well.
        let body = json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": &self.config.redirect_uri,
            "client_id": &self.config.client_id,
            "code_verifier": code_verifier,
            "state": code_verifier,
        });
        self.post_token(&body).await.context("token exchange failed")
    }

    /// Refresh the access token and persist the result.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenInfo> {
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": &self.config.client_id,
        });
        let mut token = self.post_token(&body).await.context("token refresh failed")?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
            self.store_token(&token)?;
        }
        Ok(token)
    }

    async fn post_token(&self, body: &serde_json::Value) -> Result<TokenInfo> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header("content-type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", OAUTH_BETA)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let payload = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("token endpoint returned {}: {}", status, payload));
        }

        let parsed: serde_json::Value = serde_json::from_str(&payload)?;
        let access_token = parsed
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("token response missing access_token"))?
            .to_string();
        let expires_in = parsed
            .get("expires_in")
            .and_then(|v| v.as_f64())
            .unwrap_or(3600.0);
        let token = TokenInfo {
            access_token,
            refresh_token: parsed
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            expires_at: unix_now() + expires_in,
            token_type: parsed
                .get("token_type")
                .and_then(|v| v.as_str())
                .unwrap_or("Bearer")
                .to_string(),
        };
        self.store_token(&token)?;
        Ok(token)
    }

    pub fn store_token(&self, token: &TokenInfo) -> Result<()> {
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.storage_path, serde_json::to_vec(token)?)?;
        tracing::info!("OAuth token stored");
        Ok(())
    }

    pub fn load_token(&self) -> Option<TokenInfo> {
        let raw = std::fs::read_to_string(&self.storage_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(err) => {
                tracing::error!(%err, "failed to parse stored OAuth token");
                None
            }
        }
    }

    pub fn clear_tokens(&self) {
        if std::fs::remove_file(&self.storage_path).is_ok() {
            tracing::info!("OAuth tokens cleared");
        }
    }

    /// A live access token, refreshed when within the expiry buffer.
    ///
    /// Returns `None` when no usable token exists; callers fall back to
    /// static API keys.
    pub async fn bearer_token(&self) -> Option<String> {
        let token = self.load_token()?;
        if token.expires_in_seconds() > REFRESH_BUFFER_SECONDS {
            return Some(token.access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited.
        let token = self.load_token()?;
        if token.expires_in_seconds() > REFRESH_BUFFER_SECONDS {
            return Some(token.access_token);
        }

        let refresh_token = token.refresh_token.as_deref()?;
        match self.refresh(refresh_token).await {
            Ok(fresh) => Some(fresh.access_token),
            Err(err) => {
                tracing::error!(%err, "OAuth token refresh failed");
                None
            }
        }
    }

    pub fn status(&self) -> serde_json::Value {
        match self.load_token() {
            Some(token) => json!({
                "authenticated": true,
                "expired": token.is_expired(),
                "expires_in_seconds": token.expires_in_seconds(),
                "has_refresh_token": token.refresh_token.is_some(),
            }),
            None => json!({
                "authenticated": false,
                "message": "No OAuth token found",
            }),
        }
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
