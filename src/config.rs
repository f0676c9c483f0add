//! Gateway configuration.
//!
//! Layers built-in defaults, `inferswitch.config.json` from the working
//! directory, and environment variables into an immutable snapshot that the
//! hot path reads without synchronization. Validation is total: a malformed
//! file, an unknown backend reference, or a missing credential for a
//! referenced backend fails startup with a descriptive error.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "inferswitch.config.json";

const DEFAULT_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_DISABLE_DURATION_SECONDS: u64 = 300;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;
const DEFAULT_STREAM_BUFFER_LIMIT: usize = 1024 * 1024;

/// Which wire protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
}

/// One named upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// A difficulty bucket: a numeric range mapped to an ordered candidate list.
#[derive(Debug, Clone, PartialEq)]
pub struct DifficultyBucket {
    pub min: f32,
    pub max: f32,
    pub models: Vec<String>,
}

impl DifficultyBucket {
    pub fn contains(&self, rating: f32) -> bool {
        rating >= self.min && rating <= self.max
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl: Duration,
}

/// The routing mode the snapshot resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Expert,
    Difficulty,
    Normal,
}

/// Immutable effective configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backends: HashMap<String, BackendConfig>,
    pub model_providers: HashMap<String, String>,
    pub model_overrides: HashMap<String, String>,
    pub difficulty_models: Vec<DifficultyBucket>,
    pub expert_models: BTreeMap<String, Vec<String>>,
    pub expert_definitions: BTreeMap<String, String>,
    pub force_expert_routing: bool,
    pub force_difficulty_routing: bool,
    pub fallback: Option<(String, String)>,
    /// Process-wide backend pin from `INFERSWITCH_BACKEND`.
    pub backend_override: Option<String>,
    pub cache: CacheSettings,
    pub disable_duration: Duration,
    pub oauth_client_id: Option<String>,
    pub proxy_mode: bool,
    /// Cap on the per-response buffer used for streaming cache admission.
    pub stream_buffer_limit: usize,
}

// Raw file shapes.

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    backends: HashMap<String, FileBackend>,
    #[serde(default)]
    model_providers: HashMap<String, String>,
    #[serde(default)]
    model_overrides: HashMap<String, String>,
    default_model_override: Option<String>,
    #[serde(default)]
    difficulty_models: HashMap<String, ModelsEntry>,
    #[serde(default)]
    expert_models: HashMap<String, ModelsEntry>,
    #[serde(default)]
    expert_definitions: BTreeMap<String, String>,
    #[serde(default)]
    force_expert_routing: bool,
    #[serde(default)]
    force_difficulty_routing: bool,
    fallback: Option<FileFallback>,
    cache: Option<FileCache>,
    model_availability: Option<FileAvailability>,
    #[serde(default)]
    providers_auth: HashMap<String, FileProviderAuth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBackend {
    base_url: Option<String>,
    api_key: Option<String>,
    kind: Option<BackendKind>,
    timeout_seconds: Option<u64>,
}

/// Candidate lists accept a bare string or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ModelsEntry {
    One(String),
    Many(Vec<String>),
}

impl ModelsEntry {
    fn into_vec(self) -> Vec<String> {
        match self {
            ModelsEntry::One(s) => vec![s],
            ModelsEntry::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FileFallback {
    provider: String,
    model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCache {
    enabled: Option<bool>,
    max_entries: Option<usize>,
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAvailability {
    disable_duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProviderAuth {
    oauth: Option<FileOAuth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOAuth {
    client_id: Option<String>,
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_backends() -> HashMap<String, BackendConfig> {
    let mut backends = HashMap::new();
    backends.insert(
        "anthropic".to_string(),
        BackendConfig {
            name: "anthropic".to_string(),
            kind: BackendKind::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: env_nonempty("ANTHROPIC_API_KEY"),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        },
    );
    backends.insert(
        "openai".to_string(),
        BackendConfig {
            name: "openai".to_string(),
            kind: BackendKind::OpenAiCompatible,
            base_url: env_nonempty("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: env_nonempty("OPENAI_API_KEY"),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        },
    );
    backends.insert(
        "openrouter".to_string(),
        BackendConfig {
            name: "openrouter".to_string(),
            kind: BackendKind::OpenAiCompatible,
            base_url: env_nonempty("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            api_key: env_nonempty("OPENROUTER_API_KEY"),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        },
    );
    backends.insert(
        "lm-studio".to_string(),
        BackendConfig {
            name: "lm-studio".to_string(),
            kind: BackendKind::OpenAiCompatible,
            base_url: env_nonempty("LM_STUDIO_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:1234".to_string()),
            // LM-Studio accepts any placeholder key.
            api_key: Some(env_nonempty("LM_STUDIO_API_KEY").unwrap_or_else(|| "lm-studio".to_string())),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        },
    );
    backends
}

fn default_model_providers() -> HashMap<String, String> {
    let pairs: [(&str, &str); 10] = [
        ("claude-3-5-haiku-20241022", "anthropic"),
        ("claude-3-5-sonnet-20241022", "anthropic"),
        ("claude-3-opus-20240229", "anthropic"),
        ("claude-3-sonnet-20240229", "anthropic"),
        ("claude-3-haiku-20240307", "anthropic"),
        ("claude-haiku-4-5-20251001", "anthropic"),
        ("gpt-4-turbo-preview", "openai"),
        ("gpt-4", "openai"),
        ("gpt-3.5-turbo", "openai"),
        ("gpt-4-vision-preview", "openai"),
    ];
    pairs
        .iter()
        .map(|(model, provider)| (model.to_string(), provider.to_string()))
        .collect()
}

/// Parse a difficulty bucket key: `"3"`, `"0-3"`, or `"[0,3]"`.
fn parse_difficulty_key(key: &str) -> Result<(f32, f32)> {
    let trimmed = key.trim().trim_start_matches('[').trim_end_matches(']');
    let parts: Vec<&str> = if trimmed.contains('-') {
        trimmed.splitn(2, '-').collect()
    } else if trimmed.contains(',') {
        trimmed.splitn(2, ',').collect()
    } else {
        let value: f32 = trimmed
            .parse()
            .map_err(|_| anyhow!("invalid difficulty key: {:?}", key))?;
        return Ok((value, value));
    };
    if parts.len() != 2 {
        bail!("invalid difficulty range: {:?}", key);
    }
    let min: f32 = parts[0]
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid difficulty range: {:?}", key))?;
    let max: f32 = parts[1]
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid difficulty range: {:?}", key))?;
    if min > max {
        bail!("difficulty range is inverted: {:?}", key);
    }
    Ok((min, max))
}

/// `claude-*` and `gpt-*` have well-known homes.
pub fn pattern_backend(model: &str) -> Option<&'static str> {
    if model.starts_with("claude-") {
        Some("anthropic")
    } else if model.starts_with("gpt-") {
        Some("openai")
    } else {
        None
    }
}

impl GatewayConfig {
    /// Load the effective configuration from the working directory and env.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let file: FileConfig = if path.is_file() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("malformed config file {}", path.display()))?
        } else {
            FileConfig::default()
        };
        Self::resolve(file)
    }

    fn resolve(file: FileConfig) -> Result<Self> {
        let mut backends = default_backends();

        for (name, spec) in file.backends {
            match backends.get_mut(&name) {
                Some(existing) => {
                    if let Some(base_url) = spec.base_url {
                        existing.base_url = base_url;
                    }
                    if let Some(api_key) = spec.api_key {
                        existing.api_key = Some(api_key);
                    }
                    if let Some(timeout) = spec.timeout_seconds {
                        existing.timeout_seconds = timeout;
                    }
                    if let Some(kind) = spec.kind {
                        existing.kind = kind;
                    }
                }
                None => {
                    let base_url = spec
                        .base_url
                        .ok_or_else(|| anyhow!("backend {:?} is missing base_url", name))?;
                    backends.insert(
                        name.clone(),
                        BackendConfig {
                            name: name.clone(),
                            kind: spec.kind.unwrap_or(BackendKind::OpenAiCompatible),
                            base_url,
                            api_key: spec.api_key,
                            timeout_seconds: spec
                                .timeout_seconds
                                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
                        },
                    );
                }
            }
        }

        let mut model_providers = default_model_providers();
        model_providers.extend(file.model_providers);

        let mut model_overrides = HashMap::new();
        if let Some(raw) = env_nonempty("INFERSWITCH_MODEL_OVERRIDE") {
            for mapping in raw.split(',') {
                if let Some((requested, substitute)) = mapping.split_once(':') {
                    model_overrides
                        .insert(requested.trim().to_string(), substitute.trim().to_string());
                }
            }
        }
        // File config takes precedence over the env var.
        model_overrides.extend(file.model_overrides);
        let default_override = file
            .default_model_override
            .or_else(|| env_nonempty("INFERSWITCH_DEFAULT_MODEL"));
        if let Some(model) = default_override {
            model_overrides.entry("*".to_string()).or_insert(model);
        }

        let mut difficulty_models = Vec::new();
        for (key, entry) in file.difficulty_models {
            let (min, max) =
                parse_difficulty_key(&key).context("invalid difficulty_models key")?;
            difficulty_models.push(DifficultyBucket {
                min,
                max,
                models: entry.into_vec(),
            });
        }
        // Overlaps resolve by numeric order of (min, max).
        difficulty_models.sort_by(|a, b| {
            (a.min, a.max)
                .partial_cmp(&(b.min, b.max))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let expert_models: BTreeMap<String, Vec<String>> = file
            .expert_models
            .into_iter()
            .map(|(name, entry)| (name, entry.into_vec()))
            .collect();

        let force_expert_routing = env_flag("INFERSWITCH_FORCE_EXPERT_ROUTING")
            .unwrap_or(file.force_expert_routing);
        let force_difficulty_routing = env_flag("INFERSWITCH_FORCE_DIFFICULTY_ROUTING")
            .unwrap_or(file.force_difficulty_routing);

        let fallback = match (
            env_nonempty("INFERSWITCH_FALLBACK_PROVIDER"),
            env_nonempty("INFERSWITCH_FALLBACK_MODEL"),
        ) {
            (Some(provider), Some(model)) => Some((provider, model)),
            _ => file.fallback.map(|f| (f.provider, f.model)),
        };

        let backend_override = env_nonempty("INFERSWITCH_BACKEND");

        let file_cache = file.cache.unwrap_or_default();
        let cache = CacheSettings {
            enabled: env_flag("CACHE_ENABLED")
                .or(file_cache.enabled)
                .unwrap_or(true),
            max_entries: env_nonempty("CACHE_MAX_SIZE")
                .and_then(|v| v.parse().ok())
                .or(file_cache.max_entries)
                .unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
            ttl: Duration::from_secs(
                env_nonempty("CACHE_TTL_SECONDS")
                    .and_then(|v| v.parse().ok())
                    .or(file_cache.ttl_seconds)
                    .unwrap_or(DEFAULT_CACHE_TTL_SECONDS),
            ),
        };

        let disable_duration = Duration::from_secs(
            env_nonempty("INFERSWITCH_MODEL_DISABLE_DURATION")
                .and_then(|v| v.parse().ok())
                .or(file
                    .model_availability
                    .and_then(|a| a.disable_duration_seconds))
                .unwrap_or(DEFAULT_DISABLE_DURATION_SECONDS),
        );

        let oauth_client_id = env_nonempty("OAUTH_CLIENT_ID").or_else(|| {
            file.providers_auth
                .get("anthropic")
                .and_then(|auth| auth.oauth.as_ref())
                .and_then(|oauth| oauth.client_id.clone())
        });

        let config = GatewayConfig {
            backends,
            model_providers,
            model_overrides,
            difficulty_models,
            expert_models,
            expert_definitions: file.expert_definitions,
            force_expert_routing,
            force_difficulty_routing,
            fallback,
            backend_override,
            cache,
            disable_duration,
            oauth_client_id,
            proxy_mode: env_flag("PROXY_MODE").unwrap_or(true),
            stream_buffer_limit: env_nonempty("INFERSWITCH_STREAM_BUFFER_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STREAM_BUFFER_LIMIT),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (model, provider) in &self.model_providers {
            if !self.backends.contains_key(provider) {
                bail!(
                    "model_providers maps {:?} to unknown backend {:?}",
                    model,
                    provider
                );
            }
        }

        if let Some((provider, _model)) = &self.fallback {
            if !self.backends.contains_key(provider) {
                bail!("fallback references unknown backend {:?}", provider);
            }
        }

        if let Some(name) = &self.backend_override {
            if !self.backends.contains_key(name) {
                bail!("INFERSWITCH_BACKEND references unknown backend {:?}", name);
            }
        }

        for (expert, models) in &self.expert_models {
            for model in models {
                if self.backend_for_model(model).is_none() {
                    bail!(
                        "expert_models[{:?}] lists model {:?} with no resolvable backend",
                        expert,
                        model
                    );
                }
            }
        }
        for bucket in &self.difficulty_models {
            for model in &bucket.models {
                if self.backend_for_model(model).is_none() {
                    bail!(
                        "difficulty_models [{}-{}] lists model {:?} with no resolvable backend",
                        bucket.min,
                        bucket.max,
                        model
                    );
                }
            }
        }

        // A referenced hosted backend must have some credential at startup.
        for name in self.referenced_backends() {
            let backend = &self.backends[&name];
            let needs_key = matches!(name.as_str(), "openai" | "openrouter")
                || (name == "anthropic" && self.oauth_client_id.is_none());
            if needs_key && backend.api_key.is_none() {
                bail!(
                    "backend {:?} is referenced by the routing configuration but has no API key",
                    name
                );
            }
        }

        if self.routing_mode() == RoutingMode::Expert && !self.difficulty_models.is_empty() {
            tracing::warn!(
                "both expert_models and difficulty_models are configured; expert routing wins"
            );
        }
        Ok(())
    }

    /// Backends actually named by routing tables (defaults excluded).
    fn referenced_backends(&self) -> Vec<String> {
        let mut referenced = std::collections::HashSet::new();
        if let Some(name) = &self.backend_override {
            referenced.insert(name.clone());
        }
        if let Some((provider, _)) = &self.fallback {
            referenced.insert(provider.clone());
        }
        for models in self.expert_models.values() {
            for model in models {
                if let Some(backend) = self.backend_for_model(model) {
                    referenced.insert(backend);
                }
            }
        }
        for bucket in &self.difficulty_models {
            for model in &bucket.models {
                if let Some(backend) = self.backend_for_model(model) {
                    referenced.insert(backend);
                }
            }
        }
        referenced.into_iter().collect()
    }

    /// Resolve a concrete model to its backend via `model_providers`, then
    /// the `claude-*`/`gpt-*` patterns.
    pub fn backend_for_model(&self, model: &str) -> Option<String> {
        if let Some(provider) = self.model_providers.get(model) {
            return Some(provider.clone());
        }
        pattern_backend(model)
            .filter(|name| self.backends.contains_key(*name))
            .map(|name| name.to_string())
    }

    /// Apply `model_overrides` (exact match first, then the `"*"` wildcard).
    pub fn override_model<'a>(&'a self, model: &'a str) -> &'a str {
        if let Some(substitute) = self.model_overrides.get(model) {
            return substitute;
        }
        if let Some(substitute) = self.model_overrides.get("*") {
            return substitute;
        }
        model
    }

    pub fn routing_mode(&self) -> RoutingMode {
        let expert_configured =
            !self.expert_models.is_empty() && !self.expert_definitions.is_empty();
        if self.force_expert_routing && expert_configured {
            return RoutingMode::Expert;
        }
        if self.force_difficulty_routing && !self.difficulty_models.is_empty() {
            return RoutingMode::Difficulty;
        }
        if expert_configured {
            return RoutingMode::Expert;
        }
        if !self.difficulty_models.is_empty() {
            return RoutingMode::Difficulty;
        }
        RoutingMode::Normal
    }
}
