//! Request routing.
//!
//! Resolves a request to an ordered, non-empty list of `(backend, model)`
//! candidates. Resolution order: explicit header pin, process-wide pin,
//! expert routing, difficulty routing, direct model mapping, prefix
//! patterns, then the configured fallback. The first rule that yields a
//! concrete model provides the primary; later rules contribute fallbacks.
//! Disabled models are filtered while candidate lists are built, so a model
//! in cool-down is never the head of a decision and never retried within one
//! request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::availability::AvailabilityRegistry;
use crate::chat_template::TemplateMessage;
use crate::classifier::Classifier;
use crate::config::{GatewayConfig, RoutingMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub backend: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Tried head-first by the pipeline. Never empty.
    pub candidates: Vec<Candidate>,
    pub expert: Option<String>,
    pub difficulty: Option<f32>,
}

/// No rule produced a candidate.
#[derive(Debug, Clone)]
pub struct NoRoute {
    pub message: String,
}

impl std::fmt::Display for NoRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for NoRoute {}

pub struct ModelRouter {
    config: Arc<GatewayConfig>,
    availability: Arc<AvailabilityRegistry>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl ModelRouter {
    pub fn new(
        config: Arc<GatewayConfig>,
        availability: Arc<AvailabilityRegistry>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> Self {
        Self {
            config,
            availability,
            classifier,
        }
    }

    /// Decide where a request goes.
    ///
    /// `requested_model` is the client-supplied model; overrides are applied
    /// here, before any rule runs, and are not re-applied to models chosen by
    /// expert or difficulty routing.
    pub fn decide(
        &self,
        requested_model: &str,
        explicit_backend: Option<&str>,
        messages: &[TemplateMessage],
        now: Instant,
    ) -> Result<RouteDecision, NoRoute> {
        let model = self.config.override_model(requested_model).to_string();

        // Rules 1–2: an explicit pin bypasses everything, no fallback list.
        if let Some(backend) = explicit_backend
            .map(|s| s.to_string())
            .or_else(|| self.config.backend_override.clone())
        {
            if !self.config.backends.contains_key(&backend) {
                return Err(NoRoute {
                    message: format!("backend {:?} not found", backend),
                });
            }
            if !self.availability.is_available(&model, now) {
                return Err(NoRoute {
                    message: format!("model {:?} is temporarily disabled", model),
                });
            }
            tracing::debug!(backend, model, "routing pinned to backend");
            return Ok(RouteDecision {
                candidates: vec![Candidate { backend, model }],
                expert: None,
                difficulty: None,
            });
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut expert = None;
        let mut difficulty = None;

        match self.config.routing_mode() {
            RoutingMode::Expert => {
                let name = self.uniform_expert().or_else(|| {
                    self.classifier.as_ref().and_then(|c| {
                        c.classify_expert(messages, &self.config.expert_definitions)
                    })
                });
                if let Some(name) = name {
                    if let Some(models) = self.config.expert_models.get(&name) {
                        self.push_available(models, &mut candidates, &mut seen, now);
                    }
                    expert = Some(name);
                }
            }
            RoutingMode::Difficulty => {
                if let Some(bucket) = self.uniform_bucket() {
                    self.push_available(&bucket.models, &mut candidates, &mut seen, now);
                } else if let Some(rating) = self
                    .classifier
                    .as_ref()
                    .and_then(|c| c.rate_difficulty(messages))
                {
                    difficulty = Some(rating);
                    if let Some(bucket) = self
                        .config
                        .difficulty_models
                        .iter()
                        .find(|b| b.contains(rating))
                    {
                        self.push_available(&bucket.models, &mut candidates, &mut seen, now);
                    }
                }
            }
            RoutingMode::Normal => {}
        }

        // Rules 5–6: the client model itself.
        if let Some(backend) = self.config.backend_for_model(&model) {
            self.push_candidate(&backend, &model, &mut candidates, &mut seen, now);
        }

        // Rule 7: configured fallback, always last.
        if let Some((provider, fallback_model)) = &self.config.fallback {
            self.push_candidate(provider, fallback_model, &mut candidates, &mut seen, now);
        }

        if candidates.is_empty() {
            return Err(NoRoute {
                message: format!("no backend found for model {:?}", model),
            });
        }

        tracing::debug!(
            primary_backend = %candidates[0].backend,
            primary_model = %candidates[0].model,
            fallbacks = candidates.len() - 1,
            ?expert,
            ?difficulty,
            "route decided"
        );

        Ok(RouteDecision {
            candidates,
            expert,
            difficulty,
        })
    }

    fn push_available(
        &self,
        models: &[String],
        candidates: &mut Vec<Candidate>,
        seen: &mut HashSet<(String, String)>,
        now: Instant,
    ) {
        for model in models {
            if let Some(backend) = self.config.backend_for_model(model) {
                self.push_candidate(&backend, model, candidates, seen, now);
            } else {
                tracing::warn!(model, "candidate model has no resolvable backend, skipping");
            }
        }
    }

    fn push_candidate(
        &self,
        backend: &str,
        model: &str,
        candidates: &mut Vec<Candidate>,
        seen: &mut HashSet<(String, String)>,
        now: Instant,
    ) {
        if !self.availability.is_available(model, now) {
            tracing::debug!(model, "skipping disabled model");
            return;
        }
        if seen.insert((backend.to_string(), model.to_string())) {
            candidates.push(Candidate {
                backend: backend.to_string(),
                model: model.to_string(),
            });
        }
    }

    /// When every difficulty bucket lists the same candidates, rating is
    /// pointless; use the first bucket directly.
    fn uniform_bucket(&self) -> Option<&crate::config::DifficultyBucket> {
        let first = self.config.difficulty_models.first()?;
        self.config
            .difficulty_models
            .iter()
            .all(|b| b.models == first.models)
            .then_some(first)
    }

    /// When every expert maps to the same candidate list, classification is
    /// pointless; use the first expert directly.
    fn uniform_expert(&self) -> Option<String> {
        let mut iter = self.config.expert_models.iter();
        let (first_name, first_models) = iter.next()?;
        for (_, models) in iter.by_ref() {
            if models != first_models {
                return None;
            }
        }
        Some(first_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::KeywordClassifier;
    use std::time::Duration;

    fn config(json: serde_json::Value) -> Arc<GatewayConfig> {
        std::env::remove_var("INFERSWITCH_BACKEND");
        let mut value = json;
        // Give referenced hosted backends a key so validation passes.
        if value.get("backends").is_none() {
            value["backends"] = serde_json::json!({
                "anthropic": {"api_key": "sk-test"},
                "openai": {"api_key": "sk-test"}
            });
        }
        let tmp = std::env::temp_dir().join(format!(
            "inferswitch-router-test-{}.json",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&tmp, serde_json::to_vec(&value).unwrap()).unwrap();
        let config = GatewayConfig::load_from(&tmp).unwrap();
        std::fs::remove_file(&tmp).ok();
        Arc::new(config)
    }

    fn router(config: Arc<GatewayConfig>) -> (ModelRouter, Arc<AvailabilityRegistry>) {
        let availability = Arc::new(AvailabilityRegistry::new(Duration::from_secs(300)));
        let router = ModelRouter::new(
            config,
            availability.clone(),
            Some(Arc::new(KeywordClassifier::new())),
        );
        (router, availability)
    }

    fn user(content: &str) -> Vec<TemplateMessage> {
        vec![TemplateMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }]
    }

    #[test]
    fn explicit_header_pins_backend_without_fallbacks() {
        let (router, _) = router(config(serde_json::json!({})));
        let decision = router
            .decide(
                "claude-3-5-sonnet-20241022",
                Some("lm-studio"),
                &user("hi"),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(decision.candidates.len(), 1);
        assert_eq!(decision.candidates[0].backend, "lm-studio");
        assert_eq!(decision.candidates[0].model, "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn unknown_explicit_backend_is_no_route() {
        let (router, _) = router(config(serde_json::json!({})));
        let err = router
            .decide("gpt-4", Some("missing"), &user("hi"), Instant::now())
            .unwrap_err();
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn direct_mapping_routes_known_models() {
        let (router, _) = router(config(serde_json::json!({})));
        let decision = router
            .decide("gpt-4", None, &user("hi"), Instant::now())
            .unwrap();
        assert_eq!(decision.candidates[0].backend, "openai");
    }

    #[test]
    fn pattern_matching_covers_unlisted_claude_models() {
        let (router, _) = router(config(serde_json::json!({})));
        let decision = router
            .decide("claude-99-futuristic", None, &user("hi"), Instant::now())
            .unwrap();
        assert_eq!(decision.candidates[0].backend, "anthropic");
    }

    #[test]
    fn overrides_apply_before_rules() {
        let (router, _) = router(config(serde_json::json!({
            "model_overrides": {"claude-3-5-sonnet-20241022": "gpt-4"}
        })));
        let decision = router
            .decide(
                "claude-3-5-sonnet-20241022",
                None,
                &user("hi"),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(decision.candidates[0].backend, "openai");
        assert_eq!(decision.candidates[0].model, "gpt-4");
    }

    #[test]
    fn expert_routing_orders_candidates_and_appends_fallback() {
        let (router, _) = router(config(serde_json::json!({
            "expert_models": {
                "coding": ["claude-3-5-sonnet-20241022", "gpt-4"],
                "writing": ["claude-3-haiku-20240307"]
            },
            "expert_definitions": {
                "coding": "programming code debugging software",
                "writing": "essays prose editing"
            },
            "force_expert_routing": true,
            "fallback": {"provider": "anthropic", "model": "claude-3-haiku-20240307"}
        })));
        let decision = router
            .decide(
                "claude-3-5-sonnet-20241022",
                None,
                &user("debugging my software code"),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(decision.expert.as_deref(), Some("coding"));
        let models: Vec<&str> = decision
            .candidates
            .iter()
            .map(|c| c.model.as_str())
            .collect();
        assert_eq!(
            models,
            vec![
                "claude-3-5-sonnet-20241022",
                "gpt-4",
                "claude-3-haiku-20240307"
            ]
        );
    }

    #[test]
    fn disabled_models_are_skipped_not_retried() {
        let (router, availability) = router(config(serde_json::json!({
            "expert_models": {"coding": ["claude-3-5-sonnet-20241022", "gpt-4"]},
            "expert_definitions": {"coding": "programming"},
            "force_expert_routing": true
        })));
        let now = Instant::now();
        availability.disable("claude-3-5-sonnet-20241022", now);

        let decision = router
            .decide("claude-3-5-sonnet-20241022", None, &user("code"), now)
            .unwrap();
        assert!(decision
            .candidates
            .iter()
            .all(|c| c.model != "claude-3-5-sonnet-20241022"));
        assert_eq!(decision.candidates[0].model, "gpt-4");
    }

    #[test]
    fn difficulty_buckets_select_by_containment() {
        let (router, _) = router(config(serde_json::json!({
            "difficulty_models": {
                "0-2": ["claude-3-haiku-20240307"],
                "3-5": ["claude-3-5-sonnet-20241022"]
            },
            "force_difficulty_routing": true
        })));
        let easy = router
            .decide("gpt-4", None, &user("explain http caching"), Instant::now())
            .unwrap();
        assert_eq!(easy.candidates[0].model, "claude-3-haiku-20240307");
        assert!(easy.difficulty.unwrap() <= 2.0);

        let hard = router
            .decide(
                "gpt-4",
                None,
                &user("implement a distributed consensus algorithm"),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(hard.candidates[0].model, "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn classifier_absence_degrades_to_later_rules() {
        let config = config(serde_json::json!({
            "expert_models": {
                "coding": ["claude-3-5-sonnet-20241022"],
                "writing": ["claude-3-haiku-20240307"]
            },
            "expert_definitions": {"coding": "code", "writing": "prose"},
            "force_expert_routing": true
        }));
        let availability = Arc::new(AvailabilityRegistry::new(Duration::from_secs(300)));
        let router = ModelRouter::new(config, availability, None);
        let decision = router
            .decide("gpt-4", None, &user("hello"), Instant::now())
            .unwrap();
        assert_eq!(decision.candidates[0].backend, "openai");
        assert!(decision.expert.is_none());
    }

    #[test]
    fn uniform_experts_skip_classification() {
        let config = config(serde_json::json!({
            "expert_models": {
                "coding": ["claude-3-haiku-20240307"],
                "writing": ["claude-3-haiku-20240307"]
            },
            "expert_definitions": {"coding": "code", "writing": "prose"},
            "force_expert_routing": true
        }));
        let availability = Arc::new(AvailabilityRegistry::new(Duration::from_secs(300)));
        // No classifier: the uniform shortcut must still route.
        let router = ModelRouter::new(config, availability, None);
        let decision = router
            .decide("unknown-model", None, &user("hello"), Instant::now())
            .unwrap();
        assert_eq!(decision.expert.as_deref(), Some("coding"));
        assert_eq!(decision.candidates[0].model, "claude-3-haiku-20240307");
    }

    #[test]
    fn empty_rules_yield_no_route() {
        let (router, _) = router(config(serde_json::json!({})));
        let err = router
            .decide("mystery-model", None, &user("hi"), Instant::now())
            .unwrap_err();
        assert!(err.message.contains("mystery-model"));
    }
}
