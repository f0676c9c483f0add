//! Model availability tracking.
//!
//! A process-wide map from concrete model id to the instant its cool-down
//! ends. Only rate-limit and credit failures disable a model; a fresh failure
//! always restarts the cool-down (last writer wins).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct AvailabilityRegistry {
    disable_duration: Duration,
    disabled: Mutex<HashMap<String, Instant>>,
}

impl AvailabilityRegistry {
    pub fn new(disable_duration: Duration) -> Self {
        Self {
            disable_duration,
            disabled: Mutex::new(HashMap::new()),
        }
    }

    pub fn disable_duration(&self) -> Duration {
        self.disable_duration
    }

    /// True when the model has no active cool-down. Expired entries are
    /// removed on the way out.
    pub fn is_available(&self, model: &str, now: Instant) -> bool {
        let mut disabled = self.disabled.lock().unwrap();
        match disabled.get(model) {
            Some(until) if now < *until => false,
            Some(_) => {
                disabled.remove(model);
                tracing::info!(model, "model re-enabled after cool-down");
                true
            }
            None => true,
        }
    }

    /// Disable the model until `now + disable_duration`.
    pub fn disable(&self, model: &str, now: Instant) {
        let until = now + self.disable_duration;
        self.disabled
            .lock()
            .unwrap()
            .insert(model.to_string(), until);
        tracing::warn!(
            model,
            cooldown_seconds = self.disable_duration.as_secs(),
            "model temporarily disabled"
        );
    }

    /// A successful call ends any active cool-down early.
    pub fn mark_success(&self, model: &str) {
        if self.disabled.lock().unwrap().remove(model).is_some() {
            tracing::info!(model, "model re-enabled after successful request");
        }
    }

    /// Currently disabled models with their remaining cool-down.
    pub fn snapshot(&self, now: Instant) -> Vec<(String, Duration)> {
        let mut disabled = self.disabled.lock().unwrap();
        disabled.retain(|_, until| now < *until);
        let mut entries: Vec<(String, Duration)> = disabled
            .iter()
            .map(|(model, until)| (model.clone(), *until - now))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn clear(&self) -> usize {
        let mut disabled = self.disabled.lock().unwrap();
        let count = disabled.len();
        disabled.clear();
        count
    }
}
