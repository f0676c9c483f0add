//! Query classification capability.
//!
//! The router treats classification as an opaque capability: given the
//! flattened conversation, name an expert or rate difficulty. The default
//! implementation is a keyword heuristic; a model-backed classifier plugs in
//! behind the same trait. When no classifier is present, expert and
//! difficulty routing degrade to the fallback rules instead of erroring.

use std::collections::BTreeMap;

use crate::chat_template::{last_user_query, TemplateMessage};

pub trait Classifier: Send + Sync {
    /// Pick the expert whose description best covers the query.
    fn classify_expert(
        &self,
        messages: &[TemplateMessage],
        experts: &BTreeMap<String, String>,
    ) -> Option<String>;

    /// Rate query difficulty on the 0–5 scale.
    fn rate_difficulty(&self, messages: &[TemplateMessage]) -> Option<f32>;
}

/// Keyword-overlap classifier.
///
/// Experts are scored by how many words of their description appear in the
/// query; difficulty comes from a coarse pattern ladder (explanations rate
/// low, systems-level implementation work rates high).
#[derive(Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

impl Classifier for KeywordClassifier {
    fn classify_expert(
        &self,
        messages: &[TemplateMessage],
        experts: &BTreeMap<String, String>,
    ) -> Option<String> {
        if experts.is_empty() {
            return None;
        }
        let query = last_user_query(messages)?;
        let query_words = tokenize(query);
        if query_words.is_empty() {
            return None;
        }

        let mut best: Option<(&String, usize)> = None;
        for (name, description) in experts {
            let mut score = 0usize;
            for word in tokenize(description) {
                if query_words.contains(&word) {
                    score += 1;
                }
            }
            // The expert's own name counts double.
            if query_words.contains(&name.to_lowercase()) {
                score += 2;
            }
            match best {
                Some((_, top)) if score <= top => {}
                _ if score > 0 => best = Some((name, score)),
                _ => {}
            }
        }

        // No overlap at all: settle on the first expert so routing still
        // lands in a configured bucket.
        best.map(|(name, _)| name.clone())
            .or_else(|| experts.keys().next().cloned())
    }

    fn rate_difficulty(&self, messages: &[TemplateMessage]) -> Option<f32> {
        let query = last_user_query(messages)?.to_lowercase();

        const TRIVIAL: [&str; 3] = ["proofread", "check for typos", "review this comment"];
        if TRIVIAL.iter().any(|p| query.contains(p)) {
            return Some(0.0);
        }

        const EXPLAIN: [&str; 4] = ["explain", "what is", "describe", "tell me about"];
        if EXPLAIN.iter().any(|p| query.contains(p)) {
            if query.contains("in simple terms") || query.contains("non-technical") {
                return Some(1.0);
            }
            return Some(2.0);
        }

        const CODE: [&str; 9] = [
            "write", "implement", "create", "build", "develop", "function", "class", "algorithm",
            "program",
        ];
        if CODE.iter().any(|p| query.contains(p)) {
            const ADVANCED: [&str; 6] = [
                "compiler",
                "distributed",
                "consensus",
                "garbage collector",
                "memory allocator",
                "from scratch",
            ];
            if ADVANCED.iter().any(|p| query.contains(p)) {
                return Some(5.0);
            }
            const APPLIED: [&str; 7] =
                ["api", "auth", "jwt", "oauth", "database", "middleware", "docker"];
            if APPLIED.iter().any(|p| query.contains(p)) {
                return Some(4.0);
            }
            return Some(3.0);
        }

        Some(2.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Vec<TemplateMessage> {
        vec![TemplateMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }]
    }

    fn experts() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            "coding".to_string(),
            "programming, writing code, debugging, software".to_string(),
        );
        map.insert(
            "writing".to_string(),
            "prose, essays, creative writing, editing".to_string(),
        );
        map
    }

    #[test]
    fn picks_the_overlapping_expert() {
        let classifier = KeywordClassifier::new();
        let expert = classifier.classify_expert(
            &user("help me with debugging this software issue"),
            &experts(),
        );
        assert_eq!(expert.as_deref(), Some("coding"));
    }

    #[test]
    fn falls_back_to_first_expert_without_overlap() {
        let classifier = KeywordClassifier::new();
        let expert = classifier.classify_expert(&user("zzz qqq"), &experts());
        assert_eq!(expert.as_deref(), Some("coding"));
    }

    #[test]
    fn no_experts_means_no_classification() {
        let classifier = KeywordClassifier::new();
        assert!(classifier
            .classify_expert(&user("anything"), &BTreeMap::new())
            .is_none());
    }

    #[test]
    fn difficulty_ladder_orders_queries() {
        let classifier = KeywordClassifier::new();
        let explain = classifier.rate_difficulty(&user("explain http caching")).unwrap();
        let code = classifier
            .rate_difficulty(&user("implement a binary search function"))
            .unwrap();
        let advanced = classifier
            .rate_difficulty(&user("implement a garbage collector from scratch"))
            .unwrap();
        assert!(explain < code);
        assert!(code < advanced);
        assert_eq!(advanced, 5.0);
    }

    #[test]
    fn no_user_message_rates_nothing() {
        let classifier = KeywordClassifier::new();
        assert!(classifier.rate_difficulty(&[]).is_none());
    }
}
