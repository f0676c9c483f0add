//! Response cache.
//!
//! Bounded LRU with TTL, keyed on a SHA-256 fingerprint of the semantic
//! request fields. Streaming and unary requests share a key: the cache always
//! stores the unary JSON body, and hits are re-emitted as an event sequence
//! when the client asked for streaming.

use bytes::Bytes;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::anthropic::MessagesRequest;

/// Compute the cache fingerprint for a request.
///
/// Covers model (client-facing, post-override), messages, system,
/// max_tokens, temperature, top_p, top_k, stop_sequences and tools. Absent
/// fields serialize as explicit nulls; mapping keys are sorted, so two
/// requests equal in these fields hash identically regardless of key order.
/// `stream`, `metadata` and transport headers never participate.
pub fn fingerprint(request: &MessagesRequest) -> String {
    let material = json!({
        "model": &request.model,
        "messages": &request.messages,
        "system": &request.system,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "top_k": request.top_k,
        "stop_sequences": &request.stop_sequences,
        "tools": &request.tools,
    });
    let mut canonical = String::new();
    write_canonical(&material, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Deterministic serialization: objects emit keys in sorted order, no
/// whitespace, nulls written out.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, value)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_requests: u64,
}

#[derive(Debug)]
struct CachedEntry {
    body: Bytes,
    created_at: Instant,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CachedEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Thread-safe TTL + LRU response cache.
#[derive(Debug)]
pub struct ResponseCache {
    max_entries: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Fetch a live entry, touching its recency. Expired entries are removed
    /// and count as misses.
    pub fn get(&self, fingerprint: &str, now: Instant) -> Option<Bytes> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.tick += 1;

        match inner.entries.get_mut(fingerprint) {
            Some(entry) if now.duration_since(entry.created_at) <= self.ttl => {
                entry.last_access = inner.tick;
                inner.hits += 1;
                Some(entry.body.clone())
            }
            Some(_) => {
                inner.entries.remove(fingerprint);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert, evicting the least-recently-used entry when full.
    pub fn put(&self, fingerprint: &str, body: Bytes, now: Instant) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(fingerprint) && inner.entries.len() >= self.max_entries {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            {
                inner.entries.remove(&victim);
            }
        }

        inner.entries.insert(
            fingerprint.to_string(),
            CachedEntry {
                body,
                created_at: now,
                last_access: tick,
            },
        );
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
        count
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_entries,
            ttl_seconds: self.ttl.as_secs(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
            total_requests: total,
        }
    }
}
