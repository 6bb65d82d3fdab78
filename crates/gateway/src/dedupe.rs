//! Idempotency cache for mutating methods.
//!
//! Keyed `"<method>:<idempotencyKey>"`, each entry stores the completed
//! `{ok, payload, error}` outcome so retries — including across
//! reconnects from any client — replay the first result verbatim without
//! re-invoking the collaborator port. TTL plus a hard cap bound the map;
//! a periodic sweep enforces both.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use clawdis_protocol::{DEDUPE_MAX_ENTRIES, DEDUPE_TTL_MS, ErrorShape, ResponseFrame};

/// The exact outcome triple a handler produced, replayed on duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedOutcome {
    pub ok: bool,
    pub payload: Option<serde_json::Value>,
    pub error: Option<ErrorShape>,
}

impl CachedOutcome {
    pub fn from_response(response: &ResponseFrame) -> Self {
        Self {
            ok: response.ok,
            payload: response.payload.clone(),
            error: response.error.clone(),
        }
    }

    /// Rebuild a response for a new request id from the cached outcome.
    pub fn into_response(self, id: impl Into<String>) -> ResponseFrame {
        ResponseFrame {
            id: id.into(),
            ok: self.ok,
            payload: self.payload,
            error: self.error,
        }
    }
}

struct DedupeEntry {
    ts: Instant,
    outcome: CachedOutcome,
}

pub struct DedupeCache {
    entries: HashMap<String, DedupeEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::with_limits(Duration::from_millis(DEDUPE_TTL_MS), DEDUPE_MAX_ENTRIES)
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// The flat cache key namespace: callers pick globally unique keys per
    /// logical intent.
    pub fn key(method: &str, idempotency_key: &str) -> String {
        format!("{method}:{idempotency_key}")
    }

    pub fn lookup(&mut self, key: &str, now: Instant) -> Option<CachedOutcome> {
        self.evict_expired(now);
        self.entries.get(key).map(|entry| entry.outcome.clone())
    }

    /// Insert-or-replace, then evict oldest-by-timestamp down to the cap.
    pub fn store(&mut self, key: &str, outcome: CachedOutcome, now: Instant) {
        self.entries
            .insert(key.to_string(), DedupeEntry { ts: now, outcome });
        self.evict_over_cap();
    }

    /// Periodic maintenance: TTL expiry plus cap enforcement.
    pub fn sweep(&mut self, now: Instant) {
        self.evict_expired(now);
        self.evict_over_cap();
    }

    fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.ts) < ttl);
    }

    fn evict_over_cap(&mut self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.ts)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                },
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
