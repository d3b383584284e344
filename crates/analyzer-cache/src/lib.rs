// SPDX-License-Identifier: MIT OR Apache-2.0
//! The AnalysisCache: a content-addressed cache over upstream fetches and
//! card outputs, with a fresh/stale TTL pair (§4.7).
//!
//! Entries are validated by the caller on every read — this cache only
//! tracks freshness windows and storage; the Executor is responsible for
//! running the card's validator against a hit and calling
//! [`AnalysisCache::invalidate`] on a stale-and-invalid read (decided in
//! the design notes: stale-and-invalid is a miss).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use analyzer_core::{CacheEntry, CacheNamespace, CacheReadDisposition};

/// Compute a deterministic hex fingerprint from an ordered list of
/// `(key, value)` parts. Callers must pass only the parts that are
/// load-bearing for the resulting payload — see the per-card
/// `fingerprint_option_keys` whitelist in `analyzer-rules`, and critically,
/// never `force_refresh` (§9 design note: including it would make every
/// forced refresh permanently miss).
#[must_use]
pub fn fingerprint(parts: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in parts {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Fingerprint for a card-output cache entry: source, card, subject_key,
/// plus whatever card-relevant option values the caller has already
/// filtered to the card's whitelist.
#[must_use]
pub fn card_output_fingerprint(
    source: &str,
    card: &str,
    subject_key: &str,
    relevant_options: &[(&str, &str)],
) -> String {
    let mut parts = vec![("source", source), ("card", card), ("subject_key", subject_key)];
    parts.extend_from_slice(relevant_options);
    fingerprint(&parts)
}

/// Fingerprint for an upstream-fetch cache entry: adapter identity plus its
/// request parameters.
#[must_use]
pub fn upstream_fetch_fingerprint(adapter_id: &str, params: &[(&str, &str)]) -> String {
    let mut parts = vec![("adapter", adapter_id)];
    parts.extend_from_slice(params);
    fingerprint(&parts)
}

/// A concurrent, process-wide, in-memory cache. Shared across jobs whose
/// fingerprints collide, per the ownership model in §3 ("CacheEntries are
/// process-wide, not job-owned").
pub struct AnalysisCache {
    store: Mutex<HashMap<(CacheNamespace, String), CacheEntry>>,
    fresh_ttl: Duration,
    stale_ttl: Duration,
}

impl AnalysisCache {
    /// Create an empty cache with the given fresh/stale TTL windows
    /// (applied to every `put` unless overridden per call via
    /// [`AnalysisCache::put_with_ttl`]).
    #[must_use]
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            fresh_ttl,
            stale_ttl,
        }
    }

    /// Look up `(namespace, fingerprint)` at time `now`. Returns `None` for
    /// a true miss (absent, or past `usable_until`); otherwise the entry and
    /// its disposition (`Fresh` or `Stale`).
    #[must_use]
    pub fn get(
        &self,
        namespace: CacheNamespace,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Option<(CacheEntry, CacheReadDisposition)> {
        let store = self.store.lock().expect("cache mutex poisoned");
        let entry = store.get(&(namespace, fingerprint.to_string()))?;
        match entry.disposition_at(now) {
            CacheReadDisposition::Miss => None,
            disposition => Some((entry.clone(), disposition)),
        }
    }

    /// Write an entry using this cache's default TTL windows.
    pub fn put(&self, namespace: CacheNamespace, fingerprint: String, payload: serde_json::Value, now: DateTime<Utc>) {
        self.put_with_ttl(namespace, fingerprint, payload, now, self.fresh_ttl, self.stale_ttl);
    }

    /// Write an entry with explicit fresh/stale TTLs (per-card-configurable,
    /// per §4.7).
    pub fn put_with_ttl(
        &self,
        namespace: CacheNamespace,
        fingerprint: String,
        payload: serde_json::Value,
        now: DateTime<Utc>,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) {
        let entry = CacheEntry {
            namespace,
            fingerprint: fingerprint.clone(),
            payload,
            created_at: now,
            good_until: now + fresh_ttl,
            usable_until: now + fresh_ttl + stale_ttl,
        };
        let mut store = self.store.lock().expect("cache mutex poisoned");
        store.insert((namespace, fingerprint), entry);
    }

    /// Invalidate an entry outright — used when a cached payload fails
    /// validation so it never serves a future job again.
    pub fn invalidate(&self, namespace: CacheNamespace, fingerprint: &str) {
        let mut store = self.store.lock().expect("cache mutex poisoned");
        store.remove(&(namespace, fingerprint.to_string()));
    }

    /// Number of entries currently stored, for diagnostics/tests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.lock().expect("cache mutex poisoned").len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
