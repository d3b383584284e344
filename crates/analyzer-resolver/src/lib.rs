// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Freeform Resolver (§4.5): runs synchronously before job creation
//! when `options.freeform` is set or the input is heuristically ambiguous.
//!
//! It queries a domain-specific search adapter for up to `K` candidates. A
//! single strong candidate collapses to a canonical `subject_key` (as if
//! the caller had supplied it directly); anything else surfaces
//! `needs_confirmation` with the candidate list and creates no job.
//! Candidate lists are cached under [`CacheNamespace::ResolverCandidates`]
//! with their own TTL, independent of the upstream-fetch and card-output
//! namespaces the executor uses.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use analyzer_cache::{fingerprint, AnalysisCache};
use analyzer_core::{CacheNamespace, CacheReadDisposition, Source};
use analyzer_error::{AnalyzerError, ErrorCode};

/// Maximum number of candidates the resolver ever asks an adapter for, and
/// the maximum it will ever surface in a `needs_confirmation` response.
pub const MAX_CANDIDATES: usize = 5;

/// Minimum score (on the adapter's own 0.0-1.0 scale) for a candidate to be
/// considered strong enough to auto-resolve when it is the only one.
pub const STRONG_CANDIDATE_THRESHOLD: f64 = 0.8;

/// Default fresh TTL for cached candidate lists. Short relative to card
/// output TTLs: identity resolution drifts as upstream search indexes
/// change, and a stale candidate list sends a user down the wrong job.
pub const CANDIDATE_FRESH_TTL: Duration = Duration::minutes(15);

/// Default stale TTL layered on top of [`CANDIDATE_FRESH_TTL`].
pub const CANDIDATE_STALE_TTL: Duration = Duration::minutes(45);

/// One candidate identity surfaced by a search adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Candidate {
    /// Human-readable label shown to the caller choosing between candidates.
    pub label: String,
    /// The canonical input this candidate would resolve to if chosen.
    pub subject_key: String,
    /// Adapter-assigned confidence in `[0.0, 1.0]`.
    pub score: f64,
    /// Free-form adapter metadata (e.g. avatar URL, location), passed through
    /// uninterpreted.
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Outcome of a resolve call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// A single strong candidate collapsed the input to a canonical key; the
    /// caller proceeds to create a job with this `subject_key`.
    Resolved {
        /// The canonical subject key to use in place of the raw input.
        subject_key: String,
    },
    /// Zero, or more than one, viable candidate: no job is created, and the
    /// caller must re-submit with an explicit `subject_key` from the list.
    NeedsConfirmation {
        /// Up to [`MAX_CANDIDATES`] candidates, highest score first.
        candidates: Vec<Candidate>,
    },
}

/// A domain-specific search backend. Implementations are out of scope for
/// this crate (§7 Non-goals) — analogous to `ResourceFetcher`/`LLMCaller`,
/// this is an interface the scheduler's host process supplies.
#[async_trait]
pub trait SearchAdapter: Send + Sync {
    /// Stable identity used in the cache fingerprint (e.g. `"github_search"`).
    fn adapter_id(&self) -> &str;

    /// Look up up to `limit` candidates for `query` within `source`.
    async fn search(
        &self,
        source: Source,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, AnalyzerError>;
}

/// Heuristic for "this input needs disambiguation even though the caller
/// did not set `options.freeform`": free text containing whitespace is
/// never a handle, URL, or opaque id, all of which the sources accept
/// directly.
#[must_use]
pub fn is_heuristically_ambiguous(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.is_empty() || trimmed.contains(char::is_whitespace)
}

/// Resolve `input` for `source`, consulting `adapter` only when the input is
/// freeform or ambiguous. Candidate lists are served from `cache` when a
/// fresh or stale entry exists; a stale-and-invalid read is not possible
/// here since cached candidates carry no independent validator (unlike card
/// outputs) — stale entries are served as-is and simply expire.
pub async fn resolve(
    source: Source,
    input: &str,
    freeform: bool,
    adapter: &dyn SearchAdapter,
    cache: &AnalysisCache,
    now: DateTime<Utc>,
) -> Result<ResolveOutcome, AnalyzerError> {
    if !freeform && !is_heuristically_ambiguous(input) {
        return Ok(ResolveOutcome::Resolved { subject_key: input.trim().to_string() });
    }

    let fp = fingerprint(&[("adapter", adapter.adapter_id()), ("source", source.as_str()), ("query", input)]);

    let candidates = match cache.get(CacheNamespace::ResolverCandidates, &fp, now) {
        Some((entry, _disposition @ (CacheReadDisposition::Fresh | CacheReadDisposition::Stale))) => {
            serde_json::from_value::<Vec<Candidate>>(entry.payload).map_err(|e| {
                AnalyzerError::new(ErrorCode::CacheInvalidEntry, "cached candidate list was malformed")
                    .with_source(e)
            })?
        }
        _ => {
            let fetched = adapter.search(source, input, MAX_CANDIDATES).await?;
            let payload = serde_json::to_value(&fetched).unwrap_or(serde_json::Value::Null);
            cache.put_with_ttl(
                CacheNamespace::ResolverCandidates,
                fp,
                payload,
                now,
                CANDIDATE_FRESH_TTL,
                CANDIDATE_STALE_TTL,
            );
            fetched
        }
    };

    Ok(classify(candidates))
}

fn classify(mut candidates: Vec<Candidate>) -> ResolveOutcome {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(MAX_CANDIDATES);

    if let [only] = candidates.as_slice() {
        if only.score >= STRONG_CANDIDATE_THRESHOLD {
            return ResolveOutcome::Resolved { subject_key: only.subject_key.clone() };
        }
    }
    ResolveOutcome::NeedsConfirmation { candidates }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        calls: AtomicUsize,
        results: Vec<Candidate>,
    }

    #[async_trait]
    impl SearchAdapter for FakeAdapter {
        fn adapter_id(&self) -> &str {
            "fake_search"
        }

        async fn search(&self, _source: Source, _query: &str, _limit: usize) -> Result<Vec<Candidate>, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
    }

    fn cache() -> AnalysisCache {
        AnalysisCache::new(CANDIDATE_FRESH_TTL, CANDIDATE_STALE_TTL)
    }

    #[tokio::test]
    async fn direct_handle_bypasses_the_adapter_entirely() {
        let adapter = FakeAdapter { calls: AtomicUsize::new(0), results: vec![] };
        let outcome = resolve(Source::Github, "torvalds", false, &adapter, &cache(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ResolveOutcome::Resolved { subject_key: "torvalds".into() });
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_strong_candidate_resolves_to_its_subject_key() {
        let adapter = FakeAdapter {
            calls: AtomicUsize::new(0),
            results: vec![Candidate {
                label: "Linus Torvalds".into(),
                subject_key: "torvalds".into(),
                score: 0.95,
                meta: serde_json::Value::Null,
            }],
        };
        let outcome = resolve(Source::Github, "linus torvalds", false, &adapter, &cache(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ResolveOutcome::Resolved { subject_key: "torvalds".into() });
    }

    #[tokio::test]
    async fn weak_single_candidate_still_needs_confirmation() {
        let adapter = FakeAdapter {
            calls: AtomicUsize::new(0),
            results: vec![Candidate {
                label: "Maybe Torvalds".into(),
                subject_key: "maybe-torvalds".into(),
                score: 0.4,
                meta: serde_json::Value::Null,
            }],
        };
        let outcome = resolve(Source::Github, "linus torvalds", false, &adapter, &cache(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::NeedsConfirmation { .. }));
    }

    #[tokio::test]
    async fn multiple_candidates_always_need_confirmation_even_if_both_strong() {
        let adapter = FakeAdapter {
            calls: AtomicUsize::new(0),
            results: vec![
                Candidate { label: "A".into(), subject_key: "a".into(), score: 0.9, meta: serde_json::Value::Null },
                Candidate { label: "B".into(), subject_key: "b".into(), score: 0.85, meta: serde_json::Value::Null },
            ],
        };
        let outcome = resolve(Source::Github, "ambiguous name", false, &adapter, &cache(), Utc::now())
            .await
            .unwrap();
        match outcome {
            ResolveOutcome::NeedsConfirmation { candidates } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[0].subject_key, "a");
            }
            _ => panic!("expected needs_confirmation"),
        }
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache_without_calling_the_adapter_again() {
        let adapter = FakeAdapter {
            calls: AtomicUsize::new(0),
            results: vec![Candidate {
                label: "A".into(),
                subject_key: "a".into(),
                score: 0.5,
                meta: serde_json::Value::Null,
            }],
        };
        let cache = cache();
        let now = Utc::now();
        resolve(Source::Github, "ambiguous name", true, &adapter, &cache, now).await.unwrap();
        resolve(Source::Github, "ambiguous name", true, &adapter, &cache, now).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_freeform_still_consults_the_adapter_for_a_handle_shaped_input() {
        let adapter = FakeAdapter {
            calls: AtomicUsize::new(0),
            results: vec![Candidate {
                label: "Torvalds".into(),
                subject_key: "torvalds".into(),
                score: 0.99,
                meta: serde_json::Value::Null,
            }],
        };
        let outcome = resolve(Source::Github, "torvalds", true, &adapter, &cache(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ResolveOutcome::Resolved { subject_key: "torvalds".into() });
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }
}
