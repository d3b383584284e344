// SPDX-License-Identifier: MIT OR Apache-2.0
//! Static, read-only DAG declarations per source, and the validator
//! registry that gates card output.
//!
//! Nothing in this crate is mutable at runtime: a [`RuleSet`] is built once
//! (via [`rules_for`]) and handed by reference to the Planner, Scheduler and
//! Executor, per the design note against module-level mutable state.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod sources;
mod validators;

pub use validators::{validator_for, ValidatorFn};

use std::collections::{BTreeMap, BTreeSet};

use analyzer_core::{Source, StreamSpec};

/// What kind of unit a card is, which determines how the Executor dispatches
/// it (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    /// `resource.*`: calls a `ResourceFetcher`, writes an artifact.
    Resource,
    /// `full_report`: merges artifacts of its dependencies; no adapter call.
    Aggregator,
    /// A user-visible business card: calls `LLMCaller`.
    Business,
}

/// A deterministic, upstream-free derivation of a card's payload from the
/// job's subject key and already-computed artifacts of its dependencies,
/// invoked when a soft deadline is exceeded at dispatch (§4.3, §4.4 step 2).
/// Takes `subject_key` so a fallback can always produce a non-placeholder
/// identifying field even when no upstream artifact is available yet —
/// fallback payloads must clear the same validator bar as any other output.
pub type FallbackFn = fn(subject_key: &str, artifacts: &BTreeMap<String, serde_json::Value>) -> serde_json::Value;

/// Static declaration of one card within a source's rule set.
#[derive(Clone)]
pub struct CardRule {
    /// Card name, unique within the source.
    pub name: &'static str,
    /// Dispatch kind.
    pub kind: CardKind,
    /// Whether this card is internal (execution-only, never rendered).
    pub internal: bool,
    /// Names of cards this one depends on.
    pub depends_on: BTreeSet<&'static str>,
    /// Concurrency-group tag for admission control.
    pub concurrency_group: &'static str,
    /// Soft deadline in milliseconds, measured from `job.created_at`.
    /// Convention: `None` on resource/aggregator cards, `Some` on
    /// enrichment (business) cards.
    pub deadline_ms: Option<u64>,
    /// Maximum dispatch attempts.
    pub max_attempts: u32,
    /// Streaming declaration, for text cards.
    pub stream_spec: Option<StreamSpec>,
    /// Whitelist of job-option keys that affect this card's cache
    /// fingerprint. Deliberately never includes `force_refresh` — including
    /// it would make every forced refresh permanently miss (§9 design
    /// note). Empty by default: these reference rule sets have no cards
    /// whose output varies by option besides `force_refresh` itself.
    pub fingerprint_option_keys: &'static [&'static str],
    /// Deterministic fallback, required on every card that carries a
    /// `deadline_ms`.
    pub fallback: Option<FallbackFn>,
}

/// Default retry budgets by card kind (§4.1: "resource=2, AI=2, base=1").
#[must_use]
pub fn default_max_attempts(kind: CardKind) -> u32 {
    match kind {
        CardKind::Resource => 2,
        CardKind::Business => 2,
        CardKind::Aggregator => 1,
    }
}

/// The reference default deadline for enrichment (business) cards: ~10s.
pub const DEFAULT_ENRICHMENT_DEADLINE_MS: u64 = 10_000;

/// A source's complete, static DAG declaration.
pub struct RuleSet {
    /// The source this rule set governs.
    pub source: Source,
    /// All cards declared for this source, keyed by name.
    pub cards: BTreeMap<&'static str, CardRule>,
    /// The visible cards requested when a job omits an explicit card list.
    pub default_visible_cards: &'static [&'static str],
}

impl RuleSet {
    /// Look up a card declaration by name.
    #[must_use]
    pub fn card(&self, name: &str) -> Option<&CardRule> {
        self.cards.get(name)
    }

    /// All visible (non-internal) business card names declared for this
    /// source, in a stable order.
    pub fn visible_cards(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.cards.values().filter(|c| !c.internal).map(|c| c.name)
    }

    /// The name of this source's aggregator card (`full_report`), if any
    /// card declares dependents needing it. All reference rule sets declare
    /// one.
    #[must_use]
    pub fn aggregator_name(&self) -> &'static str {
        "full_report"
    }
}

/// The static rule set for `source`. Declarations are built once (on first
/// use) and never mutated.
#[must_use]
pub fn rules_for(source: Source) -> &'static RuleSet {
    sources::rules_for(source)
}
