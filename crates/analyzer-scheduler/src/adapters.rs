// SPDX-License-Identifier: MIT OR Apache-2.0
//! `ResourceFetcher` and `LLMCaller`: the two adapter interfaces the
//! Executor dispatches through (§4.4). Implementations are out of scope
//! for this crate (§7 Non-goals) — a host process supplies them; this
//! crate only defines the contract and the progress/delta events threaded
//! back through it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use analyzer_core::Source;
use analyzer_error::AnalyzerError;

/// One progress/list-page notification from a [`ResourceFetcher`] call,
/// translated into `card.progress`/`card.append` events as they arrive.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// A substep made progress worth surfacing to the client.
    Progress {
        /// Machine-readable step identifier.
        step: String,
        /// Human-readable message.
        message: String,
        /// Optional structured detail.
        data: Option<serde_json::Value>,
    },
    /// A page of list items was fetched.
    Append {
        /// Output path/field the items append to.
        path: String,
        /// The newly observed items.
        items: Vec<serde_json::Value>,
        /// Field used to deduplicate across appends.
        dedup_key: String,
        /// Opaque pagination cursor, if resumable.
        cursor: Option<String>,
        /// Whether more pages are expected.
        partial: Option<bool>,
    },
}

/// Fetches raw upstream data for a `resource.*` card. One implementation
/// per adapter family (`github_api`, `crawlbase`, `apify`, ...); it is the
/// card rule's `concurrency_group`, not this trait, that tells the
/// scheduler which fetcher instance backs a given card.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Stable identity folded into the upstream-fetch cache fingerprint
    /// and into diagnostics.
    fn adapter_id(&self) -> &str;

    /// Fetch `card` for `subject_key` under `source`, reporting progress
    /// and list pages on `events` as they become available. The returned
    /// value is the final merged payload stored as the card's
    /// [`analyzer_core::Artifact`].
    async fn fetch(
        &self,
        source: Source,
        subject_key: &str,
        card: &str,
        events: mpsc::Sender<ResourceEvent>,
    ) -> Result<serde_json::Value, AnalyzerError>;
}

/// One chunk of raw streamed text from an [`LLMCaller`] call, pre-batching
/// — the [`crate::delta::DeltaBatcher`] coalesces these before they become
/// `card.delta` events.
#[derive(Debug, Clone)]
pub struct LlmDelta {
    /// Named section within the stream's field (per `StreamSpec::sections`).
    pub section: String,
    /// The raw text chunk.
    pub text: String,
}

/// Calls a language model to produce a business card's payload.
///
/// Fully generic over task and model, per the decided Open Question on LLM
/// task routing: no card hardcodes a provider or model, and routing from
/// `task`/`model_hint` to an actual backend is entirely the adapter's
/// concern.
#[async_trait]
pub trait LLMCaller: Send + Sync {
    /// Stable identity for diagnostics. Not folded into any cache key: LLM
    /// outputs are cached under the card-output namespace, keyed by
    /// source/card/subject_key, not by adapter.
    fn adapter_id(&self) -> &str;

    /// Run `task` (the card name) over `input` (the already-gathered
    /// dependency outputs), with an optional routing hint. Streamed text,
    /// if any, is reported on `deltas` as it arrives; the returned value is
    /// the final structured payload.
    async fn call(
        &self,
        task: &str,
        model_hint: Option<&str>,
        input: &serde_json::Value,
        deltas: mpsc::Sender<LlmDelta>,
    ) -> Result<serde_json::Value, AnalyzerError>;
}
