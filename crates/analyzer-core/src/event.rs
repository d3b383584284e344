// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event log payloads: `(job_id, seq, event_type, payload)`.
//!
//! `EventPayload` is a discriminated union keyed by `event_type` — per the
//! design note against `any`-typed payloads, every variant is a concrete,
//! named struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use analyzer_error::AnalyzerErrorDto;

use crate::job::JobTerminalStatus;

/// Per-card declaration of how streaming deltas should be rendered by a
/// client (`{field, format, sections[]}`).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct StreamSpec {
    /// Output field the deltas accumulate into.
    pub field: String,
    /// Rendering format hint (e.g. `"markdown"`, `"plain"`).
    pub format: String,
    /// Named sections a client may render separately, in order.
    pub sections: Vec<String>,
}

/// A finished (or cache-prefilled) card's output: structured data plus the
/// accumulated stream, if the card is a streaming text card.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CardOutput {
    /// Structured payload.
    pub data: serde_json::Value,
    /// Accumulated streamed text, if any, keyed by `stream_spec.field`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

/// Cache disposition attached to `card.prefill` events.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CacheDisposition {
    /// Whether this was a cache hit at all.
    pub hit: bool,
    /// Whether the hit was in the stale window.
    pub stale: bool,
    /// When the cached entry was originally written.
    pub as_of: DateTime<Utc>,
    /// The fingerprint that was looked up, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// The normative event payload shapes for every `event_type` this pipeline
/// emits. Extra fields beyond these are permitted by consumers but never
/// required.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    /// First event of every job; strictly precedes any `card.*` event.
    #[serde(rename = "job.started")]
    JobStarted,
    /// Last event of a job that reached `completed` or `partial`.
    #[serde(rename = "job.completed")]
    JobCompleted {
        /// Rollup status: `completed` or `partial`.
        status: JobTerminalStatus,
    },
    /// Last event of a job that reached `failed`.
    #[serde(rename = "job.failed")]
    JobFailed {
        /// Always `JobTerminalStatus::Failed`.
        status: JobTerminalStatus,
    },
    /// A card has been claimed by a worker and begun executing. Precedes
    /// every other event for that card.
    #[serde(rename = "card.started")]
    CardStarted {
        /// Card name.
        card: String,
        /// Always the literal string `"running"` on the wire.
        status: String,
        /// Present and `true` for internal (non-rendered) cards.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        internal: Option<bool>,
        /// Streaming declaration, for cards with `stream_spec`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream: Option<StreamSpec>,
    },
    /// A long-running substep made progress.
    #[serde(rename = "card.progress")]
    CardProgress {
        /// Card name.
        card: String,
        /// Machine-readable step identifier.
        step: String,
        /// Human-readable progress message.
        message: String,
        /// Optional structured progress detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Emitted immediately on a cache hit, in lieu of running the card.
    #[serde(rename = "card.prefill")]
    CardPrefill {
        /// Card name.
        card: String,
        /// The (validated) cached payload.
        payload: CardOutput,
        /// Cache hit metadata.
        cache: CacheDisposition,
    },
    /// A resource fetcher yielded a page of list items. Consumers merge by
    /// `dedup_key` rather than assuming appends never repeat an item.
    #[serde(rename = "card.append")]
    CardAppend {
        /// Card name.
        card: String,
        /// Output path/field the items append to.
        path: String,
        /// The newly observed items.
        items: Vec<serde_json::Value>,
        /// Field name within each item used to deduplicate across appends.
        dedup_key: String,
        /// Opaque pagination cursor, if the fetcher is resumable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        /// `true` while more pages are expected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<bool>,
    },
    /// A batched chunk of streamed LLM output text.
    #[serde(rename = "card.delta")]
    CardDelta {
        /// Card name.
        card: String,
        /// Output field the delta appends to (matches `stream_spec.field`).
        field: String,
        /// Named section within the field, if sectioned.
        section: String,
        /// Rendering format hint, echoing `stream_spec.format`.
        format: String,
        /// The text chunk itself (already batched by size/time, never
        /// per-token).
        delta: String,
    },
    /// Terminal success event for a card.
    #[serde(rename = "card.completed")]
    CardCompleted {
        /// Card name.
        card: String,
        /// Final payload.
        payload: CardOutput,
        /// Present and `true` for internal cards.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        internal: Option<bool>,
    },
    /// Terminal failure event for a card. Exactly one per failed card.
    #[serde(rename = "card.failed")]
    CardFailed {
        /// Card name.
        card: String,
        /// Present and `true` for internal cards.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        internal: Option<bool>,
        /// Classification of the failure.
        error: AnalyzerErrorDto,
    },
    /// SSE keepalive; not persisted as a durable seq-bearing log entry by
    /// convention (transport-layer heartbeat), but modelled here so the
    /// tagged union stays closed over everything the wire may carry.
    #[serde(rename = "ping")]
    Ping,
}

impl EventPayload {
    /// The `event_type` discriminant string, matching the `#[serde(rename)]`
    /// on each variant.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::JobStarted => "job.started",
            EventPayload::JobCompleted { .. } => "job.completed",
            EventPayload::JobFailed { .. } => "job.failed",
            EventPayload::CardStarted { .. } => "card.started",
            EventPayload::CardProgress { .. } => "card.progress",
            EventPayload::CardPrefill { .. } => "card.prefill",
            EventPayload::CardAppend { .. } => "card.append",
            EventPayload::CardDelta { .. } => "card.delta",
            EventPayload::CardCompleted { .. } => "card.completed",
            EventPayload::CardFailed { .. } => "card.failed",
            EventPayload::Ping => "ping",
        }
    }

    /// The card this event concerns, if any (job-level events have none).
    #[must_use]
    pub fn card_name(&self) -> Option<&str> {
        match self {
            EventPayload::CardStarted { card, .. }
            | EventPayload::CardProgress { card, .. }
            | EventPayload::CardPrefill { card, .. }
            | EventPayload::CardAppend { card, .. }
            | EventPayload::CardDelta { card, .. }
            | EventPayload::CardCompleted { card, .. }
            | EventPayload::CardFailed { card, .. } => Some(card.as_str()),
            EventPayload::JobStarted | EventPayload::JobCompleted { .. } | EventPayload::JobFailed { .. } | EventPayload::Ping => None,
        }
    }

    /// Whether this event terminates its card's bracket
    /// (`card.completed`/`card.failed`).
    #[must_use]
    pub fn is_card_terminal(&self) -> bool {
        matches!(self, EventPayload::CardCompleted { .. } | EventPayload::CardFailed { .. })
    }

    /// Whether this event terminates the job's bracket.
    #[must_use]
    pub fn is_job_terminal(&self) -> bool {
        matches!(self, EventPayload::JobCompleted { .. } | EventPayload::JobFailed { .. })
    }
}

/// A single, immutable, append-only event record.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Event {
    /// Owning job.
    pub job_id: Uuid,
    /// Monotonically increasing per-job sequence number, assigned at append
    /// time. Dense: no gaps are permitted between consecutive seqs of the
    /// same job.
    pub seq: u64,
    /// Wall-clock time of append.
    pub created_at: DateTime<Utc>,
    /// The event's discriminated payload.
    pub payload: EventPayload,
}
