// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data model for the analysis pipeline core.
//!
//! A [`Job`] owns [`Card`]s; cards own [`Artifact`]s and a sub-range of
//! [`Event`]s. [`CacheEntry`] is process-wide and not owned by any job. See
//! the module-level docs on each type for the invariants that the scheduler
//! and event log rely on.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod event;
mod job;

pub use event::{CacheDisposition, CardOutput, Event, EventPayload, StreamSpec};
pub use job::{
    Card, CardBuilder, CardStatus, Job, JobBuilder, JobOptions, JobStatus, JobTerminalStatus,
    Source,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An opaque blob produced by an internal resource card and consumed by its
/// dependents. Retained until the job and its dependents are terminal.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Artifact {
    /// Owning job.
    pub job_id: uuid::Uuid,
    /// Producing card name.
    pub card_name: String,
    /// Raw bytes. Callers agree on interpretation out of band (typically
    /// JSON produced by a `ResourceFetcher`).
    #[schemars(with = "String")]
    pub blob: Vec<u8>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Build an artifact from a JSON-serializable value, timestamped now.
    pub fn from_json(
        job_id: uuid::Uuid,
        card_name: impl Into<String>,
        value: &impl Serialize,
        now: DateTime<Utc>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            job_id,
            card_name: card_name.into(),
            blob: serde_json::to_vec(value)?,
            created_at: now,
        })
    }

    /// Deserialize the blob as JSON.
    pub fn as_json<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.blob)
    }
}

/// The two cache namespaces this pipeline addresses by fingerprint: upstream fetches
/// (fingerprint includes adapter identity and request params) and card
/// outputs (fingerprint includes source, card, subject_key, relevant
/// options). Kept as distinct namespaces so an upstream-fetch fingerprint
/// collision can never shadow a card-output entry or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CacheNamespace {
    /// Raw upstream fetch results (pre-validation, pre-card-shaping).
    UpstreamFetch,
    /// Finished card payloads.
    CardOutput,
    /// Freeform-resolver candidate lists (their own TTL, per §4.5).
    ResolverCandidates,
}

/// A single cache entry. Stale-while-revalidate is expressed as two
/// timestamps: `good_until` (fresh) and `usable_until` (stale); outside
/// `usable_until` the entry is absent for all read purposes.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CacheEntry {
    /// Namespace this entry lives in.
    pub namespace: CacheNamespace,
    /// Deterministic hash of the resolved request; the cache key alongside
    /// `namespace`.
    pub fingerprint: String,
    /// The cached payload.
    pub payload: serde_json::Value,
    /// When this entry was written.
    pub created_at: DateTime<Utc>,
    /// End of the fresh window: reads before this instant are a direct hit.
    pub good_until: DateTime<Utc>,
    /// End of the stale window: reads before this instant (but after
    /// `good_until`) are a stale hit; reads after this instant are a miss.
    pub usable_until: DateTime<Utc>,
}

impl CacheEntry {
    /// Disposition of a read at time `now`: fresh hit, stale hit, or miss.
    #[must_use]
    pub fn disposition_at(&self, now: DateTime<Utc>) -> CacheReadDisposition {
        if now < self.good_until {
            CacheReadDisposition::Fresh
        } else if now < self.usable_until {
            CacheReadDisposition::Stale
        } else {
            CacheReadDisposition::Miss
        }
    }
}

/// Outcome of evaluating a [`CacheEntry`] against the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheReadDisposition {
    /// Within the fresh window: return directly.
    Fresh,
    /// Within the stale window: return but (for refresh-eligible cards)
    /// trigger a background refresh.
    Stale,
    /// Outside both windows, or invalidated by a failed validator pass:
    /// treated identically to "no entry".
    Miss,
}
