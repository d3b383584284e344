// SPDX-License-Identifier: MIT OR Apache-2.0
//! [`Job`] and [`Card`]: the two scheduling-visible entities.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{CardOutput, StreamSpec};

/// The enumerated upstream sources a job may analyze.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Google Scholar profile.
    Scholar,
    /// GitHub user.
    Github,
    /// LinkedIn profile.
    Linkedin,
    /// Twitter/X account.
    Twitter,
    /// OpenReview profile.
    Openreview,
    /// Hugging Face user.
    Huggingface,
    /// YouTube channel.
    Youtube,
}

impl Source {
    /// All recognized sources, in declaration order.
    pub const ALL: [Source; 7] = [
        Source::Scholar,
        Source::Github,
        Source::Linkedin,
        Source::Twitter,
        Source::Openreview,
        Source::Huggingface,
        Source::Youtube,
    ];

    /// The wire/rules-key string for this source (its serde snake_case form).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Scholar => "scholar",
            Source::Github => "github",
            Source::Linkedin => "linkedin",
            Source::Twitter => "twitter",
            Source::Openreview => "openreview",
            Source::Huggingface => "huggingface",
            Source::Youtube => "youtube",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-creation options recognized by the pipeline (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct JobOptions {
    /// Routes ambiguous input through the Freeform Resolver's
    /// candidate-list flow instead of failing as malformed input.
    #[serde(default)]
    pub freeform: bool,
    /// Bypasses cache reads for every unit in this job (does not affect the
    /// cache fingerprint itself — see the cache fingerprinting design note).
    #[serde(default)]
    pub force_refresh: bool,
    /// Skips canonicalisation even when the resolver would otherwise ask
    /// for confirmation; the single best candidate (if any) is used as-is.
    #[serde(default)]
    pub allow_ambiguous: bool,
}

/// Job lifecycle status. `completed | partial | failed` are terminal: once
/// reached, the job's status never changes again (and `last_seq` stops
/// advancing once the corresponding terminal event is appended).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Planned but not yet dispatched.
    Queued,
    /// At least one card is non-terminal.
    Running,
    /// All visible cards completed.
    Completed,
    /// Some visible cards failed or were skipped, but at least one completed.
    Partial,
    /// No visible card completed, or an internal invariant was violated.
    Failed,
}

impl JobStatus {
    /// Whether this status is terminal (never changes again).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Partial | JobStatus::Failed)
    }
}

/// The subset of [`JobStatus`] usable in a `job.completed` event payload
/// (`job.failed` always carries `Failed` and is a separate event type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobTerminalStatus {
    /// All visible cards completed.
    Completed,
    /// Some visible cards failed or were skipped.
    Partial,
    /// The job's terminal event was `job.failed`.
    Failed,
}

/// One end-to-end analysis instance, bound to a single `subject_key`.
///
/// Invariant: `last_seq` never decreases. A job whose `status` is
/// `completed | partial | failed` is terminal; no field on it changes again
/// once the corresponding terminal event has been durably appended.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,
    /// Upstream source being analyzed.
    pub source: Source,
    /// Canonicalised input: a stable opaque string derived from the
    /// client's input (URL, ID, or handle).
    pub subject_key: String,
    /// Job-creation options.
    pub options: JobOptions,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Creation timestamp; deadlines are measured from this instant
    /// (§4.3, decided in the design notes: relative to creation, not
    /// per-unit dispatch).
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent status or `last_seq` change.
    pub updated_at: DateTime<Utc>,
    /// Highest event seq appended for this job so far.
    pub last_seq: u64,
    /// Optional client-supplied idempotency key; two creates with the same
    /// key and matching request body return the same `job_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Job {
    /// Record that `seq` has been appended to this job's event log,
    /// advancing `last_seq` and `updated_at`. No-op (besides the
    /// `updated_at` bump) if `seq` does not exceed the current value —
    /// callers should never call this out of order, but the monotonic
    /// invariant is enforced here defensively.
    pub fn observe_seq(&mut self, seq: u64, now: DateTime<Utc>) {
        if seq > self.last_seq {
            self.last_seq = seq;
        }
        self.updated_at = now;
    }
}

/// Builder for [`Job`]. Mirrors the workspace's consuming-`self`,
/// `#[must_use]`-setter builder convention.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    id: Uuid,
    source: Source,
    subject_key: String,
    options: JobOptions,
    idempotency_key: Option<String>,
}

impl JobBuilder {
    /// Start building a job for `source` with the given canonical subject key.
    #[must_use]
    pub fn new(source: Source, subject_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            subject_key: subject_key.into(),
            options: JobOptions::default(),
            idempotency_key: None,
        }
    }

    /// Override the generated job id (used by idempotent-replay).
    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Set job-creation options.
    #[must_use]
    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Finish building, stamping `created_at`/`updated_at` to `now`.
    #[must_use]
    pub fn build(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            source: self.source,
            subject_key: self.subject_key,
            options: self.options,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            last_seq: 0,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// Card lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    /// Created at plan time; waiting on dependencies.
    Pending,
    /// All dependencies completed; eligible to run once its group has
    /// admission capacity.
    Ready,
    /// Claimed by a worker; the Executor is running.
    Running,
    /// Finished successfully (including via cache hit or deadline fallback).
    Completed,
    /// Exhausted its retry budget.
    Failed,
    /// A required dependency failed, making this card's execution moot.
    Skipped,
}

impl CardStatus {
    /// Whether this status is terminal for the card.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CardStatus::Completed | CardStatus::Failed | CardStatus::Skipped
        )
    }
}

/// A single scheduling unit within a job: `(job_id, card_name)`.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Card {
    /// Owning job.
    pub job_id: Uuid,
    /// Card name, unique within the job (e.g. `resource.profile`, `summary`,
    /// `full_report`).
    pub card_name: String,
    /// Current lifecycle status.
    pub status: CardStatus,
    /// Internal cards are execution-only and never rendered to the client.
    pub internal: bool,
    /// Attempts made so far (starts at 0; incremented on each dispatch).
    pub attempts: u32,
    /// Names of cards this one depends on; all must be `completed` before
    /// this card becomes `ready`.
    pub depends_on: BTreeSet<String>,
    /// Concurrency-group tag for admission control (e.g. `llm`, `crawlbase`).
    pub concurrency_group: String,
    /// Soft deadline in milliseconds, measured from `job.created_at`. `None`
    /// means no deadline (base/internal cards, by rules-default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Maximum dispatch attempts before the card is marked `failed`.
    pub max_attempts: u32,
    /// Streaming-render declaration for text cards, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_spec: Option<StreamSpec>,
    /// Accumulated output once the card has produced (or begun producing,
    /// for streaming cards) a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<CardOutput>,
}

impl Card {
    /// Whether every name in `depends_on` is present and `completed` in
    /// `completed_cards`. Used by the scheduler's readiness index.
    #[must_use]
    pub fn dependencies_satisfied(&self, completed_cards: impl Fn(&str) -> bool) -> bool {
        self.depends_on.iter().all(|name| completed_cards(name.as_str()))
    }
}

/// Builder for [`Card`].
#[derive(Debug, Clone)]
pub struct CardBuilder {
    job_id: Uuid,
    card_name: String,
    internal: bool,
    depends_on: BTreeSet<String>,
    concurrency_group: String,
    deadline_ms: Option<u64>,
    max_attempts: u32,
    stream_spec: Option<StreamSpec>,
}

impl CardBuilder {
    /// Start building a card for `job_id` named `card_name`.
    #[must_use]
    pub fn new(job_id: Uuid, card_name: impl Into<String>, concurrency_group: impl Into<String>) -> Self {
        Self {
            job_id,
            card_name: card_name.into(),
            internal: false,
            depends_on: BTreeSet::new(),
            concurrency_group: concurrency_group.into(),
            deadline_ms: None,
            max_attempts: 1,
            stream_spec: None,
        }
    }

    /// Mark this card internal (execution-only, never rendered).
    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Set the full dependency set.
    #[must_use]
    pub fn depends_on(mut self, depends_on: BTreeSet<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Set the soft deadline in milliseconds.
    #[must_use]
    pub fn deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the stream spec for text cards.
    #[must_use]
    pub fn stream_spec(mut self, stream_spec: StreamSpec) -> Self {
        self.stream_spec = Some(stream_spec);
        self
    }

    /// Finish building. The card starts `pending` with zero attempts and no
    /// output.
    #[must_use]
    pub fn build(self) -> Card {
        Card {
            job_id: self.job_id,
            card_name: self.card_name,
            status: CardStatus::Pending,
            internal: self.internal,
            attempts: 0,
            depends_on: self.depends_on,
            concurrency_group: self.concurrency_group,
            deadline_ms: self.deadline_ms,
            max_attempts: self.max_attempts,
            stream_spec: self.stream_spec,
            output: None,
        }
    }
}
