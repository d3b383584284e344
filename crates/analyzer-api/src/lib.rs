// SPDX-License-Identifier: MIT OR Apache-2.0
//! External interfaces (§6): typed request/response/event envelopes for
//! create-job, job-snapshot, and the SSE event stream.
//!
//! Mirrors `abp_daemon::api`'s "types only, no wiring" posture: every
//! shape here is a plain serializable Rust type plus a `fn` handler
//! signature. No HTTP framework, router, or transport dependency is
//! pulled in — a host process owns the actual routes and calls into
//! `analyzer-scheduler`/`analyzer-resolver` through these types.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use analyzer_core::{CardOutput, CardStatus, Event, EventPayload, Job, JobOptions, JobStatus, Source, StreamSpec};
use analyzer_error::AnalyzerError;
use analyzer_resolver::Candidate;

/// Wire shape for a resolver candidate (§6): `{label, input, meta}`. Distinct
/// from [`Candidate`] because the resolver's own ranking machinery
/// (`score`, the strong-candidate threshold) is an implementation detail
/// that never crosses the external interface.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ApiCandidate {
    /// Human-readable label shown to the caller choosing between candidates.
    pub label: String,
    /// The canonical input this candidate would resolve to if chosen.
    pub input: String,
    /// Free-form adapter metadata, passed through uninterpreted.
    pub meta: serde_json::Value,
}

impl From<&Candidate> for ApiCandidate {
    fn from(candidate: &Candidate) -> Self {
        Self {
            label: candidate.label.clone(),
            input: candidate.subject_key.clone(),
            meta: candidate.meta.clone(),
        }
    }
}

impl From<Candidate> for ApiCandidate {
    fn from(candidate: Candidate) -> Self {
        Self::from(&candidate)
    }
}

// ---------------------------------------------------------------------------
// Create job
// ---------------------------------------------------------------------------

/// Execution mode requested for `POST /analyze`. `Sync` is a convenience
/// the host process may implement by blocking on [`analyzer_scheduler::run_job`]
/// before responding; `Async` returns immediately with `status: queued` and
/// the caller follows up with the job snapshot or SSE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CreateJobMode {
    /// Respond only once the job reaches a terminal status.
    Sync,
    /// Respond immediately with the queued job id.
    Async,
}

/// The raw content to analyze, before resolution/canonicalisation.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateJobInput {
    /// Free-form or directly-addressable content (URL, handle, opaque id).
    pub content: String,
}

/// `POST /analyze` request body.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateJobRequest {
    /// Upstream source to analyze.
    pub source: Source,
    /// Execution mode.
    pub mode: CreateJobMode,
    /// Raw input content.
    pub input: CreateJobInput,
    /// Explicit card selection; `None` means the source's default visible set.
    #[serde(default)]
    pub cards: Option<Vec<String>>,
    /// Job-creation options.
    #[serde(default)]
    pub options: JobOptions,
    /// Client-supplied idempotency key (carried as a header on the wire;
    /// modelled as a field here since this crate has no transport layer).
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// The successful, job-created half of `POST /analyze`'s response.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateJobCreated {
    /// Always `true` for this variant.
    pub success: bool,
    /// Newly created (or idempotently replayed) job id.
    pub job_id: Uuid,
    /// Canonicalised subject key the job was created against.
    pub subject_key: String,
    /// The job's status at response time (`queued` for async, terminal for sync).
    pub status: JobStatus,
    /// Whether any card was served from a fresh cache hit.
    pub cache_hit: bool,
    /// Whether any card was served from a stale cache hit.
    pub cache_stale: bool,
    /// Whether a background refresh was kicked off behind a stale hit.
    pub refresh_in_progress: bool,
    /// Whether this response is a replay of a prior create with the same
    /// idempotency key and request body.
    pub idempotent_replay: bool,
}

/// The ambiguous-input half of `POST /analyze`'s response: no job was created.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateJobNeedsConfirmation {
    /// Always `true`: surfacing candidates is not itself a failure.
    pub success: bool,
    /// Always `true` for this variant.
    pub needs_confirmation: bool,
    /// Up to `analyzer_resolver::MAX_CANDIDATES` candidates to choose from.
    pub candidates: Vec<ApiCandidate>,
}

/// `POST /analyze` response: either a created job or a disambiguation prompt.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum CreateJobResponse {
    /// A job was created (or idempotently replayed).
    Created(CreateJobCreated),
    /// The input was ambiguous; no job was created.
    NeedsConfirmation(CreateJobNeedsConfirmation),
}

// ---------------------------------------------------------------------------
// Job snapshot
// ---------------------------------------------------------------------------

/// One card's state within a [`JobSnapshot`]. Includes the card's
/// accumulated `output`, including partial stream text, so a client
/// reconnecting mid-stream can reconstruct UI state without replaying
/// every event.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CardSnapshot {
    /// Card name.
    pub card: String,
    /// Current lifecycle status.
    pub status: CardStatus,
    /// Whether this card is internal (execution-only).
    pub internal: bool,
    /// Streaming declaration, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_spec: Option<StreamSpec>,
    /// Accumulated output, if the card has produced (or begun producing) one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<CardOutput>,
}

/// `GET /analyze/jobs/{job_id}` response: the job record plus every card's
/// current state.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct JobSnapshot {
    /// The job record.
    pub job: Job,
    /// Every planned card's current state, in plan order.
    pub cards: Vec<CardSnapshot>,
}

// ---------------------------------------------------------------------------
// SSE stream
// ---------------------------------------------------------------------------

/// One SSE frame body: `data: <json>\n\n` on the wire, modelled here as the
/// JSON value alone (framing is the host process's concern).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SseFrame {
    /// Always `"analysis"`: distinguishes this stream from any other SSE
    /// source multiplexed onto the same connection.
    pub source: String,
    /// The event's tag (`card.started`, `job.completed`, `ping`, ...).
    pub event_type: String,
    /// `{job_id, seq, ...payload fields}`.
    pub payload: SsePayload,
}

/// The `payload` object of an [`SseFrame`]: the envelope fields every event
/// carries, plus the event-specific fields flattened in alongside them.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SsePayload {
    /// The job this event belongs to.
    pub job_id: Uuid,
    /// This event's seq within the job.
    pub seq: u64,
    /// Event-specific fields, flattened.
    #[serde(flatten)]
    pub event: EventPayload,
}

impl SseFrame {
    /// Build the SSE frame for a durable [`Event`].
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self {
            source: "analysis".to_string(),
            event_type: event.payload.event_type().to_string(),
            payload: SsePayload { job_id: event.job_id, seq: event.seq, event: event.payload.clone() },
        }
    }

    /// Build a keepalive frame. Keepalives are not durable: they carry no
    /// `seq` and are never persisted to the event log.
    #[must_use]
    pub fn ping(job_id: Uuid, now: DateTime<Utc>) -> Self {
        let _ = now;
        Self {
            source: "analysis".to_string(),
            event_type: "ping".to_string(),
            payload: SsePayload { job_id, seq: 0, event: EventPayload::Ping },
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structured API error returned on failure, mirroring the daemon's
/// `code`/`message`/`details` shape.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ApiError {
    /// Machine-readable error code (the `AnalyzerError`'s `ErrorCode`, or a
    /// transport-level code like `"not_found"` the host process adds).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Construct an error with no additional details.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), details: None }
    }

    /// 404 — resource not found.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }
}

impl From<&AnalyzerError> for ApiError {
    fn from(err: &AnalyzerError) -> Self {
        let details = (!err.context().is_empty()).then(|| serde_json::to_value(err.context()).unwrap_or_default());
        Self { code: err.code().as_str().to_string(), message: err.to_string(), details }
    }
}

impl From<AnalyzerError> for ApiError {
    fn from(err: AnalyzerError) -> Self {
        ApiError::from(&err)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ---------------------------------------------------------------------------
// Handler signatures (types only — no actual transport wiring)
// ---------------------------------------------------------------------------

/// Handler signature: `POST /analyze`.
pub type CreateJobHandler = fn(CreateJobRequest) -> Result<CreateJobResponse, ApiError>;

/// Handler signature: `GET /analyze/jobs/{job_id}`.
pub type GetJobSnapshotHandler = fn(job_id: Uuid) -> Result<JobSnapshot, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use analyzer_core::JobBuilder;

    #[test]
    fn create_job_created_roundtrips_without_needs_confirmation() {
        let resp = CreateJobResponse::Created(CreateJobCreated {
            success: true,
            job_id: Uuid::nil(),
            subject_key: "torvalds".into(),
            status: JobStatus::Queued,
            cache_hit: false,
            cache_stale: false,
            refresh_in_progress: false,
            idempotent_replay: false,
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["job_id"], "00000000-0000-0000-0000-000000000000");
        assert!(json.get("needs_confirmation").is_none());
        let back: CreateJobResponse = serde_json::from_value(json).unwrap();
        assert!(matches!(back, CreateJobResponse::Created(_)));
    }

    #[test]
    fn create_job_needs_confirmation_roundtrips_as_the_other_variant() {
        let resp = CreateJobResponse::NeedsConfirmation(CreateJobNeedsConfirmation {
            success: true,
            needs_confirmation: true,
            candidates: vec![ApiCandidate {
                label: "Linus Torvalds".into(),
                input: "torvalds".into(),
                meta: serde_json::Value::Null,
            }],
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["needs_confirmation"], true);
        assert_eq!(json["candidates"][0]["input"], "torvalds");
        assert!(json["candidates"][0].get("score").is_none());
        let back: CreateJobResponse = serde_json::from_value(json).unwrap();
        match back {
            CreateJobResponse::NeedsConfirmation(nc) => assert_eq!(nc.candidates.len(), 1),
            CreateJobResponse::Created(_) => panic!("wrong variant"),
        }
    }

    #[test]
    fn job_snapshot_includes_accumulated_stream_output() {
        let job = JobBuilder::new(Source::Github, "torvalds").build(Utc::now());
        let snapshot = JobSnapshot {
            job: job.clone(),
            cards: vec![CardSnapshot {
                card: "summary".into(),
                status: CardStatus::Running,
                internal: false,
                stream_spec: Some(StreamSpec {
                    field: "body".into(),
                    format: "markdown".into(),
                    sections: vec!["body".into()],
                }),
                output: Some(CardOutput { data: serde_json::json!({}), stream: Some("partial te".into()) }),
            }],
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["cards"][0]["output"]["stream"], "partial te");
    }

    #[test]
    fn sse_frame_flattens_envelope_and_payload_fields() {
        let event = Event {
            job_id: Uuid::nil(),
            seq: 3,
            created_at: Utc::now(),
            payload: EventPayload::CardStarted {
                card: "profile".into(),
                status: "running".into(),
                internal: None,
                stream: None,
            },
        };
        let frame = SseFrame::from_event(&event);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event_type"], "card.started");
        assert_eq!(json["payload"]["seq"], 3);
        assert_eq!(json["payload"]["card"], "profile");
    }

    #[test]
    fn ping_frame_carries_no_durable_seq() {
        let frame = SseFrame::ping(Uuid::nil(), Utc::now());
        assert_eq!(frame.event_type, "ping");
    }

    #[test]
    fn api_error_from_analyzer_error_preserves_the_code() {
        let err = AnalyzerError::new(analyzer_error::ErrorCode::InputUnknownCard, "unknown card: x");
        let api_err: ApiError = (&err).into();
        assert_eq!(api_err.code, "INPUT_UNKNOWN_CARD");
    }
}
