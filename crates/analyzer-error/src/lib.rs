// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the analysis pipeline core.
//!
//! Every fallible operation in the scheduler, executor, planner, cache and
//! validator layers reports errors through [`AnalyzerError`], which pairs a
//! stable [`ErrorCode`] with free-form message and context. This lets the
//! scheduler classify failures (retryable vs. terminal) without matching on
//! string messages, and lets the API layer serialize a failure without
//! carrying an opaque `source` over the wire.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

/// Broad grouping of [`ErrorCode`]s, used for coarse-grained handling (e.g.
/// "is this an upstream problem or ours?").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected at job-creation time: unknown source/card, malformed input.
    Input,
    /// A planner or scheduler invariant could not be satisfied.
    Scheduling,
    /// A call to a `ResourceFetcher` or `LLMCaller` adapter failed.
    Upstream,
    /// A card payload failed its registered validator.
    Validation,
    /// The cache returned or was asked to store a value it cannot honor.
    Cache,
    /// A bug: the scheduler's own invariants were violated.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Scheduling => "scheduling",
            ErrorCategory::Upstream => "upstream",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Cache => "cache",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Stable, serializable error codes. Maps 1:1 onto the error taxonomy's
/// kinds (not type names — kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// `source` is not one of the recognized enumerated sources.
    InputUnknownSource,
    /// A requested card name does not exist for the source (Planner).
    InputUnknownCard,
    /// The request body could not be interpreted as a valid job input.
    InputMalformedContent,
    /// Rules declare a `depends_on` cycle (Planner).
    SchedulingCycleDetected,
    /// The job was cancelled; in-flight units were signalled to stop.
    SchedulingCancelled,
    /// An upstream call failed in a way expected to succeed on retry
    /// (5xx, timeout, rate limit).
    UpstreamTransient,
    /// An upstream call failed in a way that will not succeed on retry
    /// (404, auth failure, policy violation).
    UpstreamPermanent,
    /// A card's registered validator rejected its payload.
    ValidatorRejected,
    /// A cache entry failed validation on read and was treated as a miss.
    CacheInvalidEntry,
    /// The scheduler's own invariants were violated (e.g. a dependency's
    /// output was missing when the unit was marked ready).
    InternalInvariantViolation,
}

impl ErrorCode {
    /// The broad category this code belongs to.
    #[must_use]
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::InputUnknownSource
            | ErrorCode::InputUnknownCard
            | ErrorCode::InputMalformedContent => ErrorCategory::Input,
            ErrorCode::SchedulingCycleDetected | ErrorCode::SchedulingCancelled => {
                ErrorCategory::Scheduling
            }
            ErrorCode::UpstreamTransient | ErrorCode::UpstreamPermanent => ErrorCategory::Upstream,
            ErrorCode::ValidatorRejected => ErrorCategory::Validation,
            ErrorCode::CacheInvalidEntry => ErrorCategory::Cache,
            ErrorCode::InternalInvariantViolation => ErrorCategory::Internal,
        }
    }

    /// Stable lowercase-with-underscore string form (same as the serde
    /// representation, exposed for log lines that don't want to serialize).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InputUnknownSource => "INPUT_UNKNOWN_SOURCE",
            ErrorCode::InputUnknownCard => "INPUT_UNKNOWN_CARD",
            ErrorCode::InputMalformedContent => "INPUT_MALFORMED_CONTENT",
            ErrorCode::SchedulingCycleDetected => "SCHEDULING_CYCLE_DETECTED",
            ErrorCode::SchedulingCancelled => "SCHEDULING_CANCELLED",
            ErrorCode::UpstreamTransient => "UPSTREAM_TRANSIENT",
            ErrorCode::UpstreamPermanent => "UPSTREAM_PERMANENT",
            ErrorCode::ValidatorRejected => "VALIDATOR_REJECTED",
            ErrorCode::CacheInvalidEntry => "CACHE_INVALID_ENTRY",
            ErrorCode::InternalInvariantViolation => "INTERNAL_INVARIANT_VIOLATION",
        }
    }

    /// Whether a unit that failed with this code should be retried (within
    /// its `max_attempts` budget) rather than transitioning straight to
    /// `failed`: transient upstream and validator-rejection failures get
    /// another attempt, permanent upstream failures, cancellation, and
    /// internal invariant violations do not.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::UpstreamTransient | ErrorCode::ValidatorRejected | ErrorCode::CacheInvalidEntry
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-wide error type carrying a stable [`ErrorCode`], a human message,
/// optional structured context, and an optional source error.
pub struct AnalyzerError {
    code: ErrorCode,
    message: String,
    context: BTreeMap<String, serde_json::Value>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AnalyzerError {
    /// Construct a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach a context key/value pair. Values that fail to serialize are
    /// silently skipped rather than panicking — context is best-effort
    /// diagnostics, never load-bearing.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl serde::Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The error category (shorthand for `self.code().category()`).
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Whether the failed operation should be retried, per [`ErrorCode::retryable`].
    #[must_use]
    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    /// The structured context map.
    #[must_use]
    pub fn context(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.context
    }
}

impl fmt::Debug for AnalyzerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("context", &self.context)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            if let Ok(json) = serde_json::to_string(&self.context) {
                write!(f, " {json}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AnalyzerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Wire-serializable snapshot of an [`AnalyzerError`], used by `card.failed`
/// payloads and the `ApiError` response shape. Drops the opaque `source`,
/// keeping only its rendered message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AnalyzerErrorDto {
    /// The stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether the corresponding unit/card may be retried.
    pub retryable: bool,
    /// Structured context, if any.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Rendered `Display` of the source error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&AnalyzerError> for AnalyzerErrorDto {
    fn from(err: &AnalyzerError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            retryable: err.retryable(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<AnalyzerError> for AnalyzerErrorDto {
    fn from(err: AnalyzerError) -> Self {
        AnalyzerErrorDto::from(&err)
    }
}
