// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layered configuration for the analysis pipeline (§6 configuration keys).
//!
//! All tunables consumed by the Planner, Scheduler and Executor live in one
//! immutable [`AnalyzerConfig`] value, loaded once at process startup:
//! built-in defaults, optionally overlaid by a TOML file, then overlaid
//! again by environment variables. There is no hot reload and no
//! module-level mutable configuration state (§9 design note).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;

use analyzer_core::Source;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Errors that abort configuration loading outright.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The caller passed a config path that does not exist.
    #[error("config file not found: {0}")]
    FileNotFound(String),
    /// The config file exists but is not valid TOML, or does not match
    /// [`AnalyzerConfig`]'s shape.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path that failed to parse.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// The loaded value failed [`validate_config`]'s hard checks.
    #[error("invalid configuration: {}", .reasons.join("; "))]
    ValidationError {
        /// One message per violated constraint.
        reasons: Vec<String>,
    },
}

/// Advisory issues that do not block startup, surfaced to the caller (the
/// CLI logs them at `warn` level and proceeds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// An optional field was left at its default because neither the file
    /// nor the environment set it.
    MissingOptionalField(&'static str),
    /// A deprecated key was present in the loaded file and was ignored.
    DeprecatedField(String),
    /// `default_deadline_ms` is unusually large, which defeats the point of
    /// a soft deadline (it will rarely, if ever, fire).
    LargeDeadline(u64),
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField(field) => {
                write!(f, "{field} not set, using default")
            }
            ConfigWarning::DeprecatedField(field) => {
                write!(f, "'{field}' is deprecated and was ignored")
            }
            ConfigWarning::LargeDeadline(ms) => {
                write!(f, "default_deadline_ms={ms} is unusually large for a soft deadline")
            }
        }
    }
}

/// When a card's soft deadline is measured from. The shipped default is
/// unconditionally [`DeadlinePolicy::AtJobCreation`] (decided Open Question
/// 3) — this type exists so a host process can opt a specific source into
/// per-unit-dispatch deadlines without changing the default for everyone
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Deadlines measured from `job.created_at` (the default).
    AtJobCreation,
    /// Deadlines measured from the instant a unit is dispatched.
    AtUnitDispatch,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        DeadlinePolicy::AtJobCreation
    }
}

/// Fresh/stale TTL pair for one cache namespace, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CacheTtlMs {
    /// Fresh window length.
    pub fresh_ms: u64,
    /// Stale window length, layered on top of the fresh window.
    pub stale_ms: u64,
}

impl CacheTtlMs {
    const fn new(fresh_ms: u64, stale_ms: u64) -> Self {
        Self { fresh_ms, stale_ms }
    }
}

/// The complete, immutable configuration value threaded through the
/// Scheduler and Executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Total worker pool size: the scheduler never has more than this many
    /// units in flight at once, across all concurrency groups.
    pub worker_pool_size: usize,
    /// Per-concurrency-group admission overrides. Groups not named here
    /// fall back to the built-in defaults in [`group_limit`].
    pub group_limits: BTreeMap<String, usize>,
    /// Retry budget for `resource.*` cards.
    pub max_attempts_resource: u32,
    /// Retry budget for business (LLM-backed) cards.
    pub max_attempts_ai: u32,
    /// Retry budget for aggregator/base cards.
    pub max_attempts_base: u32,
    /// Default soft deadline for enrichment cards, in milliseconds.
    pub default_deadline_ms: u64,
    /// Cache TTLs for the upstream-fetch namespace.
    pub cache_upstream_fetch_ttl: CacheTtlMs,
    /// Cache TTLs for the card-output namespace.
    pub cache_card_output_ttl: CacheTtlMs,
    /// Byte threshold that flushes a buffered `card.delta`.
    pub delta_flush_bytes: usize,
    /// Time threshold, in milliseconds, that flushes a buffered `card.delta`
    /// even if `delta_flush_bytes` has not been reached.
    pub delta_flush_interval_ms: u64,
    /// `tracing` log level filter (e.g. `"info"`, `"analyzer=debug"`).
    pub log_level: String,
    /// `tracing-subscriber` output format: `"pretty"` or `"json"`.
    pub log_format: String,
    /// Default deadline policy, applied to every source unless overridden
    /// in `deadline_policy_overrides`.
    pub deadline_policy: DeadlinePolicy,
    /// Per-source deadline policy overrides, keyed by [`Source::as_str`].
    pub deadline_policy_overrides: BTreeMap<String, DeadlinePolicy>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 32,
            group_limits: BTreeMap::new(),
            max_attempts_resource: 2,
            max_attempts_ai: 2,
            max_attempts_base: 1,
            default_deadline_ms: 10_000,
            cache_upstream_fetch_ttl: CacheTtlMs::new(15 * 60_000, 45 * 60_000),
            cache_card_output_ttl: CacheTtlMs::new(15 * 60_000, 45 * 60_000),
            delta_flush_bytes: 256,
            delta_flush_interval_ms: 80,
            log_level: "analyzer=info".to_string(),
            log_format: "pretty".to_string(),
            deadline_policy: DeadlinePolicy::AtJobCreation,
            deadline_policy_overrides: BTreeMap::new(),
        }
    }
}

impl AnalyzerConfig {
    /// Effective deadline policy for `source`: the per-source override if
    /// one is set, otherwise the global default.
    #[must_use]
    pub fn deadline_policy_for(&self, source: Source) -> DeadlinePolicy {
        self.deadline_policy_overrides
            .get(source.as_str())
            .copied()
            .unwrap_or(self.deadline_policy)
    }
}

/// Built-in per-group concurrency defaults (§4.1/§5): `llm` and `crawlbase`
/// get a fraction of the worker pool, `apify` is serialized to one
/// in-flight call, everything else may use the full pool.
#[must_use]
pub fn group_limit(config: &AnalyzerConfig, group: &str) -> usize {
    if let Some(&limit) = config.group_limits.get(group) {
        return limit.min(config.worker_pool_size).max(1);
    }
    let default = match group {
        "llm" => config.worker_pool_size.min(4),
        "crawlbase" => config.worker_pool_size.min(2),
        "apify" => 1,
        _ => config.worker_pool_size,
    };
    default.max(1)
}

/// Load configuration: defaults, then `path` (if given) as a TOML overlay,
/// then environment variable overrides. Reads once; callers own the
/// resulting value for the lifetime of the process.
pub fn load_config(path: Option<&Path>) -> Result<AnalyzerConfig, ConfigError> {
    let mut config = AnalyzerConfig::default();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        config = parse_toml(&raw, path)?;
    }

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML document as an [`AnalyzerConfig`] overlay (partial documents
/// fall back to defaults for any field they omit).
fn parse_toml(raw: &str, path: &Path) -> Result<AnalyzerConfig, ConfigError> {
    toml::from_str(raw).map_err(|source| ConfigError::ParseError {
        path: path.display().to_string(),
        source,
    })
}

/// Apply `ANALYZER_*` environment variable overrides in place. Unset or
/// unparsable variables are left as-is (unparsable values are silently
/// ignored rather than aborting startup; this is a best-effort overlay,
/// not a validation pass — `validate_config` is the place that rejects
/// bad values).
pub fn apply_env_overrides(config: &mut AnalyzerConfig) {
    if let Ok(v) = std::env::var("ANALYZER_WORKER_POOL_SIZE") {
        if let Ok(parsed) = v.parse() {
            config.worker_pool_size = parsed;
        }
    }
    if let Ok(v) = std::env::var("ANALYZER_MAX_ATTEMPTS_RESOURCE") {
        if let Ok(parsed) = v.parse() {
            config.max_attempts_resource = parsed;
        }
    }
    if let Ok(v) = std::env::var("ANALYZER_MAX_ATTEMPTS_AI") {
        if let Ok(parsed) = v.parse() {
            config.max_attempts_ai = parsed;
        }
    }
    if let Ok(v) = std::env::var("ANALYZER_MAX_ATTEMPTS_BASE") {
        if let Ok(parsed) = v.parse() {
            config.max_attempts_base = parsed;
        }
    }
    if let Ok(v) = std::env::var("ANALYZER_DEFAULT_DEADLINE_MS") {
        if let Ok(parsed) = v.parse() {
            config.default_deadline_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("ANALYZER_DELTA_FLUSH_BYTES") {
        if let Ok(parsed) = v.parse() {
            config.delta_flush_bytes = parsed;
        }
    }
    if let Ok(v) = std::env::var("ANALYZER_DELTA_FLUSH_INTERVAL_MS") {
        if let Ok(parsed) = v.parse() {
            config.delta_flush_interval_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("ANALYZER_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Ok(v) = std::env::var("ANALYZER_LOG_FORMAT") {
        config.log_format = v;
    }
}

/// Validate a loaded config: hard errors (`Err`) abort startup; soft issues
/// are returned as advisory [`ConfigWarning`]s alongside `Ok(())`.
pub fn validate_config(config: &AnalyzerConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut reasons = Vec::new();
    if config.worker_pool_size == 0 {
        reasons.push("worker_pool_size must be at least 1".to_string());
    }
    if config.max_attempts_resource == 0 || config.max_attempts_ai == 0 || config.max_attempts_base == 0 {
        reasons.push("max_attempts_* must be at least 1".to_string());
    }
    if !["pretty", "json"].contains(&config.log_format.as_str()) {
        reasons.push(format!("log_format must be 'pretty' or 'json', got '{}'", config.log_format));
    }
    if !reasons.is_empty() {
        return Err(ConfigError::ValidationError { reasons });
    }

    let mut warnings = Vec::new();
    if config.default_deadline_ms > 120_000 {
        warnings.push(ConfigWarning::LargeDeadline(config.default_deadline_ms));
    }
    if config.group_limits.is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField("group_limits"));
    }
    Ok(warnings)
}

/// Overlay `overlay` onto `base`, field by field, for the handful of fields
/// a host process is expected to override at runtime (e.g. a per-request
/// worker pool cap in a multi-tenant deployment). Every other field is
/// taken from `overlay` unconditionally, since both values are always
/// fully-populated [`AnalyzerConfig`]s rather than partial documents.
#[must_use]
pub fn merge_configs(base: &AnalyzerConfig, overlay: &AnalyzerConfig) -> AnalyzerConfig {
    let mut merged = overlay.clone();
    if merged.group_limits.is_empty() {
        merged.group_limits = base.group_limits.clone();
    }
    if merged.deadline_policy_overrides.is_empty() {
        merged.deadline_policy_overrides = base.deadline_policy_overrides.clone();
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_configuration_keys_table() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.worker_pool_size, 32);
        assert_eq!(config.max_attempts_resource, 2);
        assert_eq!(config.max_attempts_ai, 2);
        assert_eq!(config.max_attempts_base, 1);
        assert_eq!(config.default_deadline_ms, 10_000);
        assert_eq!(config.delta_flush_bytes, 256);
        assert_eq!(config.delta_flush_interval_ms, 80);
        assert_eq!(config.deadline_policy, DeadlinePolicy::AtJobCreation);
    }

    #[test]
    fn group_limit_defaults_follow_the_reference_table() {
        let config = AnalyzerConfig::default();
        assert_eq!(group_limit(&config, "llm"), 4);
        assert_eq!(group_limit(&config, "crawlbase"), 2);
        assert_eq!(group_limit(&config, "apify"), 1);
        assert_eq!(group_limit(&config, "github_api"), 32);
    }

    #[test]
    fn group_limit_override_is_capped_by_the_worker_pool() {
        let mut config = AnalyzerConfig::default();
        config.group_limits.insert("llm".to_string(), 100);
        assert_eq!(group_limit(&config, "llm"), 32);
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = load_config(Some(Path::new("/nonexistent/analyzer.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn partial_toml_overlay_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analyzer.toml");
        std::fs::write(&path, "worker_pool_size = 8\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.max_attempts_resource, 2);
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analyzer.toml");
        std::fs::write(&path, "worker_pool_size = 8\n").unwrap();
        // SAFETY-equivalent: tests run single-threaded within this module
        // for env var mutation; still racy against other test binaries, so
        // scope the var name tightly and clean up immediately.
        std::env::set_var("ANALYZER_WORKER_POOL_SIZE", "16");
        let config = load_config(Some(&path)).unwrap();
        std::env::remove_var("ANALYZER_WORKER_POOL_SIZE");
        assert_eq!(config.worker_pool_size, 16);
    }

    #[test]
    fn zero_worker_pool_size_fails_validation() {
        let mut config = AnalyzerConfig::default();
        config.worker_pool_size = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn empty_group_limits_is_a_warning_not_an_error() {
        let config = AnalyzerConfig::default();
        let warnings = validate_config(&config).unwrap();
        assert!(warnings.contains(&ConfigWarning::MissingOptionalField("group_limits")));
    }

    #[test]
    fn deadline_policy_override_applies_per_source() {
        let mut config = AnalyzerConfig::default();
        config
            .deadline_policy_overrides
            .insert(Source::Github.as_str().to_string(), DeadlinePolicy::AtUnitDispatch);
        assert_eq!(config.deadline_policy_for(Source::Github), DeadlinePolicy::AtUnitDispatch);
        assert_eq!(config.deadline_policy_for(Source::Scholar), DeadlinePolicy::AtJobCreation);
    }

    #[test]
    fn merge_keeps_overlay_values_but_fills_empty_maps_from_base() {
        let mut base = AnalyzerConfig::default();
        base.group_limits.insert("llm".to_string(), 2);
        let mut overlay = AnalyzerConfig::default();
        overlay.worker_pool_size = 64;
        let merged = merge_configs(&base, &overlay);
        assert_eq!(merged.worker_pool_size, 64);
        assert_eq!(merged.group_limits.get("llm"), Some(&2));
    }
}
