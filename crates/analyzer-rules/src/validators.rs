// SPDX-License-Identifier: MIT OR Apache-2.0
//! The validator lookup table: `(source, card) -> fn(payload) -> ok|reject`.
//!
//! The same functions here gate freshly computed outputs, cached reads, and
//! deadline-fallback outputs alike (§4.8) — there is exactly one validator
//! per card, not one per code path.

use analyzer_core::Source;

/// A validator: `Ok(())` admits the payload, `Err(reason)` rejects it with a
/// human-readable reason (fed into the retry path as the rejection message).
pub type ValidatorFn = fn(&serde_json::Value) -> Result<(), String>;

const PLACEHOLDER_SENTINELS: &[&str] = &["unknown", "n/a", "tbd", ""];

fn is_placeholder_string(value: &serde_json::Value) -> bool {
    value
        .as_str()
        .map(|s| PLACEHOLDER_SENTINELS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn reject_if_empty_object(payload: &serde_json::Value) -> Result<(), String> {
    match payload {
        serde_json::Value::Null => Err("payload is null".to_string()),
        serde_json::Value::Object(map) if map.is_empty() => {
            Err("payload is an empty object".to_string())
        }
        _ => Ok(()),
    }
}

/// Validator for `resource.*` cards: the fetcher must have returned a
/// non-empty object. No field-level checks — resource payloads are opaque
/// upstream shapes.
pub fn validate_resource(payload: &serde_json::Value) -> Result<(), String> {
    reject_if_empty_object(payload)
}

/// Validator for the `full_report` aggregator: always admitted once it is
/// an object, even if some fields are absent (partial failures are expected
/// and handled by the job's rollup status, not by rejecting the aggregate).
pub fn validate_aggregator(payload: &serde_json::Value) -> Result<(), String> {
    if payload.is_object() {
        Ok(())
    } else {
        Err("full_report payload must be an object".to_string())
    }
}

/// Validator for the `profile` business card: requires a non-placeholder
/// `name` field.
pub fn validate_profile(payload: &serde_json::Value) -> Result<(), String> {
    reject_if_empty_object(payload)?;
    match payload.get("name") {
        None => Err("profile payload missing 'name'".to_string()),
        Some(v) if is_placeholder_string(v) => {
            Err("profile payload 'name' is a placeholder value".to_string())
        }
        Some(_) => Ok(()),
    }
}

/// Validator for the `summary` business card: requires a non-empty `body`.
pub fn validate_summary(payload: &serde_json::Value) -> Result<(), String> {
    reject_if_empty_object(payload)?;
    match payload.get("body") {
        None => Err("summary payload missing 'body'".to_string()),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
            Err("summary payload 'body' is empty".to_string())
        }
        Some(_) => Ok(()),
    }
}

/// Validator for the `role_model` business card: requires at least one
/// named comparison in `matches`.
pub fn validate_role_model(payload: &serde_json::Value) -> Result<(), String> {
    reject_if_empty_object(payload)?;
    match payload.get("matches").and_then(|v| v.as_array()) {
        None => Err("role_model payload missing 'matches' array".to_string()),
        Some(arr) if arr.is_empty() => {
            Err("role_model payload 'matches' array is empty".to_string())
        }
        Some(_) => Ok(()),
    }
}

/// Look up the validator for `(source, card)`. Every declared card in every
/// [`crate::RuleSet`] resolves to a validator here; the card-name match is
/// source-independent because the reference rule sets use the same visible
/// card names (`profile`, `summary`, `role_model`) across all seven
/// sources.
#[must_use]
pub fn validator_for(_source: Source, card: &str) -> Option<ValidatorFn> {
    if card == "full_report" {
        return Some(validate_aggregator);
    }
    if let Some(stripped) = card.strip_prefix("resource.") {
        let _ = stripped;
        return Some(validate_resource);
    }
    match card {
        "profile" => Some(validate_profile),
        "summary" => Some(validate_summary),
        "role_model" => Some(validate_role_model),
        _ => None,
    }
}
