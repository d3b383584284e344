// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reference rule sets for the seven recognized sources.
//!
//! Every source declares the same shape: one or more `resource.*` fetch
//! cards, three visible business cards (`profile`, `summary`, `role_model`),
//! and the `full_report` aggregator. Only the concurrency-group tags on the
//! resource cards vary, reflecting which upstream adapter family backs
//! each source (`github_api`, `crawlbase`, `apify`, per-source `*_api`
//! tags — the convention named in §4.1).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use analyzer_core::{Source, StreamSpec};

use crate::{default_max_attempts, CardKind, CardRule, RuleSet, DEFAULT_ENRICHMENT_DEADLINE_MS};

fn resource_card(name: &'static str, group: &'static str) -> CardRule {
    CardRule {
        name,
        kind: CardKind::Resource,
        internal: true,
        depends_on: Default::default(),
        concurrency_group: group,
        deadline_ms: None,
        max_attempts: default_max_attempts(CardKind::Resource),
        stream_spec: None,
        fingerprint_option_keys: &[],
        fallback: None,
    }
}

fn business_card(
    name: &'static str,
    depends_on: &[&'static str],
    stream: bool,
    fallback: crate::FallbackFn,
) -> CardRule {
    CardRule {
        name,
        kind: CardKind::Business,
        internal: false,
        depends_on: depends_on.iter().copied().collect(),
        concurrency_group: "llm",
        deadline_ms: Some(DEFAULT_ENRICHMENT_DEADLINE_MS),
        max_attempts: default_max_attempts(CardKind::Business),
        stream_spec: stream.then(|| StreamSpec {
            field: "body".to_string(),
            format: "markdown".to_string(),
            sections: vec!["body".to_string()],
        }),
        fingerprint_option_keys: &[],
        fallback: Some(fallback),
    }
}

fn aggregator_card(depends_on: &[&'static str]) -> CardRule {
    CardRule {
        name: "full_report",
        kind: CardKind::Aggregator,
        internal: true,
        depends_on: depends_on.iter().copied().collect(),
        concurrency_group: "base",
        deadline_ms: None,
        max_attempts: default_max_attempts(CardKind::Aggregator),
        stream_spec: None,
        fingerprint_option_keys: &[],
        fallback: None,
    }
}

fn placeholder_safe_name(subject_key: &str, artifacts: &BTreeMap<String, serde_json::Value>, resource: &str) -> String {
    artifacts
        .get(resource)
        .and_then(|v| v.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| subject_key.to_string())
}

fn fallback_profile(subject_key: &str, artifacts: &BTreeMap<String, serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "name": placeholder_safe_name(subject_key, artifacts, "resource.profile"),
        "degraded": true,
    })
}

fn fallback_summary(subject_key: &str, artifacts: &BTreeMap<String, serde_json::Value>) -> serde_json::Value {
    let name = placeholder_safe_name(subject_key, artifacts, "resource.profile");
    serde_json::json!({
        "body": format!("A fuller summary for {name} could not be generated in time; this is a deterministic placeholder derived from already-fetched data."),
        "degraded": true,
    })
}

fn fallback_role_model(subject_key: &str, _artifacts: &BTreeMap<String, serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "matches": [{"name": format!("{subject_key} (self)"), "reason": "deadline fallback: no comparison computed"}],
        "degraded": true,
    })
}

fn build(
    source: Source,
    resources: Vec<CardRule>,
    profile_depends_on: &[&'static str],
    summary_depends_on: &[&'static str],
) -> RuleSet {
    let profile = business_card("profile", profile_depends_on, false, fallback_profile);
    let summary = business_card("summary", summary_depends_on, true, fallback_summary);
    let role_model = business_card("role_model", &["summary"], false, fallback_role_model);
    let aggregator = aggregator_card(&["profile", "summary", "role_model"]);

    let mut cards = BTreeMap::new();
    for r in resources {
        cards.insert(r.name, r);
    }
    for c in [profile, summary, role_model, aggregator] {
        cards.insert(c.name, c);
    }

    RuleSet {
        source,
        cards,
        default_visible_cards: &["profile", "summary", "role_model"],
    }
}

static SCHOLAR: OnceLock<RuleSet> = OnceLock::new();
static GITHUB: OnceLock<RuleSet> = OnceLock::new();
static LINKEDIN: OnceLock<RuleSet> = OnceLock::new();
static TWITTER: OnceLock<RuleSet> = OnceLock::new();
static OPENREVIEW: OnceLock<RuleSet> = OnceLock::new();
static HUGGINGFACE: OnceLock<RuleSet> = OnceLock::new();
static YOUTUBE: OnceLock<RuleSet> = OnceLock::new();

pub(crate) fn rules_for(source: Source) -> &'static RuleSet {
    match source {
        Source::Scholar => SCHOLAR.get_or_init(|| {
            build(
                Source::Scholar,
                vec![
                    resource_card("resource.profile", "crawlbase"),
                    resource_card("resource.papers", "crawlbase"),
                ],
                &["resource.profile"],
                &["profile", "resource.papers"],
            )
        }),
        Source::Github => GITHUB.get_or_init(|| {
            build(
                Source::Github,
                vec![
                    resource_card("resource.profile", "github_api"),
                    resource_card("resource.repos", "github_api"),
                ],
                &["resource.profile"],
                &["profile", "resource.repos"],
            )
        }),
        Source::Linkedin => LINKEDIN.get_or_init(|| {
            build(
                Source::Linkedin,
                vec![resource_card("resource.profile", "crawlbase")],
                &["resource.profile"],
                &["profile"],
            )
        }),
        Source::Twitter => TWITTER.get_or_init(|| {
            build(
                Source::Twitter,
                vec![
                    resource_card("resource.profile", "apify"),
                    resource_card("resource.timeline", "apify"),
                ],
                &["resource.profile"],
                &["profile", "resource.timeline"],
            )
        }),
        Source::Openreview => OPENREVIEW.get_or_init(|| {
            build(
                Source::Openreview,
                vec![resource_card("resource.profile", "openreview_api")],
                &["resource.profile"],
                &["profile"],
            )
        }),
        Source::Huggingface => HUGGINGFACE.get_or_init(|| {
            build(
                Source::Huggingface,
                vec![
                    resource_card("resource.profile", "huggingface_api"),
                    resource_card("resource.models", "huggingface_api"),
                ],
                &["resource.profile"],
                &["profile", "resource.models"],
            )
        }),
        Source::Youtube => YOUTUBE.get_or_init(|| {
            build(
                Source::Youtube,
                vec![resource_card("resource.profile", "youtube_api")],
                &["resource.profile"],
                &["profile"],
            )
        }),
    }
}
