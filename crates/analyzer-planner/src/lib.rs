// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Planner: given `(source, requested_cards)`, computes the closed
//! dependency set and a topologically-ordered execution DAG (§4.2).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use analyzer_core::StreamSpec;
use analyzer_error::{AnalyzerError, ErrorCode};
use analyzer_rules::{CardKind, FallbackFn, RuleSet};

/// One unit of the planned DAG, stamped with everything the Scheduler and
/// Executor need without consulting the rule set again.
#[derive(Debug, Clone)]
pub struct PlannedUnit {
    /// Card name.
    pub name: String,
    /// Dispatch kind.
    pub kind: CardKind,
    /// Whether this card is internal.
    pub internal: bool,
    /// Names of cards this one depends on (all present in the same plan).
    pub depends_on: BTreeSet<String>,
    /// Concurrency-group tag.
    pub concurrency_group: String,
    /// Soft deadline in milliseconds, if any.
    pub deadline_ms: Option<u64>,
    /// Maximum dispatch attempts.
    pub max_attempts: u32,
    /// Streaming declaration, if any.
    pub stream_spec: Option<StreamSpec>,
    /// Deterministic deadline fallback, if any (required whenever
    /// `deadline_ms` is set).
    pub fallback: Option<FallbackFn>,
    /// Whitelist of job-option keys that affect this card's cache
    /// fingerprint.
    pub fingerprint_option_keys: &'static [&'static str],
}

/// The result of planning: units in a valid topological order (every unit
/// appears after all of its dependencies).
#[derive(Debug, Clone)]
pub struct Plan {
    /// Planned units, dependencies-first.
    pub units: Vec<PlannedUnit>,
}

impl Plan {
    /// Look up a planned unit by name.
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&PlannedUnit> {
        self.units.iter().find(|u| u.name == name)
    }
}

fn unknown_card_error(name: &str) -> AnalyzerError {
    AnalyzerError::new(ErrorCode::InputUnknownCard, format!("unknown card: {name}"))
        .with_context("card", name)
}

fn cycle_error(remaining: &BTreeSet<&'static str>) -> AnalyzerError {
    AnalyzerError::new(
        ErrorCode::SchedulingCycleDetected,
        "rules declare a dependency cycle",
    )
    .with_context("unresolved_cards", remaining.iter().copied().collect::<Vec<_>>())
}

/// Compute the closed dependency set and execution DAG for `requested`
/// cards against `rules` (or the source's default visible cards when
/// `requested` is `None`).
///
/// Fails with [`ErrorCode::InputUnknownCard`] if a requested name does not
/// exist for the source, or [`ErrorCode::SchedulingCycleDetected`] if the
/// rules are malformed (a `depends_on` cycle).
pub fn plan(rules: &RuleSet, requested: Option<&[String]>) -> Result<Plan, AnalyzerError> {
    let seed: Vec<&str> = match requested {
        Some(names) if !names.is_empty() => names.iter().map(String::as_str).collect(),
        _ => rules.default_visible_cards.to_vec(),
    };

    let mut closed: BTreeSet<&'static str> = BTreeSet::new();
    let mut queue: VecDeque<&'static str> = VecDeque::new();

    for name in seed {
        let card = rules.card(name).ok_or_else(|| unknown_card_error(name))?;
        if closed.insert(card.name) {
            queue.push_back(card.name);
        }
    }

    while let Some(name) = queue.pop_front() {
        let card = rules
            .card(name)
            .expect("every name in the closed set came from this rule set");
        for dep in &card.depends_on {
            if closed.insert(dep) {
                queue.push_back(dep);
            }
        }
    }

    let has_business_card = closed
        .iter()
        .any(|name| rules.card(name).is_some_and(|c| c.kind == CardKind::Business));
    if has_business_card {
        let aggregator = rules.aggregator_name();
        if let Some(card) = rules.card(aggregator) {
            if closed.insert(card.name) {
                queue.push_back(card.name);
            }
            while let Some(name) = queue.pop_front() {
                let card = rules.card(name).expect("closed set member exists");
                for dep in &card.depends_on {
                    if closed.insert(dep) {
                        queue.push_back(dep);
                    }
                }
            }
        }
    }

    let order = topological_order(rules, &closed)?;

    let units = order
        .into_iter()
        .map(|name| {
            let card = rules.card(name).expect("topological order only contains closed members");
            PlannedUnit {
                name: card.name.to_string(),
                kind: card.kind,
                internal: card.internal,
                depends_on: card.depends_on.iter().map(|s| s.to_string()).collect(),
                concurrency_group: card.concurrency_group.to_string(),
                deadline_ms: card.deadline_ms,
                max_attempts: card.max_attempts,
                stream_spec: card.stream_spec.clone(),
                fallback: card.fallback,
                fingerprint_option_keys: card.fingerprint_option_keys,
            }
        })
        .collect();

    Ok(Plan { units })
}

/// Kahn's algorithm restricted to `closed`: returns a dependencies-first
/// order, or a cycle error if any member is unreachable from a zero
/// in-degree node.
fn topological_order(
    rules: &RuleSet,
    closed: &BTreeSet<&'static str>,
) -> Result<Vec<&'static str>, AnalyzerError> {
    let mut in_degree: BTreeMap<&'static str, usize> = closed.iter().map(|n| (*n, 0)).collect();
    let mut dependents: BTreeMap<&'static str, Vec<&'static str>> =
        closed.iter().map(|n| (*n, Vec::new())).collect();

    for &name in closed {
        let card = rules.card(name).expect("closed set member exists");
        for dep in &card.depends_on {
            *in_degree.get_mut(name).expect("in_degree seeded for every closed member") += 1;
            dependents
                .get_mut(dep)
                .expect("dependency is itself closed")
                .push(name);
        }
    }

    let mut ready: VecDeque<&'static str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(closed.len());
    while let Some(name) = ready.pop_front() {
        order.push(name);
        for &dependent in &dependents[name] {
            let degree = in_degree.get_mut(dependent).expect("dependent tracked");
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() != closed.len() {
        let remaining: BTreeSet<&'static str> = closed
            .iter()
            .copied()
            .filter(|n| !order.contains(n))
            .collect();
        return Err(cycle_error(&remaining));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyzer_core::Source;

    #[test]
    fn default_plan_includes_aggregator_and_topological_order() {
        let rules = analyzer_rules::rules_for(Source::Github);
        let plan = plan(rules, None).unwrap();
        assert!(plan.unit("full_report").is_some());
        assert!(plan.unit("resource.profile").is_some());

        let index_of = |name: &str| plan.units.iter().position(|u| u.name == name).unwrap();
        assert!(index_of("resource.profile") < index_of("profile"));
        assert!(index_of("profile") < index_of("full_report"));
    }

    #[test]
    fn requesting_only_a_resource_card_excludes_the_aggregator() {
        let rules = analyzer_rules::rules_for(Source::Github);
        let plan = plan(rules, Some(&["resource.profile".to_string()])).unwrap();
        assert!(plan.unit("full_report").is_none());
        assert_eq!(plan.units.len(), 1);
    }

    #[test]
    fn unknown_card_is_rejected() {
        let rules = analyzer_rules::rules_for(Source::Github);
        let err = plan(rules, Some(&["does_not_exist".to_string()])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InputUnknownCard);
    }

    #[test]
    fn requesting_summary_pulls_in_its_full_transitive_closure() {
        let rules = analyzer_rules::rules_for(Source::Scholar);
        let plan = plan(rules, Some(&["summary".to_string()])).unwrap();
        assert!(plan.unit("resource.profile").is_some());
        assert!(plan.unit("resource.papers").is_some());
        assert!(plan.unit("profile").is_some());
        assert!(plan.unit("full_report").is_some());
        assert!(plan.unit("role_model").is_none());
    }
}
