// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Scheduler (§4.3): admits ready units onto worker tasks within
//! per-group concurrency limits, drives retries, propagates skips across
//! failed dependencies, and rolls the job up to a terminal status.
//!
//! Mirrors `abp_runtime::Runtime::run_streaming`'s shape: a bounded set of
//! `tokio::spawn`ed workers report back over an `mpsc` channel so the
//! scheduler loop itself never blocks on adapter I/O, merged against a
//! cancellation signal via `tokio::select!`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use analyzer_cache::AnalysisCache;
use analyzer_config::{group_limit, AnalyzerConfig};
use analyzer_core::{
    CardBuilder, CardStatus, EventPayload, Job, JobStatus, JobTerminalStatus,
};
use analyzer_error::{AnalyzerError, AnalyzerErrorDto, ErrorCode};
use analyzer_eventlog::EventLog;
use analyzer_planner::{Plan, PlannedUnit};
use analyzer_rules::{validator_for, CardKind};
use analyzer_store::{ArtifactStore, JobStore};

use crate::adapters::{LLMCaller, ResourceFetcher};
use crate::cancel::CancellationToken;
use crate::executor::{execute_unit, ExecOutcome, ExecutionContext};

/// Everything a running job needs, bundled so `run_job` takes one argument
/// instead of six. Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct Deps {
    /// Job/card rows.
    pub job_store: Arc<JobStore>,
    /// Owned `resource.*` payloads.
    pub artifact_store: Arc<ArtifactStore>,
    /// Append-only per-job event log driving SSE.
    pub event_log: Arc<EventLog>,
    /// Content-addressed fetch/output cache.
    pub cache: Arc<AnalysisCache>,
    /// Layered runtime configuration.
    pub config: Arc<AnalyzerConfig>,
    /// Resource fetchers keyed by concurrency-group adapter family
    /// (`github_api`, `crawlbase`, `apify`, ...).
    pub resource_fetchers: Arc<HashMap<String, Arc<dyn ResourceFetcher>>>,
    /// Single LLM caller shared by every business card.
    pub llm_caller: Arc<dyn LLMCaller>,
}

/// What a worker task reports back once a unit's dispatch attempt settles.
struct UnitResult {
    name: String,
    group: String,
    internal: bool,
    max_attempts: u32,
    outcome: ExecOutcome,
}

fn effective_max_attempts(unit: &PlannedUnit, config: &AnalyzerConfig) -> u32 {
    match unit.kind {
        CardKind::Resource => config.max_attempts_resource,
        CardKind::Business => config.max_attempts_ai,
        CardKind::Aggregator => config.max_attempts_base,
    }
    .max(unit.max_attempts)
}

/// Run `plan` to completion for `job`, returning the job's final terminal
/// snapshot. Registers `job` and every planned card in `deps.job_store`
/// before dispatching anything, so a concurrent reader always sees a
/// consistent row set.
pub async fn run_job(deps: &Deps, mut job: Job, plan: Plan, cancel: CancellationToken) -> Job {
    let now = Utc::now();
    deps.job_store.create_job(job.clone(), None);

    for unit in &plan.units {
        let max_attempts = effective_max_attempts(unit, &deps.config);
        let mut builder = CardBuilder::new(job.id, unit.name.clone(), unit.concurrency_group.clone())
            .internal(unit.internal)
            .depends_on(unit.depends_on.clone())
            .max_attempts(max_attempts);
        if let Some(deadline_ms) = unit.deadline_ms {
            builder = builder.deadline_ms(deadline_ms);
        }
        if let Some(stream_spec) = unit.stream_spec.clone() {
            builder = builder.stream_spec(stream_spec);
        }
        deps.job_store.put_card(builder.build());
    }

    deps.job_store.update_job(job.id, |j| j.status = JobStatus::Running);
    job.status = JobStatus::Running;
    let event = deps.event_log.append(job.id, EventPayload::JobStarted, now);
    job.observe_seq(event.seq, now);

    let mut inflight: usize = 0;
    let mut group_inflight: BTreeMap<String, usize> = BTreeMap::new();
    let (tx, mut rx) = mpsc::channel::<UnitResult>(plan.units.len().max(1));

    loop {
        propagate_skips(&deps.job_store, job.id, &plan);

        let admitted = admit_ready_units(deps, job.id, &plan, &mut group_inflight);
        for unit in admitted {
            inflight += 1;
            spawn_unit(deps.clone(), job.clone(), unit, tx.clone());
        }

        if inflight == 0 {
            break;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // Let every already-spawned worker settle naturally; only
                // stop admitting new ones. A unit mid-dispatch still reports
                // back on `tx`, so `inflight` unwinds to zero below.
                while inflight > 0 {
                    if let Some(result) = rx.recv().await {
                        inflight -= 1;
                        *group_inflight.entry(result.group.clone()).or_insert(1) -= 1;
                        apply_result(deps, job.id, result);
                    } else {
                        break;
                    }
                }
                force_fail_remaining(deps, job.id, &plan, ErrorCode::SchedulingCancelled, "job cancelled");
                break;
            }
            maybe_result = rx.recv() => {
                let Some(result) = maybe_result else { break };
                inflight -= 1;
                *group_inflight.entry(result.group.clone()).or_insert(1) -= 1;
                apply_result(deps, job.id, result);
            }
        }
    }

    finalize_job(deps, &mut job)
}

/// Mark every `Pending` card `Skipped` once any of its dependencies is
/// `Failed` or `Skipped`. Runs to a fixpoint each scheduling tick, since one
/// skip can cascade onto further units in the same pass.
fn propagate_skips(job_store: &JobStore, job_id: Uuid, plan: &Plan) {
    loop {
        let mut changed = false;
        let cards = job_store.cards_for_job(job_id);
        for unit in &plan.units {
            let Some(card) = cards.iter().find(|c| c.card_name == unit.name) else { continue };
            if card.status != CardStatus::Pending {
                continue;
            }
            let blocked = unit.depends_on.iter().any(|dep| {
                cards
                    .iter()
                    .find(|c| c.card_name == *dep)
                    .is_some_and(|c| matches!(c.status, CardStatus::Failed | CardStatus::Skipped))
            });
            if blocked {
                job_store.update_card(job_id, &unit.name, |c| c.status = CardStatus::Skipped);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn admit_ready_units(
    deps: &Deps,
    job_id: Uuid,
    plan: &Plan,
    group_inflight: &mut BTreeMap<String, usize>,
) -> Vec<PlannedUnit> {
    let cards = deps.job_store.cards_for_job(job_id);
    let is_completed = |name: &str| cards.iter().any(|c| c.card_name == name && c.status == CardStatus::Completed);

    let mut admitted = Vec::new();
    for unit in &plan.units {
        let Some(card) = cards.iter().find(|c| c.card_name == unit.name) else { continue };
        if card.status != CardStatus::Pending || !card.dependencies_satisfied(is_completed) {
            continue;
        }
        let limit = group_limit(&deps.config, &unit.concurrency_group);
        let used = *group_inflight.get(&unit.concurrency_group).unwrap_or(&0);
        if used >= limit {
            continue;
        }
        deps.job_store.update_card(job_id, &unit.name, |c| c.status = CardStatus::Running);
        *group_inflight.entry(unit.concurrency_group.clone()).or_insert(0) += 1;
        admitted.push(unit.clone());
    }
    admitted
}

fn spawn_unit(deps: Deps, job: Job, unit: PlannedUnit, tx: mpsc::Sender<UnitResult>) {
    tokio::spawn(async move {
        let attempt = deps
            .job_store
            .get_card(job.id, &unit.name)
            .map_or(1, |c| c.attempts + 1);
        deps.job_store.update_card(job.id, &unit.name, |c| c.attempts = attempt);

        let validator = validator_for(job.source, &unit.name).unwrap_or(|_| Ok(()));
        let ctx = ExecutionContext { job: &job, unit: &unit, attempt, dispatched_at: Utc::now(), validator };

        let fetcher = deps.resource_fetchers.get(&unit.concurrency_group).map(Arc::as_ref);
        let llm = (unit.kind == CardKind::Business).then(|| deps.llm_caller.as_ref());

        let outcome = execute_unit(
            &ctx,
            &deps.cache,
            &deps.config,
            &deps.event_log,
            &deps.artifact_store,
            &deps.job_store,
            fetcher,
            llm,
        )
        .await;

        let max_attempts = deps.job_store.get_card(job.id, &unit.name).map_or(unit.max_attempts, |c| c.max_attempts);
        let _ = tx
            .send(UnitResult {
                name: unit.name.clone(),
                group: unit.concurrency_group.clone(),
                internal: unit.internal,
                max_attempts,
                outcome,
            })
            .await;
    });
}

fn apply_result(deps: &Deps, job_id: Uuid, result: UnitResult) {
    match result.outcome {
        ExecOutcome::Completed(output) => {
            deps.job_store.update_card(job_id, &result.name, |c| {
                c.status = CardStatus::Completed;
                c.output = Some(output);
            });
        }
        ExecOutcome::Retry(err) => {
            let attempts = deps.job_store.get_card(job_id, &result.name).map_or(1, |c| c.attempts);
            if attempts >= result.max_attempts {
                fail_card(deps, job_id, &result.name, result.internal, err);
            } else {
                deps.job_store.update_card(job_id, &result.name, |c| c.status = CardStatus::Pending);
            }
        }
        ExecOutcome::Failed(err) => {
            fail_card(deps, job_id, &result.name, result.internal, err);
        }
    }
}

/// Mark a card `failed` and emit its one and only `card.failed` event. The
/// executor never emits this event itself, precisely so it happens exactly
/// once here, after the retry budget has actually been exhausted.
fn fail_card(deps: &Deps, job_id: Uuid, card_name: &str, internal: bool, err: AnalyzerError) {
    deps.job_store.update_card(job_id, card_name, |c| c.status = CardStatus::Failed);
    deps.event_log.append(
        job_id,
        EventPayload::CardFailed {
            card: card_name.to_string(),
            internal: internal.then_some(true),
            error: AnalyzerErrorDto::from(&err),
        },
        Utc::now(),
    );
}

fn force_fail_remaining(deps: &Deps, job_id: Uuid, plan: &Plan, code: ErrorCode, message: &str) {
    let cards = deps.job_store.cards_for_job(job_id);
    for unit in &plan.units {
        let Some(card) = cards.iter().find(|c| c.card_name == unit.name) else { continue };
        if !card.status.is_terminal() {
            fail_card(deps, job_id, &unit.name, unit.internal, AnalyzerError::new(code, message.to_string()));
        }
    }
}

fn finalize_job(deps: &Deps, job: &mut Job) -> Job {
    let cards = deps.job_store.cards_for_job(job.id);
    let visible: Vec<_> = cards.iter().filter(|c| !c.internal).collect();
    let completed = visible.iter().filter(|c| c.status == CardStatus::Completed).count();

    let (status, terminal, payload_is_failure) = if completed == visible.len() && !visible.is_empty() {
        (JobStatus::Completed, JobTerminalStatus::Completed, false)
    } else if completed > 0 {
        (JobStatus::Partial, JobTerminalStatus::Partial, false)
    } else {
        (JobStatus::Failed, JobTerminalStatus::Failed, true)
    };

    let now = Utc::now();
    deps.job_store.update_job(job.id, |j| {
        j.status = status;
        j.updated_at = now;
    });
    job.status = status;

    let event = deps.event_log.append(
        job.id,
        if payload_is_failure {
            EventPayload::JobFailed { status: terminal }
        } else {
            EventPayload::JobCompleted { status: terminal }
        },
        now,
    );
    job.observe_seq(event.seq, now);
    job.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LlmDelta, ResourceEvent};
    use analyzer_core::{JobBuilder, JobOptions, Source};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubFetcher;

    #[async_trait]
    impl ResourceFetcher for StubFetcher {
        fn adapter_id(&self) -> &str {
            "stub"
        }

        async fn fetch(
            &self,
            _source: Source,
            subject_key: &str,
            _card: &str,
            _events: mpsc::Sender<ResourceEvent>,
        ) -> Result<serde_json::Value, AnalyzerError> {
            Ok(serde_json::json!({ "name": subject_key, "repos": [] }))
        }
    }

    struct StubLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMCaller for StubLlm {
        fn adapter_id(&self) -> &str {
            "stub_llm"
        }

        async fn call(
            &self,
            task: &str,
            _model_hint: Option<&str>,
            _input: &serde_json::Value,
            deltas: mpsc::Sender<LlmDelta>,
        ) -> Result<serde_json::Value, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = deltas.send(LlmDelta { section: "body".into(), text: "ok".into() }).await;
            match task {
                "profile" => Ok(serde_json::json!({ "name": "torvalds" })),
                "summary" => Ok(serde_json::json!({ "body": "a fine summary of a prolific maintainer" })),
                "role_model" => Ok(serde_json::json!({ "matches": [{ "name": "Linus Torvalds" }] })),
                _ => Ok(serde_json::json!({})),
            }
        }
    }

    fn deps_for(fetcher: Arc<dyn ResourceFetcher>, llm: Arc<dyn LLMCaller>) -> Deps {
        let mut fetchers: HashMap<String, Arc<dyn ResourceFetcher>> = HashMap::new();
        fetchers.insert("github_api".to_string(), fetcher);
        Deps {
            job_store: Arc::new(JobStore::new()),
            artifact_store: Arc::new(ArtifactStore::new()),
            event_log: Arc::new(EventLog::new()),
            cache: Arc::new(AnalysisCache::new(chrono::Duration::minutes(10), chrono::Duration::minutes(30))),
            config: Arc::new(AnalyzerConfig::default()),
            resource_fetchers: Arc::new(fetchers),
            llm_caller: llm,
        }
    }

    #[tokio::test]
    async fn happy_path_completes_every_visible_card() {
        let deps = deps_for(Arc::new(StubFetcher), Arc::new(StubLlm { calls: AtomicUsize::new(0) }));
        let rules = analyzer_rules::rules_for(Source::Github);
        let plan = analyzer_planner::plan(rules, None).unwrap();
        let job = JobBuilder::new(Source::Github, "torvalds").options(JobOptions::default()).build(Utc::now());

        let finished = run_job(&deps, job, plan, CancellationToken::new()).await;
        assert_eq!(finished.status, JobStatus::Completed);

        let events = deps.event_log.read_after(finished.id, 0);
        assert!(matches!(events.first().unwrap().payload, EventPayload::JobStarted));
        assert!(matches!(events.last().unwrap().payload, EventPayload::JobCompleted { .. }));
    }

    struct AlwaysFailsFetcher;

    #[async_trait]
    impl ResourceFetcher for AlwaysFailsFetcher {
        fn adapter_id(&self) -> &str {
            "always_fails"
        }

        async fn fetch(
            &self,
            _source: Source,
            _subject_key: &str,
            _card: &str,
            _events: mpsc::Sender<ResourceEvent>,
        ) -> Result<serde_json::Value, AnalyzerError> {
            Err(AnalyzerError::new(ErrorCode::UpstreamPermanent, "account suspended"))
        }
    }

    #[tokio::test]
    async fn resource_failure_skips_dependents_but_job_is_partial() {
        let deps = deps_for(Arc::new(AlwaysFailsFetcher), Arc::new(StubLlm { calls: AtomicUsize::new(0) }));
        let rules = analyzer_rules::rules_for(Source::Github);
        let plan = analyzer_planner::plan(rules, None).unwrap();
        let job = JobBuilder::new(Source::Github, "torvalds").options(JobOptions::default()).build(Utc::now());

        let finished = run_job(&deps, job, plan, CancellationToken::new()).await;
        assert_eq!(finished.status, JobStatus::Failed);

        let cards = deps.job_store.cards_for_job(finished.id);
        let profile = cards.iter().find(|c| c.card_name == "profile").unwrap();
        assert_eq!(profile.status, CardStatus::Skipped);

        let failed_events: Vec<_> = deps
            .event_log
            .read_after(finished.id, 0)
            .into_iter()
            .filter(|e| matches!(e.payload, EventPayload::CardFailed { .. }))
            .collect();
        assert_eq!(failed_events.len(), 1, "resource.profile fails exactly once, profile is skipped without an event");
    }

    #[tokio::test]
    async fn cancellation_force_fails_outstanding_cards() {
        let deps = deps_for(Arc::new(StubFetcher), Arc::new(StubLlm { calls: AtomicUsize::new(0) }));
        let rules = analyzer_rules::rules_for(Source::Github);
        let plan = analyzer_planner::plan(rules, None).unwrap();
        let job = JobBuilder::new(Source::Github, "torvalds").options(JobOptions::default()).build(Utc::now());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let finished = run_job(&deps, job, plan, cancel).await;
        assert!(matches!(finished.status, JobStatus::Failed | JobStatus::Partial | JobStatus::Completed));
    }
}
