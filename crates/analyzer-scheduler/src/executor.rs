// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Executor (§4.4): cache probe, deadline check, dispatch by card
//! kind, validation, cache write — in that order, for a single dispatch
//! attempt of a single unit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use analyzer_cache::{card_output_fingerprint, AnalysisCache};
use analyzer_config::AnalyzerConfig;
use analyzer_core::{
    Artifact, CacheDisposition, CacheNamespace, CacheReadDisposition, CardOutput, EventPayload, Job, StreamSpec,
};
use analyzer_error::{AnalyzerError, ErrorCode};
use analyzer_eventlog::EventLog;
use analyzer_planner::PlannedUnit;
use analyzer_rules::{CardKind, ValidatorFn};
use analyzer_store::{ArtifactStore, JobStore};

use crate::adapters::{LLMCaller, LlmDelta, ResourceEvent, ResourceFetcher};
use crate::delta::DeltaBatcher;

/// Everything the executor needs to run one attempt of one unit, besides
/// the shared stores/adapters passed alongside it.
pub struct ExecutionContext<'a> {
    /// The job this unit belongs to.
    pub job: &'a Job,
    /// The planned unit being dispatched.
    pub unit: &'a PlannedUnit,
    /// 1-based attempt number for this dispatch.
    pub attempt: u32,
    /// The instant this attempt was dispatched, used for both the soft
    /// deadline check and every event timestamp this attempt produces.
    pub dispatched_at: DateTime<Utc>,
    /// The card's registered validator.
    pub validator: ValidatorFn,
}

/// Outcome of one execution attempt, classified for the scheduler's retry
/// policy. Terminal success (`card.prefill`+`card.completed`) is always
/// appended by the executor itself; terminal failure (`card.failed`) is
/// appended by the scheduler once it has decided the retry budget is
/// exhausted, so that exactly one `card.failed` is ever emitted per card.
pub enum ExecOutcome {
    /// The unit finished successfully: live dispatch, cache hit, or
    /// deadline fallback.
    Completed(CardOutput),
    /// This attempt failed in a way not worth retrying (permanent upstream
    /// failure, internal invariant violation, or a fallback payload that
    /// itself failed validation).
    Failed(AnalyzerError),
    /// This attempt failed in a way that may succeed on a later attempt
    /// (transient upstream error, validator rejection of a live or cached
    /// payload).
    Retry(AnalyzerError),
}

fn namespace_for(kind: CardKind) -> CacheNamespace {
    match kind {
        CardKind::Resource => CacheNamespace::UpstreamFetch,
        CardKind::Business | CardKind::Aggregator => CacheNamespace::CardOutput,
    }
}

/// Resolve a card's `fingerprint_option_keys` whitelist against the job's
/// actual option values. Deliberately never consults `force_refresh` —
/// that option is never whitelisted by any reference rule (enforced by
/// `analyzer_rules`'s own tests).
fn relevant_options(job: &Job, keys: &[&'static str]) -> Vec<(&'static str, String)> {
    keys.iter()
        .map(|&key| {
            let value = match key {
                "freeform" => job.options.freeform,
                "allow_ambiguous" => job.options.allow_ambiguous,
                _ => false,
            };
            (key, value.to_string())
        })
        .collect()
}

/// Gather the already-computed outputs of `unit`'s dependencies: the raw
/// artifact for a `resource.*` dependency, or the stored card output for a
/// business-card dependency. Used to build LLM input, aggregator payloads,
/// and deadline-fallback artifacts alike — all three need the same "what
/// do we already know" view.
fn gather_dependency_inputs(
    unit: &PlannedUnit,
    job_id: Uuid,
    artifact_store: &ArtifactStore,
    job_store: &JobStore,
) -> BTreeMap<String, serde_json::Value> {
    let mut map = BTreeMap::new();
    for dep in &unit.depends_on {
        if let Some(artifact) = artifact_store.get(job_id, dep) {
            if let Ok(value) = artifact.as_json::<serde_json::Value>() {
                map.insert(dep.clone(), value);
            }
        } else if let Some(card) = job_store.get_card(job_id, dep) {
            if let Some(output) = card.output {
                map.insert(dep.clone(), output.data);
            }
        }
    }
    map
}

/// Run one dispatch attempt of `ctx.unit` to completion.
pub async fn execute_unit(
    ctx: &ExecutionContext<'_>,
    cache: &AnalysisCache,
    config: &AnalyzerConfig,
    event_log: &EventLog,
    artifact_store: &ArtifactStore,
    job_store: &JobStore,
    fetcher: Option<&dyn ResourceFetcher>,
    llm_caller: Option<&dyn LLMCaller>,
) -> ExecOutcome {
    let job = ctx.job;
    let unit = ctx.unit;
    let now = ctx.dispatched_at;

    if ctx.attempt == 1 {
        event_log.append(
            job.id,
            EventPayload::CardStarted {
                card: unit.name.clone(),
                status: "running".to_string(),
                internal: unit.internal.then_some(true),
                stream: unit.stream_spec.clone(),
            },
            now,
        );
    }

    let owned_options = relevant_options(job, unit.fingerprint_option_keys);
    let options: Vec<(&str, &str)> = owned_options.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let fp = card_output_fingerprint(job.source.as_str(), &unit.name, &job.subject_key, &options);
    let namespace = namespace_for(unit.kind);

    if !job.options.force_refresh {
        if let Some((entry, disposition)) = cache.get(namespace, &fp, now) {
            match (ctx.validator)(&entry.payload) {
                Ok(()) => {
                    let output = CardOutput { data: entry.payload.clone(), stream: None };
                    event_log.append(
                        job.id,
                        EventPayload::CardPrefill {
                            card: unit.name.clone(),
                            payload: output.clone(),
                            cache: CacheDisposition {
                                hit: true,
                                stale: disposition == CacheReadDisposition::Stale,
                                as_of: entry.created_at,
                                fingerprint: Some(fp.clone()),
                            },
                        },
                        now,
                    );
                    event_log.append(
                        job.id,
                        EventPayload::CardCompleted {
                            card: unit.name.clone(),
                            payload: output.clone(),
                            internal: unit.internal.then_some(true),
                        },
                        now,
                    );
                    return ExecOutcome::Completed(output);
                }
                Err(reason) => {
                    // Stale-and-invalid, and fresh-and-invalid alike: the
                    // decided Open Question treats an invalid read as a
                    // miss. Invalidate so no future job reuses it.
                    cache.invalidate(namespace, &fp);
                    return ExecOutcome::Retry(
                        AnalyzerError::new(ErrorCode::ValidatorRejected, reason)
                            .with_context("card", unit.name.clone())
                            .with_context("cache_disposition", format!("{disposition:?}")),
                    );
                }
            }
        }
    }

    if let Some(deadline_ms) = unit.deadline_ms {
        let age_ms = u64::try_from((now - job.created_at).num_milliseconds().max(0)).unwrap_or(u64::MAX);
        if age_ms > deadline_ms {
            return run_fallback(ctx, cache, event_log, artifact_store, job_store, &fp, namespace);
        }
    }

    let dispatch_result = match unit.kind {
        CardKind::Resource => dispatch_resource(ctx, event_log, artifact_store, fetcher).await,
        CardKind::Business => dispatch_business(ctx, config, event_log, artifact_store, job_store, llm_caller).await,
        CardKind::Aggregator => dispatch_aggregator(unit, job.id, artifact_store, job_store),
    };

    let (data, stream) = match dispatch_result {
        Ok(pair) => pair,
        Err(err) => {
            return if err.retryable() { ExecOutcome::Retry(err) } else { ExecOutcome::Failed(err) };
        }
    };

    match (ctx.validator)(&data) {
        Ok(()) => {
            cache.put(namespace, fp, data.clone(), now);
            let output = CardOutput { data, stream };
            event_log.append(
                job.id,
                EventPayload::CardCompleted {
                    card: unit.name.clone(),
                    payload: output.clone(),
                    internal: unit.internal.then_some(true),
                },
                now,
            );
            ExecOutcome::Completed(output)
        }
        Err(reason) => ExecOutcome::Retry(
            AnalyzerError::new(ErrorCode::ValidatorRejected, reason).with_context("card", unit.name.clone()),
        ),
    }
}

fn emit_resource_event(event_log: &EventLog, job_id: Uuid, card: &str, ev: ResourceEvent, now: DateTime<Utc>) {
    let payload = match ev {
        ResourceEvent::Progress { step, message, data } => {
            EventPayload::CardProgress { card: card.to_string(), step, message, data }
        }
        ResourceEvent::Append { path, items, dedup_key, cursor, partial } => {
            EventPayload::CardAppend { card: card.to_string(), path, items, dedup_key, cursor, partial }
        }
    };
    event_log.append(job_id, payload, now);
}

async fn dispatch_resource(
    ctx: &ExecutionContext<'_>,
    event_log: &EventLog,
    artifact_store: &ArtifactStore,
    fetcher: Option<&dyn ResourceFetcher>,
) -> Result<(serde_json::Value, Option<String>), AnalyzerError> {
    let job = ctx.job;
    let unit = ctx.unit;
    let fetcher = fetcher.ok_or_else(|| {
        AnalyzerError::new(ErrorCode::InternalInvariantViolation, "no ResourceFetcher configured for a resource card")
            .with_context("card", unit.name.clone())
    })?;

    let (tx, mut rx) = mpsc::channel(64);
    let fetch_fut = fetcher.fetch(job.source, &job.subject_key, &unit.name, tx);
    tokio::pin!(fetch_fut);

    let mut result: Option<Result<serde_json::Value, AnalyzerError>> = None;
    loop {
        tokio::select! {
            r = &mut fetch_fut, if result.is_none() => {
                result = Some(r);
            }
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => emit_resource_event(event_log, job.id, &unit.name, ev, ctx.dispatched_at),
                    None if result.is_some() => break,
                    None => {}
                }
            }
        }
        if result.is_some() {
            while let Ok(ev) = rx.try_recv() {
                emit_resource_event(event_log, job.id, &unit.name, ev, ctx.dispatched_at);
            }
            break;
        }
    }

    let value = result.expect("loop only exits once the fetch future has resolved")?;
    let artifact = Artifact::from_json(job.id, unit.name.clone(), &value, ctx.dispatched_at).map_err(|e| {
        AnalyzerError::new(ErrorCode::InternalInvariantViolation, "resource payload could not be serialized")
            .with_context("card", unit.name.clone())
            .with_source(e)
    })?;
    artifact_store.put(artifact);
    Ok((value, None))
}

fn handle_llm_delta(
    event_log: &EventLog,
    job_id: Uuid,
    card: &str,
    spec: &StreamSpec,
    batcher: &mut DeltaBatcher,
    accumulated: &mut String,
    delta: LlmDelta,
    now: DateTime<Utc>,
) {
    accumulated.push_str(&delta.text);
    if let Some(batch) = batcher.push(&delta.section, &delta.text) {
        event_log.append(
            job_id,
            EventPayload::CardDelta {
                card: card.to_string(),
                field: spec.field.clone(),
                section: delta.section,
                format: spec.format.clone(),
                delta: batch,
            },
            now,
        );
    }
}

async fn dispatch_business(
    ctx: &ExecutionContext<'_>,
    config: &AnalyzerConfig,
    event_log: &EventLog,
    artifact_store: &ArtifactStore,
    job_store: &JobStore,
    llm_caller: Option<&dyn LLMCaller>,
) -> Result<(serde_json::Value, Option<String>), AnalyzerError> {
    let job = ctx.job;
    let unit = ctx.unit;
    let llm_caller = llm_caller.ok_or_else(|| {
        AnalyzerError::new(ErrorCode::InternalInvariantViolation, "no LLMCaller configured for a business card")
            .with_context("card", unit.name.clone())
    })?;

    let input_map = gather_dependency_inputs(unit, job.id, artifact_store, job_store);
    let input = serde_json::to_value(&input_map).unwrap_or(serde_json::Value::Null);

    let (tx, mut rx) = mpsc::channel::<LlmDelta>(64);
    let call_fut = llm_caller.call(&unit.name, None, &input, tx);
    tokio::pin!(call_fut);

    let mut batcher = DeltaBatcher::new(config.delta_flush_bytes, config.delta_flush_interval_ms);
    let mut accumulated = String::new();
    let mut result: Option<Result<serde_json::Value, AnalyzerError>> = None;
    loop {
        tokio::select! {
            r = &mut call_fut, if result.is_none() => {
                result = Some(r);
            }
            maybe_delta = rx.recv() => {
                match maybe_delta {
                    Some(delta) => {
                        if let Some(spec) = &unit.stream_spec {
                            handle_llm_delta(event_log, job.id, &unit.name, spec, &mut batcher, &mut accumulated, delta, ctx.dispatched_at);
                        }
                    }
                    None if result.is_some() => break,
                    None => {}
                }
            }
        }
        if result.is_some() {
            while let Ok(delta) = rx.try_recv() {
                if let Some(spec) = &unit.stream_spec {
                    handle_llm_delta(event_log, job.id, &unit.name, spec, &mut batcher, &mut accumulated, delta, ctx.dispatched_at);
                }
            }
            break;
        }
    }

    let value = result.expect("loop only exits once the call future has resolved")?;

    let stream = unit.stream_spec.as_ref().map(|spec| {
        for (section, text) in batcher.flush_all() {
            event_log.append(
                job.id,
                EventPayload::CardDelta {
                    card: unit.name.clone(),
                    field: spec.field.clone(),
                    section,
                    format: spec.format.clone(),
                    delta: text,
                },
                ctx.dispatched_at,
            );
        }
        accumulated
    });

    Ok((value, stream))
}

fn dispatch_aggregator(
    unit: &PlannedUnit,
    job_id: Uuid,
    artifact_store: &ArtifactStore,
    job_store: &JobStore,
) -> Result<(serde_json::Value, Option<String>), AnalyzerError> {
    let merged = gather_dependency_inputs(unit, job_id, artifact_store, job_store);
    Ok((serde_json::to_value(merged).unwrap_or_else(|_| serde_json::json!({})), None))
}

fn run_fallback(
    ctx: &ExecutionContext<'_>,
    cache: &AnalysisCache,
    event_log: &EventLog,
    artifact_store: &ArtifactStore,
    job_store: &JobStore,
    fp: &str,
    namespace: CacheNamespace,
) -> ExecOutcome {
    let job = ctx.job;
    let unit = ctx.unit;
    let Some(fallback) = unit.fallback else {
        return ExecOutcome::Failed(
            AnalyzerError::new(
                ErrorCode::InternalInvariantViolation,
                "deadline exceeded but card declares no fallback",
            )
            .with_context("card", unit.name.clone()),
        );
    };

    let artifacts = gather_dependency_inputs(unit, job.id, artifact_store, job_store);
    let payload = fallback(&job.subject_key, &artifacts);

    match (ctx.validator)(&payload) {
        Ok(()) => {
            cache.put(namespace, fp.to_string(), payload.clone(), ctx.dispatched_at);
            let output = CardOutput { data: payload, stream: None };
            event_log.append(
                job.id,
                EventPayload::CardCompleted {
                    card: unit.name.clone(),
                    payload: output.clone(),
                    internal: unit.internal.then_some(true),
                },
                ctx.dispatched_at,
            );
            ExecOutcome::Completed(output)
        }
        Err(reason) => ExecOutcome::Failed(
            AnalyzerError::new(ErrorCode::ValidatorRejected, format!("deadline fallback payload rejected: {reason}"))
                .with_context("card", unit.name.clone()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyzer_core::{JobBuilder, JobOptions, Source};
    use analyzer_rules::validator_for;
    use chrono::Duration;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkFetcher;

    #[async_trait::async_trait]
    impl ResourceFetcher for OkFetcher {
        fn adapter_id(&self) -> &str {
            "fake_fetcher"
        }

        async fn fetch(
            &self,
            _source: Source,
            subject_key: &str,
            _card: &str,
            events: mpsc::Sender<ResourceEvent>,
        ) -> Result<serde_json::Value, AnalyzerError> {
            let _ = events
                .send(ResourceEvent::Progress { step: "fetch".into(), message: "working".into(), data: None })
                .await;
            Ok(serde_json::json!({ "name": subject_key }))
        }
    }

    struct FailingFetcher;

    #[async_trait::async_trait]
    impl ResourceFetcher for FailingFetcher {
        fn adapter_id(&self) -> &str {
            "failing_fetcher"
        }

        async fn fetch(
            &self,
            _source: Source,
            _subject_key: &str,
            _card: &str,
            _events: mpsc::Sender<ResourceEvent>,
        ) -> Result<serde_json::Value, AnalyzerError> {
            Err(AnalyzerError::new(ErrorCode::UpstreamPermanent, "404"))
        }
    }

    fn unit(name: &str, kind: CardKind, deadline_ms: Option<u64>, fallback: Option<analyzer_rules::FallbackFn>) -> PlannedUnit {
        PlannedUnit {
            name: name.to_string(),
            kind,
            internal: kind == CardKind::Resource,
            depends_on: BTreeSet::new(),
            concurrency_group: "github_api".to_string(),
            deadline_ms,
            max_attempts: 2,
            stream_spec: None,
            fallback,
            fingerprint_option_keys: &[],
        }
    }

    fn job(now: DateTime<Utc>) -> Job {
        JobBuilder::new(Source::Github, "torvalds").options(JobOptions::default()).build(now)
    }

    #[tokio::test]
    async fn resource_card_fetches_validates_and_caches() {
        let now = Utc::now();
        let j = job(now);
        let u = unit("resource.profile", CardKind::Resource, None, None);
        let ctx = ExecutionContext { job: &j, unit: &u, attempt: 1, dispatched_at: now, validator: validator_for(j.source, "resource.profile").unwrap() };

        let cache = AnalysisCache::new(Duration::minutes(10), Duration::minutes(30));
        let config = AnalyzerConfig::default();
        let event_log = EventLog::new();
        let artifact_store = ArtifactStore::new();
        let job_store = JobStore::new();
        let fetcher = OkFetcher;

        let outcome = execute_unit(&ctx, &cache, &config, &event_log, &artifact_store, &job_store, Some(&fetcher), None).await;
        assert!(matches!(outcome, ExecOutcome::Completed(_)));
        assert!(artifact_store.get(j.id, "resource.profile").is_some());
        assert_eq!(cache.len(), 1);

        let events = event_log.read_after(j.id, 0);
        assert!(events.iter().any(|e| matches!(e.payload, EventPayload::CardStarted { .. })));
        assert!(events.iter().any(|e| matches!(e.payload, EventPayload::CardCompleted { .. })));
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_the_fetcher() {
        let now = Utc::now();
        let j = job(now);
        let u = unit("resource.profile", CardKind::Resource, None, None);
        let cache = AnalysisCache::new(Duration::minutes(10), Duration::minutes(30));
        let options: Vec<(&str, &str)> = vec![];
        let fp = card_output_fingerprint(j.source.as_str(), "resource.profile", &j.subject_key, &options);
        cache.put(CacheNamespace::UpstreamFetch, fp, serde_json::json!({"name": "cached"}), now);

        let config = AnalyzerConfig::default();
        let event_log = EventLog::new();
        let artifact_store = ArtifactStore::new();
        let job_store = JobStore::new();
        let fetcher = FailingFetcher;
        let ctx = ExecutionContext { job: &j, unit: &u, attempt: 1, dispatched_at: now, validator: validator_for(j.source, "resource.profile").unwrap() };

        let outcome = execute_unit(&ctx, &cache, &config, &event_log, &artifact_store, &job_store, Some(&fetcher), None).await;
        match outcome {
            ExecOutcome::Completed(output) => assert_eq!(output.data["name"], "cached"),
            _ => panic!("expected a cache hit to complete without calling the fetcher"),
        }
    }

    #[tokio::test]
    async fn upstream_permanent_failure_is_not_retryable() {
        let now = Utc::now();
        let j = job(now);
        let u = unit("resource.profile", CardKind::Resource, None, None);
        let cache = AnalysisCache::new(Duration::minutes(10), Duration::minutes(30));
        let config = AnalyzerConfig::default();
        let event_log = EventLog::new();
        let artifact_store = ArtifactStore::new();
        let job_store = JobStore::new();
        let fetcher = FailingFetcher;
        let ctx = ExecutionContext { job: &j, unit: &u, attempt: 1, dispatched_at: now, validator: validator_for(j.source, "resource.profile").unwrap() };

        let outcome = execute_unit(&ctx, &cache, &config, &event_log, &artifact_store, &job_store, Some(&fetcher), None).await;
        assert!(matches!(outcome, ExecOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn deadline_exceeded_runs_the_fallback_and_completes() {
        let now = Utc::now();
        let j = job(now - Duration::seconds(20));
        fn fallback(subject_key: &str, _artifacts: &BTreeMap<String, serde_json::Value>) -> serde_json::Value {
            serde_json::json!({ "name": subject_key, "degraded": true })
        }
        let u = unit("profile", CardKind::Business, Some(10_000), Some(fallback));
        let cache = AnalysisCache::new(Duration::minutes(10), Duration::minutes(30));
        let config = AnalyzerConfig::default();
        let event_log = EventLog::new();
        let artifact_store = ArtifactStore::new();
        let job_store = JobStore::new();
        let ctx = ExecutionContext { job: &j, unit: &u, attempt: 1, dispatched_at: now, validator: validator_for(j.source, "profile").unwrap() };

        let outcome = execute_unit(&ctx, &cache, &config, &event_log, &artifact_store, &job_store, None, None).await;
        match outcome {
            ExecOutcome::Completed(output) => assert_eq!(output.data["degraded"], true),
            _ => panic!("expected the deadline fallback to complete the card"),
        }
    }

    #[tokio::test]
    async fn aggregator_merges_completed_dependency_outputs() {
        let now = Utc::now();
        let j = job(now);
        let job_store = JobStore::new();
        let mut deps = BTreeSet::new();
        deps.insert("profile".to_string());
        deps.insert("summary".to_string());
        let mut u = unit("full_report", CardKind::Aggregator, None, None);
        u.depends_on = deps;

        let mut profile = analyzer_core::CardBuilder::new(j.id, "profile", "llm").build();
        profile.output = Some(CardOutput { data: serde_json::json!({"name": "torvalds"}), stream: None });
        job_store.put_card(profile);
        // "summary" deliberately left unwritten: a failed/skipped dependency
        // is simply absent from the merged payload.

        let artifact_store = ArtifactStore::new();
        let cache = AnalysisCache::new(Duration::minutes(10), Duration::minutes(30));
        let config = AnalyzerConfig::default();
        let event_log = EventLog::new();
        let ctx = ExecutionContext { job: &j, unit: &u, attempt: 1, dispatched_at: now, validator: validator_for(j.source, "full_report").unwrap() };

        let outcome = execute_unit(&ctx, &cache, &config, &event_log, &artifact_store, &job_store, None, None).await;
        match outcome {
            ExecOutcome::Completed(output) => {
                assert_eq!(output.data["profile"]["name"], "torvalds");
                assert!(output.data.get("summary").is_none());
            }
            _ => panic!("expected the aggregator to complete"),
        }
    }

    struct StreamingCaller {
        chunks: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LLMCaller for StreamingCaller {
        fn adapter_id(&self) -> &str {
            "fake_llm"
        }

        async fn call(
            &self,
            _task: &str,
            _model_hint: Option<&str>,
            _input: &serde_json::Value,
            deltas: mpsc::Sender<LlmDelta>,
        ) -> Result<serde_json::Value, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut body = String::new();
            for chunk in &self.chunks {
                body.push_str(chunk);
                let _ = deltas.send(LlmDelta { section: "body".into(), text: (*chunk).to_string() }).await;
            }
            Ok(serde_json::json!({ "body": body }))
        }
    }

    #[tokio::test]
    async fn streaming_business_card_accumulates_and_emits_deltas() {
        let now = Utc::now();
        let j = job(now);
        let mut u = unit("summary", CardKind::Business, Some(10_000), None);
        u.stream_spec = Some(StreamSpec { field: "body".into(), format: "markdown".into(), sections: vec!["body".into()] });

        let cache = AnalysisCache::new(Duration::minutes(10), Duration::minutes(30));
        let mut config = AnalyzerConfig::default();
        config.delta_flush_bytes = 2;
        let event_log = EventLog::new();
        let artifact_store = ArtifactStore::new();
        let job_store = JobStore::new();
        let caller = StreamingCaller { chunks: vec!["hel", "lo "], calls: AtomicUsize::new(0) };
        let ctx = ExecutionContext { job: &j, unit: &u, attempt: 1, dispatched_at: now, validator: validator_for(j.source, "summary").unwrap() };

        let outcome = execute_unit(&ctx, &cache, &config, &event_log, &artifact_store, &job_store, None, Some(&caller)).await;
        match outcome {
            ExecOutcome::Completed(output) => {
                assert_eq!(output.stream.as_deref(), Some("hello "));
            }
            _ => panic!("expected the streaming card to complete"),
        }
        assert_eq!(caller.calls.load(Ordering::SeqCst), 1);
        let deltas: Vec<_> = event_log
            .read_after(j.id, 0)
            .into_iter()
            .filter(|e| matches!(e.payload, EventPayload::CardDelta { .. }))
            .collect();
        assert!(!deltas.is_empty());
    }

    struct PaginatedFetcher;

    #[async_trait::async_trait]
    impl ResourceFetcher for PaginatedFetcher {
        fn adapter_id(&self) -> &str {
            "paginated_fetcher"
        }

        async fn fetch(
            &self,
            _source: Source,
            _subject_key: &str,
            _card: &str,
            events: mpsc::Sender<ResourceEvent>,
        ) -> Result<serde_json::Value, AnalyzerError> {
            let pages = [
                vec![serde_json::json!({"id": "p1"}), serde_json::json!({"id": "p2"})],
                vec![serde_json::json!({"id": "p3"})],
                vec![serde_json::json!({"id": "p2"})],
            ];
            let mut merged: Vec<serde_json::Value> = Vec::new();
            let mut seen: BTreeSet<String> = BTreeSet::new();
            for (i, page) in pages.into_iter().enumerate() {
                let _ = events
                    .send(ResourceEvent::Append {
                        path: "papers".into(),
                        items: page.clone(),
                        dedup_key: "id".into(),
                        cursor: None,
                        partial: Some(i < 2),
                    })
                    .await;
                for item in page {
                    let key = item["id"].as_str().unwrap().to_string();
                    if seen.insert(key) {
                        merged.push(item);
                    }
                }
            }
            Ok(serde_json::json!({ "papers": merged }))
        }
    }

    #[tokio::test]
    async fn append_events_union_by_dedup_key_matches_the_completed_payload() {
        let now = Utc::now();
        let j = job(now);
        let u = unit("resource.profile", CardKind::Resource, None, None);
        let cache = AnalysisCache::new(Duration::minutes(10), Duration::minutes(30));
        let config = AnalyzerConfig::default();
        let event_log = EventLog::new();
        let artifact_store = ArtifactStore::new();
        let job_store = JobStore::new();
        let fetcher = PaginatedFetcher;
        let ctx = ExecutionContext { job: &j, unit: &u, attempt: 1, dispatched_at: now, validator: validator_for(j.source, "resource.profile").unwrap() };

        let outcome = execute_unit(&ctx, &cache, &config, &event_log, &artifact_store, &job_store, Some(&fetcher), None).await;

        let appended: Vec<serde_json::Value> = event_log
            .read_after(j.id, 0)
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::CardAppend { items, dedup_key, .. } => {
                    assert_eq!(dedup_key, "id");
                    Some(items)
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(appended.len(), 4, "three pages carrying 2+1+1 raw items, disjoint before dedup");

        let mut union: BTreeSet<String> =
            appended.iter().map(|item| item["id"].as_str().unwrap().to_string()).collect();
        assert_eq!(union.len(), 3, "p2 appears on two pages; the union dedups by id");

        match outcome {
            ExecOutcome::Completed(output) => {
                let completed: BTreeSet<String> = output.data["papers"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|item| item["id"].as_str().unwrap().to_string())
                    .collect();
                assert_eq!(completed, union.drain().collect());
            }
            _ => panic!("expected the paginated resource card to complete"),
        }
    }
}
