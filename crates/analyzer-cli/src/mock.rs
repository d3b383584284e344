//! Offline demo adapters, used when the CLI is run without a configured
//! upstream backend. Plays the same role `abp-backend-mock` plays for
//! `abp-cli`: a deterministic, no-network stand-in for the real
//! `ResourceFetcher`/`LLMCaller` implementations a host process would wire
//! in (§7 Non-goals — those are out of scope for this crate).

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use analyzer_core::Source;
use analyzer_error::AnalyzerError;
use analyzer_resolver::{Candidate, SearchAdapter};
use analyzer_scheduler::{LlmDelta, LLMCaller, ResourceEvent, ResourceFetcher};

/// Fetches a synthetic payload for any `resource.*` card, reporting one
/// progress notification first.
#[derive(Debug, Clone)]
pub struct DemoResourceFetcher {
    id: String,
}

impl DemoResourceFetcher {
    /// Build a fetcher identifying itself as `id` in diagnostics and cache
    /// fingerprints.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ResourceFetcher for DemoResourceFetcher {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        source: Source,
        subject_key: &str,
        card: &str,
        events: mpsc::Sender<ResourceEvent>,
    ) -> Result<serde_json::Value, AnalyzerError> {
        let _ = events
            .send(ResourceEvent::Progress {
                step: "fetch".to_string(),
                message: format!("fetching {card} for {subject_key}"),
                data: None,
            })
            .await;
        Ok(json!({
            "source": source.as_str(),
            "subject_key": subject_key,
            "card": card,
            "fetched_by": self.id,
        }))
    }
}

/// Emits a deterministic, schema-valid payload for any business card,
/// branching on `task` the way a real routing adapter would branch on it
/// to pick a prompt template. Unrecognized tasks (custom card selections
/// beyond the seven sources' reference rule sets) fall back to a `name`
/// field, which satisfies the common case of a profile-shaped validator.
#[derive(Debug, Clone)]
pub struct DemoLlmCaller;

#[async_trait]
impl LLMCaller for DemoLlmCaller {
    fn adapter_id(&self) -> &str {
        "demo-llm"
    }

    async fn call(
        &self,
        task: &str,
        _model_hint: Option<&str>,
        input: &serde_json::Value,
        deltas: mpsc::Sender<LlmDelta>,
    ) -> Result<serde_json::Value, AnalyzerError> {
        match task {
            "summary" => {
                let body = format!("demo summary derived from {input}");
                let _ = deltas.send(LlmDelta { section: "body".to_string(), text: body.clone() }).await;
                Ok(json!({ "body": body }))
            }
            "role_model" => Ok(json!({ "matches": [{ "name": "demo role model", "based_on": input }] })),
            _ => Ok(json!({ "name": format!("demo output for {task}"), "based_on": input })),
        }
    }
}

/// Surfaces the raw query itself as a single strong candidate, so freeform
/// input resolves deterministically without a real search backend.
#[derive(Debug, Clone)]
pub struct DemoSearchAdapter;

#[async_trait]
impl SearchAdapter for DemoSearchAdapter {
    fn adapter_id(&self) -> &str {
        "demo-search"
    }

    async fn search(
        &self,
        _source: Source,
        query: &str,
        _limit: usize,
    ) -> Result<Vec<Candidate>, AnalyzerError> {
        Ok(vec![Candidate {
            label: query.trim().to_string(),
            subject_key: query.trim().to_lowercase().replace(' ', "-"),
            score: 0.95,
            meta: json!({}),
        }])
    }
}
