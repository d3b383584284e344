// SPDX-License-Identifier: MIT OR Apache-2.0
//! JobStore and ArtifactStore: the job/card rows and the owned artifact
//! blobs named in §3 and the persisted state layout in §6.
//!
//! Both stores are in-memory and process-local, matching the non-goal of
//! cross-machine coordination — a job is owned by a single process. The
//! row shapes mirror a four-table layout: `jobs`, `job_cards`,
//! `job_events` (owned by `analyzer-eventlog`), and `artifacts`; a durable
//! backend can be substituted behind the same API without the scheduler
//! or executor noticing.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use analyzer_core::{Artifact, Card, Job};

/// Job + card rows: status, seq counters, input, options, timestamps.
pub struct JobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    cards: Mutex<HashMap<(Uuid, String), Card>>,
    /// idempotency_key -> (job_id, sha256 of the request body used to create it)
    idempotency: Mutex<HashMap<String, (Uuid, String)>>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            cards: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    /// Hash a request body for idempotency comparison (not a security
    /// primitive — just a cheap equality fingerprint).
    #[must_use]
    pub fn hash_body(body: &impl serde::Serialize) -> String {
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        format!("{:x}", Sha256::digest(bytes))
    }

    /// Resolve an idempotency key against a previously created job.
    ///
    /// Returns `Some(job_id)` if this exact key was used before with a
    /// matching body hash (an idempotent replay, invariant 6 in §8).
    /// Returns `None` if the key is new, or if it was previously used with
    /// a *different* body — in the latter case the caller proceeds to
    /// create a new job as if no key had been supplied, since the
    /// specification does not define conflicting-body semantics.
    #[must_use]
    pub fn resolve_idempotent(&self, key: &str, body_hash: &str) -> Option<Uuid> {
        let table = self.idempotency.lock().expect("idempotency mutex poisoned");
        table.get(key).and_then(|(job_id, hash)| (hash == body_hash).then_some(*job_id))
    }

    /// Register a new job (and, if present, its idempotency key).
    pub fn create_job(&self, job: Job, body_hash: Option<&str>) {
        if let (Some(key), Some(hash)) = (job.idempotency_key.clone(), body_hash) {
            self.idempotency
                .lock()
                .expect("idempotency mutex poisoned")
                .insert(key, (job.id, hash.to_string()));
        }
        self.jobs.lock().expect("job store mutex poisoned").insert(job.id, job);
    }

    /// Fetch a job by id.
    #[must_use]
    pub fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().expect("job store mutex poisoned").get(&job_id).cloned()
    }

    /// Apply `f` to the stored job, if present. Used by the scheduler to
    /// advance `status`/`last_seq`/`updated_at`.
    pub fn update_job(&self, job_id: Uuid, f: impl FnOnce(&mut Job)) -> Option<()> {
        let mut jobs = self.jobs.lock().expect("job store mutex poisoned");
        let job = jobs.get_mut(&job_id)?;
        f(job);
        Some(())
    }

    /// Insert or replace a card row.
    pub fn put_card(&self, card: Card) {
        let key = (card.job_id, card.card_name.clone());
        self.cards.lock().expect("card store mutex poisoned").insert(key, card);
    }

    /// Fetch a single card.
    #[must_use]
    pub fn get_card(&self, job_id: Uuid, card_name: &str) -> Option<Card> {
        self.cards
            .lock()
            .expect("card store mutex poisoned")
            .get(&(job_id, card_name.to_string()))
            .cloned()
    }

    /// Apply `f` to a stored card, if present.
    pub fn update_card(&self, job_id: Uuid, card_name: &str, f: impl FnOnce(&mut Card)) -> Option<()> {
        let mut cards = self.cards.lock().expect("card store mutex poisoned");
        let card = cards.get_mut(&(job_id, card_name.to_string()))?;
        f(card);
        Some(())
    }

    /// All cards belonging to a job, unordered.
    #[must_use]
    pub fn cards_for_job(&self, job_id: Uuid) -> Vec<Card> {
        self.cards
            .lock()
            .expect("card store mutex poisoned")
            .values()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect()
    }
}

/// Opaque blob store for `resource.*` outputs, keyed by `(job, card)`.
pub struct ArtifactStore {
    blobs: Mutex<HashMap<(Uuid, String), Artifact>>,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { blobs: Mutex::new(HashMap::new()) }
    }

    /// Write (or overwrite) an artifact.
    pub fn put(&self, artifact: Artifact) {
        let key = (artifact.job_id, artifact.card_name.clone());
        self.blobs.lock().expect("artifact store mutex poisoned").insert(key, artifact);
    }

    /// Read an artifact by `(job, card)`.
    #[must_use]
    pub fn get(&self, job_id: Uuid, card_name: &str) -> Option<Artifact> {
        self.blobs
            .lock()
            .expect("artifact store mutex poisoned")
            .get(&(job_id, card_name.to_string()))
            .cloned()
    }

    /// Drop every artifact belonging to `job_id`. Callers are responsible
    /// for only calling this once the job and all of its dependents are
    /// terminal, per the artifact lifetime rule in §3.
    pub fn evict_job(&self, job_id: Uuid) {
        self.blobs
            .lock()
            .expect("artifact store mutex poisoned")
            .retain(|(owner, _), _| *owner != job_id);
    }
}
