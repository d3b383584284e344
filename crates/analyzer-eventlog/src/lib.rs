// SPDX-License-Identifier: MIT OR Apache-2.0
//! EventLog: the append-only, per-job, seq-monotonic event store that
//! backs SSE streaming and resume-by-seq (§4.6).
//!
//! `append` atomically assigns `seq = (max existing seq for job) + 1` and
//! fans the event out to any live subscribers; `read_after` serves replay.
//! No gaps are permitted between consecutive seqs of the same job — every
//! assignment here is `+1` from the previous, by construction.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use analyzer_core::{Event, EventPayload};

/// Broadcast channel capacity per job. Sized well above the expected event
/// count of a single analysis job; a slow subscriber that falls behind by
/// more than this many events observes a `Lagged` gap (handled by
/// [`EventSubscription::recv`], which logs and resumes) but never blocks a
/// writer — `EventLog::append` must never wait on a subscriber.
const CHANNEL_CAPACITY: usize = 1024;

struct JobLog {
    events: Vec<Event>,
    sender: broadcast::Sender<Event>,
}

impl JobLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { events: Vec::new(), sender }
    }
}

/// The append-only event store, shared process-wide across all jobs.
pub struct EventLog {
    jobs: Mutex<HashMap<Uuid, JobLog>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create an empty event log.
    #[must_use]
    pub fn new() -> Self {
        Self { jobs: Mutex::new(HashMap::new()) }
    }

    /// Append `payload` for `job_id`, assigning the next seq. Returns the
    /// durable [`Event`], which is also broadcast to any live subscriber.
    pub fn append(&self, job_id: Uuid, payload: EventPayload, now: DateTime<Utc>) -> Event {
        let mut jobs = self.jobs.lock().expect("event log mutex poisoned");
        let log = jobs.entry(job_id).or_insert_with(JobLog::new);
        let seq = log.events.last().map_or(1, |last| last.seq + 1);
        let event = Event { job_id, seq, created_at: now, payload };
        log.events.push(event.clone());
        // No subscribers is not an error: SSE readers may not have connected yet.
        let _ = log.sender.send(event.clone());
        event
    }

    /// All events for `job_id` with `seq > after`, in seq order. Empty if
    /// the job has no recorded events (including if it does not exist).
    #[must_use]
    pub fn read_after(&self, job_id: Uuid, after: u64) -> Vec<Event> {
        let jobs = self.jobs.lock().expect("event log mutex poisoned");
        jobs.get(&job_id)
            .map(|log| log.events.iter().filter(|e| e.seq > after).cloned().collect())
            .unwrap_or_default()
    }

    /// The highest seq appended for `job_id` so far (`0` if none).
    #[must_use]
    pub fn last_seq(&self, job_id: Uuid) -> u64 {
        let jobs = self.jobs.lock().expect("event log mutex poisoned");
        jobs.get(&job_id).and_then(|log| log.events.last()).map_or(0, |e| e.seq)
    }

    /// Subscribe to live events for `job_id`, creating its log if this is
    /// the first subscriber before any event has been appended.
    #[must_use]
    pub fn subscribe(&self, job_id: Uuid) -> EventSubscription {
        let mut jobs = self.jobs.lock().expect("event log mutex poisoned");
        let log = jobs.entry(job_id).or_insert_with(JobLog::new);
        EventSubscription { receiver: log.sender.subscribe() }
    }
}

/// A live tail over one job's events. Used by the SSE reader after it has
/// drained `read_after(job_id, cursor)` to pick up events appended after
/// the snapshot was taken.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    /// Await the next event. Returns `None` once the log's sender has been
    /// dropped (the process is shutting down); transparently resumes past
    /// `Lagged` gaps, logging how many events were missed — callers that
    /// need gap-free delivery should instead call
    /// [`EventLog::read_after`] after observing a lag.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged; resuming");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_started(log: &EventLog, job_id: Uuid, now: DateTime<Utc>) {
        log.append(job_id, EventPayload::JobStarted, now);
    }

    #[test]
    fn seq_is_monotonic_and_dense() {
        let log = EventLog::new();
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        job_started(&log, job_id, now);
        log.append(
            job_id,
            EventPayload::CardStarted { card: "profile".into(), status: "running".into(), internal: None, stream: None },
            now,
        );
        log.append(
            job_id,
            EventPayload::CardCompleted {
                card: "profile".into(),
                payload: Default::default(),
                internal: None,
            },
            now,
        );
        let events = log.read_after(job_id, 0);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn read_after_excludes_seen_events_s5_resume() {
        let log = EventLog::new();
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        for _ in 0..15 {
            job_started(&log, job_id, now);
        }
        let resumed = log.read_after(job_id, 12);
        assert!(resumed.iter().all(|e| e.seq > 12));
        assert_eq!(resumed.first().unwrap().seq, 13);
    }

    #[tokio::test]
    async fn live_subscription_receives_appends_after_subscribe() {
        let log = EventLog::new();
        let job_id = Uuid::new_v4();
        let mut sub = log.subscribe(job_id);
        let now = Utc::now();
        job_started(&log, job_id, now);
        let event = sub.recv().await.unwrap();
        assert_eq!(event.seq, 1);
    }

    #[test]
    fn unknown_job_reads_as_empty_not_an_error() {
        let log = EventLog::new();
        assert!(log.read_after(Uuid::new_v4(), 0).is_empty());
        assert_eq!(log.last_seq(Uuid::new_v4()), 0);
    }
}
