// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property-based tests for `analyzer-eventlog`'s seq assignment.

use analyzer_core::EventPayload;
use analyzer_eventlog::EventLog;
use chrono::Utc;
use proptest::prelude::*;
use uuid::Uuid;

fn arb_event_count() -> impl Strategy<Value = usize> {
    0usize..40
}

proptest! {
    /// Appending `n` events to a fresh job always yields the dense,
    /// monotonic seq sequence `1..=n` — never a gap, repeat, or reorder,
    /// regardless of how many events are appended.
    #[test]
    fn append_always_assigns_a_dense_monotonic_seq(n in arb_event_count()) {
        let log = EventLog::new();
        let job_id = Uuid::new_v4();
        let now = Utc::now();

        let mut seen = Vec::with_capacity(n);
        for _ in 0..n {
            let event = log.append(job_id, EventPayload::JobStarted, now);
            seen.push(event.seq);
        }

        let expected: Vec<u64> = (1..=n as u64).collect();
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(log.last_seq(job_id), n as u64);
    }

    /// `read_after(job_id, cursor)` returns exactly the events whose seq
    /// exceeds `cursor`, for any cursor in range — the resume-by-seq
    /// contract SSE reconnects depend on.
    #[test]
    fn read_after_returns_exactly_the_events_past_the_cursor(
        n in 1usize..40,
        cursor in 0u64..40,
    ) {
        let log = EventLog::new();
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        for _ in 0..n {
            log.append(job_id, EventPayload::JobStarted, now);
        }

        let resumed = log.read_after(job_id, cursor);
        let expected_count = (n as u64).saturating_sub(cursor).min(n as u64) as usize;
        prop_assert_eq!(resumed.len(), expected_count);
        prop_assert!(resumed.iter().all(|e| e.seq > cursor));
    }
}
