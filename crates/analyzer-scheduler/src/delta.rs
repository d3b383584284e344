// SPDX-License-Identifier: MIT OR Apache-2.0
//! Batches streamed LLM text into `card.delta` events, flushing per section
//! every `delta_flush_bytes` bytes or `delta_flush_interval_ms`, whichever
//! comes first (§9 design note) — never per-token, to bound event volume.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

struct SectionBuffer {
    pending: String,
    last_flush: Instant,
}

/// Per-card delta batcher. One instance lives for the duration of a single
/// streaming [`crate::LLMCaller::call`].
pub struct DeltaBatcher {
    flush_bytes: usize,
    flush_interval: Duration,
    sections: BTreeMap<String, SectionBuffer>,
}

impl DeltaBatcher {
    /// Create a batcher with the given thresholds.
    #[must_use]
    pub fn new(flush_bytes: usize, flush_interval_ms: u64) -> Self {
        Self {
            flush_bytes,
            flush_interval: Duration::from_millis(flush_interval_ms),
            sections: BTreeMap::new(),
        }
    }

    /// Record `text` for `section`. Returns `Some(batch)` if this push
    /// crossed a flush threshold, in which case the section's buffer is
    /// cleared and its flush clock reset.
    pub fn push(&mut self, section: &str, text: &str) -> Option<String> {
        let now = Instant::now();
        let buf = self
            .sections
            .entry(section.to_string())
            .or_insert_with(|| SectionBuffer { pending: String::new(), last_flush: now });
        buf.pending.push_str(text);
        let crossed =
            buf.pending.len() >= self.flush_bytes || now.duration_since(buf.last_flush) >= self.flush_interval;
        if crossed && !buf.pending.is_empty() {
            buf.last_flush = now;
            Some(std::mem::take(&mut buf.pending))
        } else {
            None
        }
    }

    /// Flush every section with a non-empty pending buffer, in section-name
    /// order. Called once after the underlying call completes, so no text
    /// is ever dropped on the floor.
    pub fn flush_all(&mut self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (section, buf) in &mut self.sections {
            if !buf.pending.is_empty() {
                out.push((section.clone(), std::mem::take(&mut buf.pending)));
            }
        }
        out
    }
}
