// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Scheduler (§4.3) and Executor (§4.4): DAG-ordered concurrent
//! dispatch over a [`analyzer_planner::Plan`], with per-group admission
//! control, soft-deadline fallback, retry-with-validation, and cache
//! probing, driving [`analyzer_eventlog::EventLog`] as it goes.
//!
//! [`ResourceFetcher`] and [`LLMCaller`] are the only adapter seams this
//! crate defines; their implementations are out of scope (§7 Non-goals)
//! and supplied by the host process.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapters;
mod cancel;
mod delta;
mod executor;
mod scheduler;

pub use adapters::{LLMCaller, LlmDelta, ResourceEvent, ResourceFetcher};
pub use cancel::{CancellationReason, CancellationToken};
pub use delta::DeltaBatcher;
pub use executor::{execute_unit, ExecOutcome, ExecutionContext};
pub use scheduler::{run_job, Deps};
