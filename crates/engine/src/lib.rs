#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Distributed job engine for jobmill: leases queued jobs to an elastic pool of workers,
//! tracks per-job and per-session completion, and recovers abandoned work after restarts.

/// Public API for the engine crate.
pub mod api;

mod client;
mod engine;
mod pool;
mod recovery;
mod runner;
mod session;
mod status;
mod tracker;
mod worker;

#[cfg(test)]
mod testing;

pub use api::{
    EngineConfig, EngineDeps, EngineError, EngineEvent, EngineHandle, RetryPolicy, StatusSnapshot,
    WorkerSnapshot, start_engine,
};
pub use client::{JobClient, SubmittedBatch};
pub use jobmill_core::{Job, JobStatus, JobStatusRecord, Payload};
pub use recovery::RecoveryReport;
pub use runner::{CommandRunner, JobRunner, ProgressReporter};
pub use session::{SessionHook, SessionSummary};
pub use tracker::{HttpTracker, JobTracker, NoopTracker};
