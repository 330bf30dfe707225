//! Shared data model for jobmill: jobs, status records, sessions, store key naming and
//! the operator settings file.

pub mod job;
pub mod keys;
pub mod settings;

pub use job::{Job, JobStatus, JobStatusRecord, Payload, SessionRecord};
pub use keys::QueueKeys;
