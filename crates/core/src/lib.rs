//! `queuectl-core`: job queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no storage, no processes):
//! the job record and its state machine, the backoff policy, identifiers and
//! the clock abstraction the stores read time from.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod id;
pub mod job;

pub use backoff::{BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_UNIT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{DEFAULT_MAX_RETRIES, DeadLetterEntry, FailureOutcome, Job, JobSpec, JobState};
