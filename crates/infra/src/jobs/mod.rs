//! Persistent job queue: stores, execution, workers and the DLQ.
//!
//! ## Design
//!
//! - Jobs are shell commands with a retry budget
//! - Every transition is one atomic conditional write in the store
//! - Failed attempts back off exponentially (`unit * base^attempts`)
//! - Jobs that exhaust their budget move to a dead-letter table
//! - Claims are leases; an expired lease makes the job claimable again
//!
//! ## Components
//!
//! - `JobStore`: persistence contract (in-memory or SQLite)
//! - `CommandRunner`: runs a job's command with a timeout
//! - `Worker` / `WorkerPool`: claim, execute, report loops
//! - `DlqManager`: inspection and re-injection of dead jobs

pub mod dlq;
pub mod in_memory;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod worker;

pub use dlq::DlqManager;
pub use in_memory::InMemoryJobStore;
pub use runner::{CommandRunner, ExecutionError, ExecutionReport, ShellRunner};
pub use sqlite::SqliteJobStore;
pub use store::{JobFilter, JobStats, JobStore, StoreError};
pub use worker::{
    CycleOutcome, ExitReason, JobOutcome, ShutdownTrigger, Worker, WorkerConfig, WorkerError,
    WorkerPool, WorkerPoolHandle, WorkerSummary,
};
