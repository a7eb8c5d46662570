//! Infrastructure layer: durable job stores, workers, settings.

pub mod config;
pub mod jobs;
pub mod queue;

pub use queue::{JobLookup, QueueService};
