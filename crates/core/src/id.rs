//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Longest job id accepted on enqueue.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Identifier of a job.
///
/// Job ids are caller-supplied strings (e.g. `"nightly-backup"`), so unlike
/// the worker id this is not a UUID. Construction validates the text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Validate and wrap a caller-supplied id.
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::invalid_id("job id must not be empty"));
        }
        if value.len() > MAX_JOB_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "job id longer than {MAX_JOB_ID_LEN} bytes"
            )));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DomainError::invalid_id(format!(
                "job id {value:?} contains whitespace or control characters"
            )));
        }
        Ok(Self(value))
    }

    /// Generate a fresh id for specs that omit one.
    ///
    /// Uses UUIDv7 so generated ids sort by creation time.
    pub fn generate() -> Self {
        Self(format!("job-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

/// Identifier of a worker (lease owner).
///
/// Every worker loop gets its own id, also when several loops share a process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for WorkerId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("WorkerId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_rejects_empty_and_whitespace() {
        assert!(JobId::parse("").is_err());
        assert!(JobId::parse("has space").is_err());
        assert!(JobId::parse("tab\there").is_err());
        assert!(JobId::parse("x".repeat(MAX_JOB_ID_LEN + 1)).is_err());
        assert_eq!(JobId::parse("job_a").unwrap().as_str(), "job_a");
    }

    #[test]
    fn generated_job_ids_are_unique_and_valid() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(JobId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn job_id_deserialization_validates() {
        let ok: JobId = serde_json::from_str("\"job1\"").unwrap();
        assert_eq!(ok.as_str(), "job1");
        assert!(serde_json::from_str::<JobId>("\"\"").is_err());
    }

    #[test]
    fn worker_id_round_trips_through_display() {
        let id = WorkerId::new();
        let parsed: WorkerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
