//! Queue facade used by the CLI.
//!
//! Thin layer over a `JobStore`: fills enqueue defaults from the persisted
//! settings and groups the operator operations in one place.

use tracing::info;

use queuectl_core::{DeadLetterEntry, Job, JobId, JobSpec};

use crate::config::{QueueSettings, SettingKey};
use crate::jobs::{DlqManager, JobFilter, JobStats, JobStore, StoreError};

/// Where a job currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLookup {
    Active(Job),
    Dead(DeadLetterEntry),
}

/// Job queue operations over a shared store.
#[derive(Debug, Clone)]
pub struct QueueService<S> {
    store: S,
}

impl<S: JobStore + Clone> QueueService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate a spec and insert it as a pending job.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job, StoreError> {
        let settings = self.store.settings().await?;
        let job = spec.into_job(settings.max_retries, self.store.now())?;
        let job = self.store.insert(job).await?;
        info!(job_id = %job.id, max_retries = job.max_retries, "job enqueued");
        Ok(job)
    }

    /// Parse a JSON job spec and enqueue it.
    pub async fn enqueue_json(&self, raw: &str) -> Result<Job, StoreError> {
        self.enqueue(JobSpec::from_json(raw)?).await
    }

    /// Look a job up in the active table, then in the DLQ.
    pub async fn find(&self, id: &JobId) -> Result<JobLookup, StoreError> {
        if let Some(job) = self.store.get(id).await? {
            return Ok(JobLookup::Active(job));
        }
        self.store
            .dlq_get(id)
            .await?
            .map(JobLookup::Dead)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.store.list(filter).await
    }

    pub async fn status(&self) -> Result<JobStats, StoreError> {
        self.store.stats().await
    }

    pub fn dlq(&self) -> DlqManager<S> {
        DlqManager::new(self.store.clone())
    }

    pub async fn settings(&self) -> Result<QueueSettings, StoreError> {
        self.store.settings().await
    }

    pub async fn config_get(&self, key: SettingKey) -> Result<String, StoreError> {
        Ok(self.store.settings().await?.get(key))
    }

    pub async fn config_set(&self, key: SettingKey, value: &str) -> Result<QueueSettings, StoreError> {
        let settings = self.store.set_setting(key, value).await?;
        info!(key = %key, value = %settings.get(key), "setting updated");
        Ok(settings)
    }

    /// Ask every worker sharing this store to exit after its current job.
    pub async fn request_stop(&self) -> Result<(), StoreError> {
        self.store.set_stop_requested(true).await?;
        info!("stop requested for all workers");
        Ok(())
    }

    pub async fn clear_stop(&self) -> Result<(), StoreError> {
        self.store.set_stop_requested(false).await
    }

    pub async fn stop_requested(&self) -> Result<bool, StoreError> {
        self.store.stop_requested().await
    }
}
