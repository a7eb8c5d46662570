//! Dead-letter queue management.
//!
//! Jobs only enter the DLQ through `JobStore::mark_failed`; this manager
//! covers inspection and manual re-injection.

use tracing::info;

use queuectl_core::{DeadLetterEntry, DomainError, Job, JobId};

use super::store::{JobStore, StoreError};

/// Operator-facing DLQ operations.
#[derive(Debug, Clone)]
pub struct DlqManager<S> {
    store: S,
}

impl<S: JobStore> DlqManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.store.dlq_list().await
    }

    pub async fn get(&self, id: &JobId) -> Result<DeadLetterEntry, StoreError> {
        self.store
            .dlq_get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Re-inject a dead job as a fresh pending job with the same command.
    pub async fn requeue(&self, id: &JobId) -> Result<Job, StoreError> {
        let job = self.store.dlq_requeue(id, None).await?;
        info!(job_id = %job.id, "dead job requeued");
        Ok(job)
    }

    /// Re-inject a dead job with a corrected command.
    pub async fn requeue_with_command(
        &self,
        id: &JobId,
        command: impl Into<String>,
    ) -> Result<Job, StoreError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(DomainError::validation("command must not be empty").into());
        }
        let job = self.store.dlq_requeue(id, Some(command)).await?;
        info!(job_id = %job.id, command = %job.command, "dead job requeued with new command");
        Ok(job)
    }

    /// Permanently discard a dead job.
    pub async fn delete(&self, id: &JobId) -> Result<DeadLetterEntry, StoreError> {
        let entry = self.store.dlq_delete(id).await?;
        info!(job_id = %entry.job.id, "dead job deleted");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::InMemoryJobStore;
    use queuectl_core::{JobState, WorkerId};
    use std::time::Duration;

    async fn dead_job(store: &InMemoryJobStore, id: &str) -> JobId {
        let id = JobId::parse(id).unwrap();
        let worker = WorkerId::new();
        store
            .insert(Job::new(id.clone(), "nonexistent_cmd_xyz", 0, store.now()))
            .await
            .unwrap();
        store
            .claim_next(worker, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store.mark_failed(&id, worker, "exit code 127").await.unwrap();
        id
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let dlq = DlqManager::new(InMemoryJobStore::new());
        let id = JobId::parse("missing").unwrap();
        assert!(matches!(dlq.get(&id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(dlq.requeue(&id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn requeue_with_corrected_command() {
        let store = InMemoryJobStore::new();
        let id = dead_job(&store, "job2").await;
        let dlq = DlqManager::new(store.clone());

        let entry = dlq.get(&id).await.unwrap();
        assert_eq!(entry.job.last_error.as_deref(), Some("exit code 127"));

        assert!(matches!(
            dlq.requeue_with_command(&id, "  ").await,
            Err(StoreError::Domain(_))
        ));

        let job = dlq.requeue_with_command(&id, "echo fixed").await.unwrap();
        assert_eq!(job.command, "echo fixed");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(dlq.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryJobStore::new();
        let id = dead_job(&store, "job2").await;
        let dlq = DlqManager::new(store.clone());

        dlq.delete(&id).await.unwrap();
        assert!(dlq.list().await.unwrap().is_empty());
        assert!(store.get(&id).await.unwrap().is_none());
    }
}
