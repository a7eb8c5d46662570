//! In-memory job store for tests/dev.
//!
//! All tables sit behind one mutex, so each operation is trivially atomic.
//! Clones share the same tables, which lets several workers in one process
//! exercise the same claim protocol as the SQLite store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use queuectl_core::{Clock, DeadLetterEntry, FailureOutcome, Job, JobId, SystemClock, WorkerId};

use crate::config::{QueueSettings, SettingKey};

use super::store::{JobFilter, JobStats, JobStore, StoreError, lease_deadline};

#[derive(Debug, Default)]
struct Tables {
    jobs: BTreeMap<JobId, Job>,
    dead_letters: BTreeMap<JobId, DeadLetterEntry>,
    settings: QueueSettings,
    stop_requested: bool,
}

/// In-memory job store.
#[derive(Debug, Clone)]
pub struct InMemoryJobStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a report from `worker` on `id` did not match the current lease.
fn lease_miss(tables: &Tables, id: &JobId, worker: WorkerId) -> StoreError {
    if tables.jobs.contains_key(id) || tables.dead_letters.contains_key(id) {
        StoreError::LeaseLost {
            id: id.clone(),
            worker,
        }
    } else {
        StoreError::NotFound(id.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let mut tables = self.lock()?;
        if tables.jobs.contains_key(&job.id) || tables.dead_letters.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    async fn claim_next(
        &self,
        worker: WorkerId,
        lease_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = self.now();
        let deadline = lease_deadline(now, lease_duration)?;
        let mut tables = self.lock()?;

        let candidate = tables
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by(|a, b| a.claim_order_key().cmp(&b.claim_order_key()))
            .map(|j| j.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.claim(worker, deadline, now)?;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: &JobId, worker: WorkerId) -> Result<Job, StoreError> {
        let now = self.now();
        let mut tables = self.lock()?;
        if !tables.jobs.get(id).is_some_and(|j| j.is_owned_by(worker)) {
            return Err(lease_miss(&tables, id, worker));
        }
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        job.complete(worker, now)?;
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        worker: WorkerId,
        error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let now = self.now();
        let mut tables = self.lock()?;
        let backoff = tables.settings.backoff();

        if !tables.jobs.get(id).is_some_and(|j| j.is_owned_by(worker)) {
            return Err(lease_miss(&tables, id, worker));
        }
        let outcome = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?
            .fail(worker, error, now, &backoff)?;

        if let FailureOutcome::DeadLettered { .. } = outcome {
            if let Some(job) = tables.jobs.remove(id) {
                tables
                    .dead_letters
                    .insert(id.clone(), DeadLetterEntry::new(job, now));
            }
        }
        Ok(outcome)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let tables = self.lock()?;
        let mut result: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.claim_order_key().cmp(&b.claim_order_key()));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let now = self.now();
        let tables = self.lock()?;
        let mut stats = JobStats::default();
        for job in tables.jobs.values() {
            stats.count(job, now);
        }
        stats.dead = tables.dead_letters.len();
        Ok(stats)
    }

    async fn dlq_list(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let tables = self.lock()?;
        let mut result: Vec<_> = tables.dead_letters.values().cloned().collect();
        result.sort_by(|a, b| (a.moved_at, &a.job.id).cmp(&(b.moved_at, &b.job.id)));
        Ok(result)
    }

    async fn dlq_get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.lock()?.dead_letters.get(id).cloned())
    }

    async fn dlq_requeue(&self, id: &JobId, command: Option<String>) -> Result<Job, StoreError> {
        let now = self.now();
        let mut tables = self.lock()?;
        if tables.jobs.contains_key(id) {
            return Err(StoreError::DuplicateId(id.clone()));
        }
        let entry = tables
            .dead_letters
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let job = entry.to_requeued(command, now);
        tables.jobs.insert(id.clone(), job.clone());
        Ok(job)
    }

    async fn dlq_delete(&self, id: &JobId) -> Result<DeadLetterEntry, StoreError> {
        self.lock()?
            .dead_letters
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn settings(&self) -> Result<QueueSettings, StoreError> {
        Ok(self.lock()?.settings)
    }

    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<QueueSettings, StoreError> {
        let mut tables = self.lock()?;
        let mut settings = tables.settings;
        settings.apply(key, value)?;
        tables.settings = settings;
        Ok(settings)
    }

    async fn stop_requested(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.stop_requested)
    }

    async fn set_stop_requested(&self, stop: bool) -> Result<(), StoreError> {
        self.lock()?.stop_requested = stop;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::{JobState, ManualClock};

    const LEASE: Duration = Duration::from_secs(30);

    fn setup() -> (InMemoryJobStore, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    fn new_job(store: &InMemoryJobStore, id: &str, max_retries: u32) -> Job {
        Job::new(JobId::parse(id).unwrap(), "true", max_retries, store.now())
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let (store, _clock) = setup();
        let worker = WorkerId::new();

        let job = store.insert(new_job(&store, "job1", 3)).await.unwrap();

        let claimed = store.claim_next(worker, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.owner, Some(worker));
        assert_eq!(claimed.attempts, 0);

        // No more jobs
        assert!(store.claim_next(worker, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_across_tables() {
        let (store, _clock) = setup();
        let worker = WorkerId::new();

        store.insert(new_job(&store, "job1", 0)).await.unwrap();
        assert!(matches!(
            store.insert(new_job(&store, "job1", 0)).await,
            Err(StoreError::DuplicateId(_))
        ));

        let claimed = store.claim_next(worker, LEASE).await.unwrap().unwrap();
        store.mark_failed(&claimed.id, worker, "boom").await.unwrap();

        // Dead-lettered id is still taken
        assert!(matches!(
            store.insert(new_job(&store, "job1", 0)).await,
            Err(StoreError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn claims_oldest_eligible_first_with_id_tiebreak() {
        let (store, clock) = setup();
        let worker = WorkerId::new();

        store.insert(new_job(&store, "b", 3)).await.unwrap();
        store.insert(new_job(&store, "a", 3)).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        store.insert(new_job(&store, "0-late", 3)).await.unwrap();

        let order: Vec<String> = [
            store.claim_next(worker, LEASE).await.unwrap().unwrap(),
            store.claim_next(worker, LEASE).await.unwrap().unwrap(),
            store.claim_next(worker, LEASE).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|j| j.id.to_string())
        .collect();

        assert_eq!(order, vec!["a", "b", "0-late"]);
    }

    #[tokio::test]
    async fn failure_backoff_then_dead_letter() {
        let (store, clock) = setup();
        let worker = WorkerId::new();
        store.insert(new_job(&store, "job_b", 2)).await.unwrap();

        let claimed = store.claim_next(worker, LEASE).await.unwrap().unwrap();
        let failed_at = store.now();
        let outcome = store.mark_failed(&claimed.id, worker, "exit code 1").await.unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::RetryScheduled {
                attempts: 1,
                next_attempt_at: failed_at + chrono::Duration::seconds(2),
            }
        );

        // Not eligible until the backoff elapsed
        clock.advance(chrono::Duration::milliseconds(1_999));
        assert!(store.claim_next(worker, LEASE).await.unwrap().is_none());
        clock.advance(chrono::Duration::milliseconds(1));

        let claimed = store.claim_next(worker, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
        let outcome = store.mark_failed(&claimed.id, worker, "exit code 1").await.unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { attempts: 2 });

        assert!(store.get(&claimed.id).await.unwrap().is_none());
        let dead = store.dlq_list().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.attempts, 2);
        assert_eq!(dead[0].job.state, JobState::Dead);
        assert_eq!(dead[0].job.last_error.as_deref(), Some("exit code 1"));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_without_extra_attempt() {
        let (store, clock) = setup();
        let crashed = WorkerId::new();
        let rescuer = WorkerId::new();
        store.insert(new_job(&store, "job1", 3)).await.unwrap();

        let claimed = store.claim_next(crashed, LEASE).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(30));
        assert!(store.claim_next(rescuer, LEASE).await.unwrap().is_none());

        clock.advance(chrono::Duration::milliseconds(1));
        let reclaimed = store.claim_next(rescuer, LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.owner, Some(rescuer));
        assert_eq!(reclaimed.attempts, 0);

        // The crashed worker's late report is rejected
        assert!(matches!(
            store.mark_completed(&claimed.id, crashed).await,
            Err(StoreError::LeaseLost { .. })
        ));
        assert!(matches!(
            store.mark_failed(&claimed.id, crashed, "late").await,
            Err(StoreError::LeaseLost { .. })
        ));
        assert_eq!(store.get(&claimed.id).await.unwrap().unwrap().attempts, 0);

        store.mark_completed(&claimed.id, rescuer).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_job_reports_not_found() {
        let (store, _clock) = setup();
        let id = JobId::parse("ghost").unwrap();
        assert!(matches!(
            store.mark_completed(&id, WorkerId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dead_letter_requeue_flow() {
        let (store, _clock) = setup();
        let worker = WorkerId::new();
        store.insert(new_job(&store, "job1", 0)).await.unwrap();

        let claimed = store.claim_next(worker, LEASE).await.unwrap().unwrap();
        store.mark_failed(&claimed.id, worker, "boom").await.unwrap();
        assert!(store.list(&JobFilter::all()).await.unwrap().is_empty());

        let retried = store
            .dlq_requeue(&claimed.id, Some("echo fixed".to_string()))
            .await
            .unwrap();
        assert_eq!(retried.state, JobState::Pending);
        assert_eq!(retried.attempts, 0);
        assert_eq!(retried.command, "echo fixed");

        // DLQ is now empty
        assert!(store.dlq_list().await.unwrap().is_empty());
        assert!(matches!(
            store.dlq_requeue(&claimed.id, None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_tracking() {
        let (store, _clock) = setup();
        let worker = WorkerId::new();

        for i in 0..5 {
            store.insert(new_job(&store, &format!("job{i}"), 3)).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 5);
        assert_eq!(stats.ready, 5);

        let a = store.claim_next(worker, LEASE).await.unwrap().unwrap();
        store.claim_next(worker, LEASE).await.unwrap();
        store.mark_failed(&a.id, worker, "x").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.outstanding(), 5);
    }

    #[tokio::test]
    async fn settings_drive_backoff() {
        let (store, _clock) = setup();
        let worker = WorkerId::new();
        store.set_setting(SettingKey::BackoffBase, "5").await.unwrap();
        assert!(store.set_setting(SettingKey::BackoffBase, "1").await.is_err());

        store.insert(new_job(&store, "job1", 3)).await.unwrap();
        let claimed = store.claim_next(worker, LEASE).await.unwrap().unwrap();
        let now = store.now();
        let outcome = store.mark_failed(&claimed.id, worker, "x").await.unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::RetryScheduled {
                attempts: 1,
                next_attempt_at: now + chrono::Duration::seconds(5),
            }
        );
    }
}
