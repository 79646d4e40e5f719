//! In-memory `EngineStore` for tests and embedders.
//!
//! One mutex guards all tables, so a `commit` is trivially atomic and
//! `acquire_due_jobs` performs its check-and-lock without a second writer
//! interleaving.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::events::RuntimeEvent;
use crate::execution::InstanceState;
use crate::job::{Job, JobOp};
use crate::store::{CommandCommit, EngineStore};

#[derive(Default)]
struct Inner {
    /// Latest deployment per key.
    definitions: HashMap<String, ProcessDefinition>,
    /// Every deployment ever, by (key, digest) — in-flight instances load
    /// the version they started against.
    definition_versions: HashMap<(String, [u8; 32]), ProcessDefinition>,
    instances: HashMap<Uuid, InstanceState>,
    jobs: HashMap<Uuid, Job>,
    events: HashMap<Uuid, Vec<RuntimeEvent>>,
}

impl Inner {
    fn apply_job_op(&mut self, op: JobOp) {
        match op {
            JobOp::Create(job) | JobOp::Update(job) => {
                self.jobs.insert(job.id, job);
            }
            JobOp::Delete(id) => {
                self.jobs.remove(&id);
            }
            JobOp::DeleteForInstance(instance_id) => {
                self.jobs.retain(|_, j| j.process_instance_id != instance_id);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|e| anyhow!("lock poisoned: {e}"))
    }

    /// Test hook: total number of job rows, dead-lettered included.
    pub fn job_count(&self) -> usize {
        self.inner.lock().map(|i| i.jobs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        let mut inner = self.lock()?;
        inner.definition_versions.insert(
            (definition.key.clone(), definition.version),
            definition.clone(),
        );
        inner
            .definitions
            .insert(definition.key.clone(), definition.clone());
        Ok(())
    }

    async fn load_definition(&self, key: &str) -> Result<Option<ProcessDefinition>> {
        Ok(self.lock()?.definitions.get(key).cloned())
    }

    async fn load_definition_version(
        &self,
        key: &str,
        version: [u8; 32],
    ) -> Result<Option<ProcessDefinition>> {
        Ok(self
            .lock()?
            .definition_versions
            .get(&(key.to_string(), version))
            .cloned())
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<InstanceState>> {
        Ok(self.lock()?.instances.get(&instance_id).cloned())
    }

    async fn instance_of_execution(&self, execution_id: Uuid) -> Result<Option<Uuid>> {
        let inner = self.lock()?;
        Ok(inner
            .instances
            .values()
            .find(|s| s.executions.contains_key(&execution_id))
            .map(|s| s.instance_id))
    }

    async fn commit(&self, commit: CommandCommit) -> Result<()> {
        let mut inner = self.lock()?;
        let instance_id = commit.state.instance_id;
        inner.instances.insert(instance_id, commit.state);
        for op in commit.job_ops {
            inner.apply_job_op(op);
        }
        inner
            .events
            .entry(instance_id)
            .or_default()
            .extend(commit.events);
        Ok(())
    }

    async fn acquire_due_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>> {
        let mut inner = self.lock()?;
        let mut due: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .map(|j| j.id)
            .collect();
        due.sort();
        due.truncate(limit);

        let mut acquired = Vec::with_capacity(due.len());
        for id in due {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.lock_owner = Some(owner.to_string());
                job.lock_expires_at = Some(now + lock_duration);
                acquired.push(job.clone());
            }
        }
        Ok(acquired)
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.lock()?.jobs.remove(&job_id);
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.jobs.contains_key(&job.id) {
            return Err(anyhow!("update: job {} not found", job.id));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn reset_job_retries(&self, job_id: Uuid, retries: u32) -> Result<()> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("reset: job {job_id} not found"))?;
        job.retries_remaining = retries;
        job.lock_owner = None;
        job.lock_expires_at = None;
        job.due_at = Utc::now();
        Ok(())
    }

    async fn list_deadlettered_jobs(&self) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.is_deadlettered())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn jobs_for_instance(&self, instance_id: Uuid) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.process_instance_id == instance_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn append_event(&self, instance_id: Uuid, event: RuntimeEvent) -> Result<u64> {
        let mut inner = self.lock()?;
        let log = inner.events.entry(instance_id).or_default();
        log.push(event);
        Ok(log.len() as u64)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.lock()?;
        let log = inner.events.get(&instance_id).cloned().unwrap_or_default();
        Ok(log
            .into_iter()
            .enumerate()
            .map(|(i, e)| (i as u64 + 1, e))
            .filter(|(seq, _)| *seq >= from_seq)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;

    fn due_job() -> Job {
        Job::new(
            JobKind::AsyncContinuation,
            Uuid::now_v7(),
            Uuid::now_v7(),
            "work".into(),
            Utc::now() - Duration::seconds(1),
            3,
        )
    }

    #[tokio::test]
    async fn acquisition_locks_are_exclusive() {
        let store = MemoryStore::new();
        let job = due_job();
        store
            .commit(CommandCommit {
                state: InstanceState::new("p".into(), [0u8; 32]),
                job_ops: vec![JobOp::Create(job.clone())],
                events: vec![],
            })
            .await
            .unwrap();

        let now = Utc::now();
        let first = store
            .acquire_due_jobs("worker-1", now, 10, Duration::minutes(5))
            .await
            .unwrap();
        let second = store
            .acquire_due_jobs("worker-2", now, 10, Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "locked job must not be re-acquired");
        assert_eq!(first[0].lock_owner.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn expired_locks_are_reclaimed() {
        let store = MemoryStore::new();
        store
            .commit(CommandCommit {
                state: InstanceState::new("p".into(), [0u8; 32]),
                job_ops: vec![JobOp::Create(due_job())],
                events: vec![],
            })
            .await
            .unwrap();

        let t0 = Utc::now();
        let first = store
            .acquire_due_jobs("crashed-worker", t0, 10, Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Within the lock window nothing is handed out.
        let contested = store
            .acquire_due_jobs("worker-2", t0 + Duration::seconds(10), 10, Duration::seconds(30))
            .await
            .unwrap();
        assert!(contested.is_empty());

        // Past the expiry the job is due again for anyone.
        let reclaimed = store
            .acquire_due_jobs("worker-2", t0 + Duration::seconds(31), 10, Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].lock_owner.as_deref(), Some("worker-2"));
    }

    #[tokio::test]
    async fn requeue_to_zero_retries_deadletters() {
        let store = MemoryStore::new();
        let job = due_job();
        let job_id = job.id;
        store
            .commit(CommandCommit {
                state: InstanceState::new("p".into(), [0u8; 32]),
                job_ops: vec![JobOp::Create(job)],
                events: vec![],
            })
            .await
            .unwrap();

        let mut failed = store.load_job(job_id).await.unwrap().unwrap();
        failed.lock_owner = None;
        failed.lock_expires_at = None;
        failed.retries_remaining = 0;
        failed.exception = Some("handler exploded".into());
        store.update_job(&failed).await.unwrap();

        let dead = store.list_deadlettered_jobs().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, job_id);
        assert!(store
            .acquire_due_jobs("w", Utc::now(), 10, Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());

        // Operator retry makes it acquirable again.
        store.reset_job_retries(job_id, 3).await.unwrap();
        let acquired = store
            .acquire_due_jobs("w", Utc::now(), 10, Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
    }
}
