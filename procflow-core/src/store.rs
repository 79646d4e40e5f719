//! Persistence trait for all engine state.
//!
//! The interpreter and scheduler operate exclusively through this trait,
//! enabling pluggable backends (the in-memory store for tests and
//! embedders, a database for production). A command performs no store I/O
//! while it runs: it loads one instance snapshot up front and hands the
//! mutated snapshot, its job-table operations, and its audit events to
//! [`EngineStore::commit`] in a single atomic call.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::events::RuntimeEvent;
use crate::execution::InstanceState;
use crate::job::{Job, JobOp};

/// Everything one command writes, applied atomically or not at all.
#[derive(Debug)]
pub struct CommandCommit {
    pub state: InstanceState,
    pub job_ops: Vec<JobOp>,
    pub events: Vec<RuntimeEvent>,
}

#[async_trait]
pub trait EngineStore: Send + Sync {
    // ── Definitions ──

    /// Persist a deployed definition, addressable both as the latest under
    /// its key and by its content digest. Digests never collide across
    /// redeploys, so every version a running instance pinned stays loadable.
    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()>;
    /// Latest deployed definition under a key.
    async fn load_definition(&self, key: &str) -> Result<Option<ProcessDefinition>>;
    /// A specific deployed version. Running instances resolve their graph
    /// through the digest they started against, never the latest.
    async fn load_definition_version(
        &self,
        key: &str,
        version: [u8; 32],
    ) -> Result<Option<ProcessDefinition>>;

    // ── Instances ──

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<InstanceState>>;
    /// Resolve the owning instance of an execution id.
    async fn instance_of_execution(&self, execution_id: Uuid) -> Result<Option<Uuid>>;

    /// Apply one command's writes atomically: replace the instance snapshot,
    /// apply the job ops, append the events.
    async fn commit(&self, commit: CommandCommit) -> Result<()>;

    // ── Job table ──

    /// Select up to `limit` acquirable jobs (due, not dead-lettered,
    /// unlocked or expired-lock) and lock them for `owner`. The check and
    /// the lock write are one atomic step per job, so concurrent workers
    /// acquire disjoint sets.
    async fn acquire_due_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>>;

    async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>>;
    async fn delete_job(&self, job_id: Uuid) -> Result<()>;

    /// Replace one job row outside a command commit — the scheduler's
    /// failure path (clear the lock, decrement retries, record the
    /// exception, push the due date out). With zero retries remaining the
    /// written row is dead-lettered.
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Operator intervention: restore the retry budget of a dead-lettered
    /// job and make it due immediately.
    async fn reset_job_retries(&self, job_id: Uuid, retries: u32) -> Result<()>;

    async fn list_deadlettered_jobs(&self) -> Result<Vec<Job>>;
    async fn jobs_for_instance(&self, instance_id: Uuid) -> Result<Vec<Job>>;

    // ── Event log (append-only) ──

    /// Append one event outside a command commit (scheduler failure path).
    async fn append_event(&self, instance_id: Uuid, event: RuntimeEvent) -> Result<u64>;
    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>>;
}
