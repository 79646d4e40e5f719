//! The durable job scheduler.
//!
//! Workers poll the job table, lock a batch of due jobs (optimistic
//! check-and-lock inside the store, so two workers never hold the same
//! job), and run each as its own engine command. Failures decrement the
//! retry budget with exponential backoff; an exhausted budget dead-letters
//! the job for operator inspection. A worker that crashes mid-execution
//! leaves a lock that expires, after which any worker reclaims the job.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{backoff_due, Engine, JobRun};
use crate::error::{EngineError, Result};
use crate::events::RuntimeEvent;
use crate::job::{Job, JobKind};

pub struct JobScheduler {
    engine: Arc<Engine>,
    /// Lock-owner identity written into acquired job rows.
    owner: String,
}

impl JobScheduler {
    pub fn new(engine: Arc<Engine>, owner: impl Into<String>) -> Self {
        Self {
            engine,
            owner: owner.into(),
        }
    }

    /// One acquisition round: lock up to a batch of due jobs and execute
    /// them. Returns how many jobs were executed (stale no-ops included).
    pub async fn poll_once(&self) -> Result<usize> {
        let config = self.engine.config();
        let jobs = self
            .engine
            .store()
            .acquire_due_jobs(
                &self.owner,
                Utc::now(),
                config.job_batch_size,
                config.job_lock_duration(),
            )
            .await?;

        let count = jobs.len();
        for job in jobs {
            self.execute(job).await?;
        }
        Ok(count)
    }

    async fn execute(&self, job: Job) -> Result<()> {
        match self.engine.run_job(&job).await {
            Ok(JobRun::Completed) => {
                tracing::debug!(job_id = %job.id, owner = %self.owner, "job completed");
                Ok(())
            }
            Ok(JobRun::Stale) => Ok(()),
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    /// Behavior errors inside a job-triggered command are converted into a
    /// retry decrement rather than surfaced; only store failures bubble up.
    async fn handle_failure(&self, job: Job, err: EngineError) -> Result<()> {
        if matches!(err, EngineError::Storage(_)) {
            return Err(err);
        }

        let config = self.engine.config();
        let retries_remaining = job.retries_remaining.saturating_sub(1);

        let mut updated = job.clone();
        updated.lock_owner = None;
        updated.lock_expires_at = None;
        updated.retries_remaining = retries_remaining;
        updated.exception = Some(err.to_string());
        // A failed continuation re-enters the table as a retry job; timers
        // keep their kind so the repeat spec survives.
        if !matches!(updated.kind, JobKind::Timer { .. }) {
            updated.kind = JobKind::Retry;
        }

        if retries_remaining == 0 {
            updated.due_at = Utc::now();
            self.engine.store().update_job(&updated).await?;
            self.engine
                .store()
                .append_event(
                    job.process_instance_id,
                    RuntimeEvent::JobDeadlettered {
                        job_id: job.id,
                        message: err.to_string(),
                    },
                )
                .await?;
            tracing::error!(job_id = %job.id, %err, "retries exhausted, job dead-lettered");
        } else {
            updated.due_at = backoff_due(config, retries_remaining);
            self.engine.store().update_job(&updated).await?;
            self.engine
                .store()
                .append_event(
                    job.process_instance_id,
                    RuntimeEvent::JobFailed {
                        job_id: job.id,
                        retries_remaining,
                        message: err.to_string(),
                    },
                )
                .await?;
            tracing::warn!(
                job_id = %job.id,
                retries_remaining,
                due_at = %updated.due_at,
                %err,
                "job failed, requeued with backoff"
            );
        }
        Ok(())
    }

    /// Poll until the shutdown signal flips. Acquisition errors are logged
    /// and retried on the next tick rather than killing the worker.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll = std::time::Duration::from_millis(self.engine.config().worker_poll_interval_ms);
        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        tracing::error!(owner = %self.owner, %err, "scheduler poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(owner = %self.owner, "scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Spawn a pool of scheduler workers sharing one engine. Flip the returned
/// sender to `true` to stop them.
pub fn spawn_workers(
    engine: Arc<Engine>,
    workers: usize,
) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
    let (tx, rx) = watch::channel(false);
    let handles = (0..workers)
        .map(|i| {
            let owner = format!("worker-{i}-{}", Uuid::now_v7());
            let scheduler = JobScheduler::new(engine.clone(), owner);
            let rx = rx.clone();
            tokio::spawn(async move { scheduler.run(rx).await })
        })
        .collect();
    (tx, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::definition::{DefinitionBuilder, NodeKind, ProcessDefinition, RepeatSpec, TimerSpec};
    use crate::error::BehaviorError;
    use crate::execution::InstanceStatus;
    use crate::listener::{ExecutionInfo, ScopeVars, ServiceTaskHandler};
    use crate::store_memory::MemoryStore;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts invocations; fails while the budget lasts.
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_after: u32,
    }

    #[async_trait::async_trait]
    impl ServiceTaskHandler for Flaky {
        async fn execute(
            &self,
            _execution: &ExecutionInfo,
            vars: &mut ScopeVars<'_>,
        ) -> Result<(), BehaviorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call > self.succeed_after {
                vars.set("delivered", Value::Bool(true));
                Ok(())
            } else {
                Err(BehaviorError::new(format!("attempt {call} refused")))
            }
        }
    }

    fn async_send_process() -> ProcessDefinition {
        DefinitionBuilder::new("dispatch")
            .node("start", NodeKind::StartEvent)
            .node(
                "send",
                NodeKind::ServiceTask {
                    handler: "send".into(),
                    asynchronous: true,
                },
            )
            .node("done", NodeKind::EndEvent)
            .flow("start", "send")
            .flow("send", "done")
            .build()
            .unwrap()
    }

    /// Immediate-retry config so tests never wait on real backoff.
    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_backoff_base_ms: 0,
            ..EngineConfig::default()
        }
    }

    async fn dispatch_engine(
        calls: Arc<AtomicU32>,
        succeed_after: u32,
    ) -> (Arc<Engine>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut engine = Engine::new(store.clone(), fast_config());
        engine.register_handler(
            "send",
            Arc::new(Flaky {
                calls,
                succeed_after,
            }),
        );
        engine.deploy(async_send_process()).await.unwrap();
        (Arc::new(engine), store)
    }

    #[tokio::test]
    async fn async_continuation_completes_the_instance() {
        let calls = Arc::new(AtomicU32::new(0));
        let (engine, store) = dispatch_engine(calls.clone(), 0).await;
        let instance_id = engine
            .start_instance("dispatch", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(store.job_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "behavior deferred to the job");

        let scheduler = JobScheduler::new(engine.clone(), "worker-test");
        assert_eq!(scheduler.poll_once().await.unwrap(), 1);

        let state = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(store.job_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_into_the_dead_letter_set() {
        let calls = Arc::new(AtomicU32::new(0));
        let (engine, store) = dispatch_engine(calls.clone(), u32::MAX).await;
        let instance_id = engine
            .start_instance("dispatch", BTreeMap::new())
            .await
            .unwrap();
        let budget = engine.config().default_job_retries;

        let scheduler = JobScheduler::new(engine.clone(), "worker-test");
        for _ in 0..budget {
            assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), budget, "one attempt per retry");

        // Exhausted: nothing left to acquire, the row survives for inspection.
        assert_eq!(scheduler.poll_once().await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), budget);
        assert_eq!(store.job_count(), 1);

        let dead = engine.list_deadlettered_jobs().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].is_deadlettered());
        assert!(dead[0].exception.as_deref().unwrap_or("").contains("refused"));

        // The instance is still parked at the failing node, untouched.
        let state = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Running);
        assert!(engine
            .read_events(instance_id)
            .await
            .unwrap()
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::JobDeadlettered { .. })));
    }

    #[tokio::test]
    async fn operator_retry_revives_a_dead_lettered_job() {
        let calls = Arc::new(AtomicU32::new(0));
        let budget = fast_config().default_job_retries;
        // Fails through the whole first budget, then succeeds.
        let (engine, store) = dispatch_engine(calls.clone(), budget).await;
        let instance_id = engine
            .start_instance("dispatch", BTreeMap::new())
            .await
            .unwrap();

        let scheduler = JobScheduler::new(engine.clone(), "worker-test");
        for _ in 0..budget {
            scheduler.poll_once().await.unwrap();
        }
        let dead = engine.list_deadlettered_jobs().await.unwrap();
        assert_eq!(dead.len(), 1);

        engine.retry_job(dead[0].id).await.unwrap();
        assert_eq!(scheduler.poll_once().await.unwrap(), 1);

        let state = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn repeating_timer_reschedules_until_the_cycle_ends() {
        let definition = DefinitionBuilder::new("heartbeat")
            .node("start", NodeKind::StartEvent)
            .node(
                "tick",
                NodeKind::TimerEvent {
                    timer: TimerSpec {
                        delay_ms: 0,
                        repeat: Some(RepeatSpec {
                            interval_ms: 0,
                            remaining: Some(2),
                        }),
                    },
                },
            )
            .node("done", NodeKind::EndEvent)
            .flow("start", "tick")
            .flow("tick", "done")
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = {
            let mut e = Engine::new(store.clone(), fast_config());
            e.deploy(definition).await.unwrap();
            Arc::new(e)
        };
        let instance_id = engine
            .start_instance("heartbeat", BTreeMap::new())
            .await
            .unwrap();
        let root = engine
            .get_instance(instance_id)
            .await
            .unwrap()
            .root_execution_id();

        let scheduler = JobScheduler::new(engine.clone(), "worker-test");

        // First fire: a concurrent token moves past the timer, the parked
        // execution and the job both survive.
        assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        let state = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Running);
        assert_eq!(
            state.execution(root).unwrap().current_node_id.as_deref(),
            Some("tick")
        );
        assert_eq!(store.job_count(), 1);
        assert!(engine
            .read_events(instance_id)
            .await
            .unwrap()
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::JobRescheduled { .. })));

        // Final fire consumes the cycle: the parked execution itself moves
        // on and the job is deleted.
        assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        let state = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn worker_pool_drains_jobs_to_completion() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Arc::new(MemoryStore::new());
        let engine = {
            let mut e = Engine::new(
                store.clone(),
                EngineConfig {
                    worker_poll_interval_ms: 10,
                    retry_backoff_base_ms: 0,
                    ..EngineConfig::default()
                },
            );
            e.register_handler(
                "send",
                Arc::new(Flaky {
                    calls: calls.clone(),
                    succeed_after: 1,
                }),
            );
            e.deploy(async_send_process()).await.unwrap();
            Arc::new(e)
        };
        let instance_id = engine
            .start_instance("dispatch", vars_one("channel", json!("email")))
            .await
            .unwrap();

        let (shutdown, handles) = spawn_workers(engine.clone(), 2);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let state = engine.get_instance(instance_id).await.unwrap();
            if state.status == InstanceStatus::Completed {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "instance did not complete in time"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        shutdown.send(true).ok();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.job_count(), 0);
        // Failed once, then retried to success.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn vars_one(name: &str, value: Value) -> BTreeMap<String, Value> {
        BTreeMap::from([(name.to_string(), value)])
    }
}
