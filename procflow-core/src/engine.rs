//! The command API facade.
//!
//! Every public method is exactly one command: acquire the instance's
//! exclusivity lock, load the snapshot, drain the interpreter, commit. Job
//! execution enters through [`Engine::run_job`] and follows the same cycle,
//! with a staleness check in front.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::command::CommandContext;
use crate::config::EngineConfig;
use crate::definition::{NodeKind, ProcessDefinition};
use crate::error::{EngineError, Result};
use crate::events::RuntimeEvent;
use crate::execution::InstanceState;
use crate::interpreter::{Interpreter, Operation};
use crate::job::{Job, JobKind, JobOp};
use crate::listener::{
    ExecutionListener, HandlerRegistry, ListenerEvent, ListenerRegistry, ServiceTaskHandler,
};
use crate::store::EngineStore;

/// Outcome of one job-triggered command.
#[derive(Debug, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    /// The referenced execution was gone or had moved on; the job was
    /// deleted as a no-op.
    Stale,
}

pub struct Engine {
    store: Arc<dyn EngineStore>,
    config: EngineConfig,
    /// Latest deployment per key, for starting new instances.
    definitions: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
    /// Versions pinned by running instances, keyed by content digest.
    pinned_definitions: RwLock<HashMap<[u8; 32], Arc<ProcessDefinition>>>,
    handlers: HandlerRegistry,
    listeners: ListenerRegistry,
    instance_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn EngineStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            definitions: RwLock::new(HashMap::new()),
            pinned_definitions: RwLock::new(HashMap::new()),
            handlers: HandlerRegistry::new(),
            listeners: ListenerRegistry::new(),
            instance_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    // ── Registration (before the engine is shared) ──

    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ServiceTaskHandler>,
    ) {
        self.handlers.register(name, handler);
    }

    pub fn register_listener(
        &mut self,
        element_id: impl Into<String>,
        event: ListenerEvent,
        listener: Arc<dyn ExecutionListener>,
    ) {
        self.listeners.register(element_id, event, listener);
    }

    pub fn register_global_listener(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.register_global(listener);
    }

    // ── Definitions ──

    /// Persist and cache a definition produced by the external deployer.
    /// Redeploying under an existing key only affects instances started
    /// afterwards; running instances stay pinned to their digest.
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<()> {
        self.store.save_definition(&definition).await?;
        let shared = Arc::new(definition);
        if let Ok(mut pinned) = self.pinned_definitions.write() {
            pinned.insert(shared.version, shared.clone());
        }
        if let Ok(mut cache) = self.definitions.write() {
            cache.insert(shared.key.clone(), shared);
        }
        Ok(())
    }

    async fn definition(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        if let Ok(cache) = self.definitions.read() {
            if let Some(def) = cache.get(key) {
                return Ok(def.clone());
            }
        }
        let loaded = self
            .store
            .load_definition(key)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        let shared = Arc::new(loaded);
        if let Ok(mut pinned) = self.pinned_definitions.write() {
            pinned.insert(shared.version, shared.clone());
        }
        if let Ok(mut cache) = self.definitions.write() {
            cache.insert(key.to_string(), shared.clone());
        }
        Ok(shared)
    }

    /// The exact graph an instance started against, by content digest.
    async fn definition_version(
        &self,
        key: &str,
        version: [u8; 32],
    ) -> Result<Arc<ProcessDefinition>> {
        if let Ok(pinned) = self.pinned_definitions.read() {
            if let Some(def) = pinned.get(&version) {
                return Ok(def.clone());
            }
        }
        let loaded = self
            .store
            .load_definition_version(key, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        let shared = Arc::new(loaded);
        if let Ok(mut pinned) = self.pinned_definitions.write() {
            pinned.insert(version, shared.clone());
        }
        Ok(shared)
    }

    // ── Command API ──

    /// Start a new instance: position the root execution at the start node
    /// and interpret until the tree is stable, all in one transaction.
    pub async fn start_instance(
        &self,
        definition_key: &str,
        initial_variables: BTreeMap<String, Value>,
    ) -> Result<Uuid> {
        let definition = self.definition(definition_key).await?;
        let state = InstanceState::new(definition.key.clone(), definition.version);
        let instance_id = state.instance_id;
        let root = state.root_execution_id();

        let mut ctx = CommandContext::new(definition.clone(), state);
        ctx.record(RuntimeEvent::InstanceStarted {
            instance_id,
            definition_key: definition.key.clone(),
        });
        for (name, value) in initial_variables {
            ctx.set_variable(root, &name, value);
        }
        ctx.enqueue(Operation::ExecuteNode {
            execution: root,
            node: definition.start_node().clone(),
        });

        self.interpreter().run(&mut ctx).await?;
        self.store.commit(ctx.into_commit()).await?;
        tracing::info!(%instance_id, definition = definition_key, "instance started");
        Ok(instance_id)
    }

    /// Complete a wait state (user task) with result variables.
    pub async fn complete_wait_state(
        &self,
        execution_id: Uuid,
        result_variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        let instance_id = self
            .store
            .instance_of_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let _guard = self.lock_instance(instance_id).await;

        let (definition, state) = self.load(instance_id).await?;
        let exec = state
            .execution(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let node = exec.current_node_id.clone();
        let completable = exec.is_active
            && node
                .as_ref()
                .and_then(|n| definition.node(n))
                .map(|n| n.kind == NodeKind::UserTask)
                .unwrap_or(false);
        if !completable {
            return Err(EngineError::NotWaiting {
                execution: execution_id,
                at: node,
            });
        }
        let node = node.unwrap_or_default();

        let mut ctx = CommandContext::new(definition, state);
        for (name, value) in result_variables {
            ctx.set_variable(execution_id, &name, value);
        }
        ctx.enqueue(Operation::LeaveNode {
            execution: execution_id,
            node,
        });

        self.interpreter().run(&mut ctx).await?;
        self.store.commit(ctx.into_commit()).await?;
        Ok(())
    }

    /// Forcibly end an instance: delete every execution and cancel every
    /// job referencing it, atomically within one command.
    pub async fn terminate_instance(&self, instance_id: Uuid) -> Result<()> {
        let _guard = self.lock_instance(instance_id).await;
        let (_, mut state) = self.load(instance_id).await?;

        let cancelled = self.store.jobs_for_instance(instance_id).await?.len();
        let root = state.root_execution_id();
        for child in state.children_of(root).iter().map(|e| e.id).collect::<Vec<_>>() {
            state.remove_subtree(child);
        }
        if let Some(exec) = state.execution_mut(root) {
            exec.is_active = false;
            exec.current_node_id = None;
        }
        state.status = crate::execution::InstanceStatus::Terminated;

        self.store
            .commit(crate::store::CommandCommit {
                state,
                job_ops: vec![JobOp::DeleteForInstance(instance_id)],
                events: vec![RuntimeEvent::InstanceTerminated {
                    instance_id,
                    cancelled_jobs: cancelled,
                }],
            })
            .await?;
        tracing::info!(%instance_id, cancelled, "instance terminated");
        Ok(())
    }

    /// Every variable visible from an execution, inner scopes shadowing
    /// outer ones.
    pub async fn get_variables(&self, execution_id: Uuid) -> Result<BTreeMap<String, Value>> {
        let instance_id = self
            .store
            .instance_of_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let state = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        Ok(state.visible_variables(execution_id))
    }

    /// Write variables against an execution's scope chain outside any node
    /// behavior, as its own command.
    pub async fn set_variables(
        &self,
        execution_id: Uuid,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        let instance_id = self
            .store
            .instance_of_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let _guard = self.lock_instance(instance_id).await;
        let (definition, state) = self.load(instance_id).await?;
        let mut ctx = CommandContext::new(definition, state);
        for (name, value) in variables {
            ctx.set_variable(execution_id, &name, value);
        }
        self.store.commit(ctx.into_commit()).await?;
        Ok(())
    }

    /// Read-only snapshot of an instance.
    pub async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceState> {
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    pub async fn read_events(&self, instance_id: Uuid) -> Result<Vec<(u64, RuntimeEvent)>> {
        Ok(self.store.read_events(instance_id, 1).await?)
    }

    // ── Job execution ──

    /// Run one acquired job as its own command. Stale jobs (execution gone,
    /// ended instance, or the execution has moved past the job's node) are
    /// deleted as no-ops. Errors propagate to the scheduler's retry path
    /// with nothing committed.
    pub async fn run_job(&self, job: &Job) -> Result<JobRun> {
        let _guard = self.lock_instance(job.process_instance_id).await;

        let staleness = self.check_stale(job).await?;
        if staleness {
            tracing::debug!(job_id = %job.id, "stale job deleted as no-op");
            self.store.delete_job(job.id).await?;
            return Ok(JobRun::Stale);
        }

        let (definition, state) = self.load(job.process_instance_id).await?;
        let mut ctx = CommandContext::new(definition, state);

        match &job.kind {
            JobKind::Timer { .. } => self.fire_timer(&mut ctx, job),
            JobKind::AsyncContinuation | JobKind::Retry => {
                ctx.enqueue(Operation::ContinueNode {
                    execution: job.execution_id,
                    node: job.node_id.clone(),
                });
                ctx.record_job_op(JobOp::Delete(job.id));
                ctx.record(RuntimeEvent::JobCompleted { job_id: job.id });
            }
        }

        self.interpreter().run(&mut ctx).await?;
        self.store.commit(ctx.into_commit()).await?;
        Ok(JobRun::Completed)
    }

    /// Timer semantics: while repeats remain, each fire spawns a concurrent
    /// child past the timer node and the parked execution stays — the job
    /// is rescheduled, never deleted. The last (or only) fire moves the
    /// parked execution itself forward and deletes the job.
    fn fire_timer(&self, ctx: &mut CommandContext, job: &Job) {
        match job.next_repeat() {
            Some(next) => {
                let due_at = next.due_at;
                let edges: Vec<String> = ctx
                    .definition
                    .outgoing(&job.node_id)
                    .iter()
                    .map(|f| f.id.clone())
                    .collect();
                for edge in edges {
                    let child = ctx
                        .state
                        .spawn_concurrent_child(job.execution_id, job.node_id.clone());
                    ctx.enqueue(Operation::TakeTransition {
                        execution: child,
                        edge,
                    });
                }
                ctx.record(RuntimeEvent::JobRescheduled {
                    job_id: job.id,
                    due_at,
                });
                ctx.record_job_op(JobOp::Update(next));
            }
            None => {
                ctx.enqueue(Operation::LeaveNode {
                    execution: job.execution_id,
                    node: job.node_id.clone(),
                });
                ctx.record(RuntimeEvent::JobCompleted { job_id: job.id });
                ctx.record_job_op(JobOp::Delete(job.id));
            }
        }
    }

    async fn check_stale(&self, job: &Job) -> Result<bool> {
        let Some(state) = self.store.load_instance(job.process_instance_id).await? else {
            return Ok(true);
        };
        if state.status.is_ended() {
            return Ok(true);
        }
        let Some(exec) = state.execution(job.execution_id) else {
            return Ok(true);
        };
        Ok(!exec.is_active || exec.current_node_id.as_deref() != Some(job.node_id.as_str()))
    }

    // ── Admin surface (dead-letter operations) ──

    pub async fn list_deadlettered_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_deadlettered_jobs().await?)
    }

    /// Restore a dead-lettered job's retry budget and make it due now.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<()> {
        self.store
            .reset_job_retries(job_id, self.config.default_job_retries)
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.store.delete_job(job_id).await?;
        Ok(())
    }

    // ── Internals ──

    fn interpreter(&self) -> Interpreter<'_> {
        Interpreter::new(&self.listeners, &self.handlers, &self.config)
    }

    async fn load(&self, instance_id: Uuid) -> Result<(Arc<ProcessDefinition>, InstanceState)> {
        let state = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        if state.status.is_ended() {
            return Err(EngineError::InstanceEnded(instance_id));
        }
        let definition = self
            .definition_version(&state.definition_key, state.definition_version)
            .await?;
        Ok((definition, state))
    }

    /// Instance-level exclusivity: one command at a time per instance.
    /// Entries no command holds or waits on (strong count 1, the map's own
    /// reference) are swept on each acquisition so the table stays bounded
    /// by the number of concurrently active instances.
    async fn lock_instance(&self, instance_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.instance_locks.lock().await;
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(instance_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn lock_table_size(&self) -> usize {
        self.instance_locks.lock().await.len()
    }
}

/// Next due date for a failed job under the configured exponential backoff.
pub fn backoff_due(config: &EngineConfig, retries_remaining: u32) -> chrono::DateTime<Utc> {
    Utc::now()
        + crate::job::backoff(
            config.retry_backoff_base_ms,
            config.default_job_retries,
            retries_remaining,
        )
}
