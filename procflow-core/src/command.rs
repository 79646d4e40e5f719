//! The command/transaction boundary.
//!
//! A command wraps exactly one trigger-to-stable-state cycle. It owns a
//! deep-cloned [`InstanceState`] snapshot, an operation queue, and the job
//! and event writes accumulated while the interpreter drains the queue.
//! Nothing touches the store mid-loop; on success everything lands in one
//! [`crate::store::EngineStore::commit`], and on any failure the context is
//! simply dropped — partial traversals are never visible outside the
//! transaction.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::events::RuntimeEvent;
use crate::execution::InstanceState;
use crate::interpreter::Operation;
use crate::job::JobOp;
use crate::store::CommandCommit;

pub struct CommandContext {
    pub definition: Arc<ProcessDefinition>,
    pub state: InstanceState,
    pub(crate) ops: VecDeque<Operation>,
    pub(crate) job_ops: Vec<JobOp>,
    pub(crate) events: Vec<RuntimeEvent>,
}

impl CommandContext {
    pub fn new(definition: Arc<ProcessDefinition>, state: InstanceState) -> Self {
        Self {
            definition,
            state,
            ops: VecDeque::new(),
            job_ops: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Enqueue an atomic operation at the back of the queue (FIFO drain
    /// order linearizes everything one command does).
    pub fn enqueue(&mut self, op: Operation) {
        self.ops.push_back(op);
    }

    pub(crate) fn next_op(&mut self) -> Option<Operation> {
        self.ops.pop_front()
    }

    pub fn record(&mut self, event: RuntimeEvent) {
        self.events.push(event);
    }

    pub fn record_job_op(&mut self, op: JobOp) {
        self.job_ops.push(op);
    }

    /// Variable write that also lands in the audit trail.
    pub fn set_variable(&mut self, execution: Uuid, name: &str, value: Value) {
        let (scope, revision) = self.state.set_variable(execution, name, value.clone());
        self.events.push(RuntimeEvent::VariableSet {
            scope_execution_id: scope,
            name: name.to_string(),
            value,
            revision,
        });
    }

    pub fn into_commit(self) -> CommandCommit {
        CommandCommit {
            state: self.state,
            job_ops: self.job_ops,
            events: self.events,
        }
    }
}
