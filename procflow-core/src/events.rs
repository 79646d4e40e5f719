//! Runtime events — the durable audit trail for every process instance.
//! Appended atomically with the commit that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::{EdgeId, NodeId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: Uuid,
        definition_key: String,
    },
    NodeEntered {
        execution_id: Uuid,
        node_id: NodeId,
    },
    TransitionTaken {
        execution_id: Uuid,
        edge_id: EdgeId,
        from: NodeId,
        to: NodeId,
    },
    /// Parallel fork — one concurrent child per outgoing flow.
    Forked {
        parent_execution_id: Uuid,
        node_id: NodeId,
        children: Vec<Uuid>,
    },
    JoinArrived {
        execution_id: Uuid,
        node_id: NodeId,
        arrived: usize,
        expected: usize,
    },
    JoinReleased {
        node_id: NodeId,
        continued_execution_id: Uuid,
    },
    /// An active leaf parked awaiting external input or a job.
    WaitStateReached {
        execution_id: Uuid,
        node_id: NodeId,
    },
    VariableSet {
        scope_execution_id: Uuid,
        name: String,
        value: Value,
        revision: u32,
    },
    /// Behavior error caught by a modeled error boundary.
    ErrorRouted {
        execution_id: Uuid,
        node_id: NodeId,
        boundary_id: NodeId,
        error_code: Option<String>,
    },
    JobCreated {
        job_id: Uuid,
        execution_id: Uuid,
        node_id: NodeId,
        due_at: DateTime<Utc>,
    },
    JobCompleted {
        job_id: Uuid,
    },
    /// Repeating timer fired and rescheduled itself.
    JobRescheduled {
        job_id: Uuid,
        due_at: DateTime<Utc>,
    },
    JobFailed {
        job_id: Uuid,
        retries_remaining: u32,
        message: String,
    },
    JobDeadlettered {
        job_id: Uuid,
        message: String,
    },
    InstanceCompleted {
        instance_id: Uuid,
    },
    InstanceTerminated {
        instance_id: Uuid,
        cancelled_jobs: usize,
    },
}
