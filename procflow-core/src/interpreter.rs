//! The operation queue / interpreter loop.
//!
//! Given a triggering operation on one execution, the interpreter applies a
//! strictly ordered sequence of atomic graph-traversal operations until no
//! further operation is pending. At that point every active leaf is either
//! parked at a wait state or the instance has ended. Node behavior is a
//! closed dispatch on [`NodeKind`]; anything asynchronous becomes a job and
//! the transaction commits with the tree parked.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::command::CommandContext;
use crate::config::EngineConfig;
use crate::definition::{EdgeId, NodeId, NodeKind};
use crate::error::{BehaviorError, EngineError, Result};
use crate::events::RuntimeEvent;
use crate::execution::InstanceStatus;
use crate::job::{Job, JobKind, JobOp};
use crate::listener::{
    ExecutionInfo, HandlerRegistry, ListenerEvent, ListenerRegistry, ScopeVars,
};

/// Atomic graph-traversal operations, drained FIFO.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Enter a node and run its behavior.
    ExecuteNode { execution: Uuid, node: NodeId },
    /// Resume a deferred behavior (async continuation job firing). Start
    /// listeners already fired when the execution first entered the node.
    ContinueNode { execution: Uuid, node: NodeId },
    /// Fire end listeners and move on through the node's outgoing flow.
    LeaveNode { execution: Uuid, node: NodeId },
    /// Cross one sequence flow.
    TakeTransition { execution: Uuid, edge: EdgeId },
    /// Parallel split: one concurrent child per outgoing flow.
    Fork { execution: Uuid, node: NodeId },
    /// Parallel join arrival; releases once the activation is complete.
    Join { execution: Uuid, node: NodeId },
    /// Deactivate a leaf and propagate the end up the tree.
    EndExecution { execution: Uuid },
}

pub struct Interpreter<'a> {
    listeners: &'a ListenerRegistry,
    handlers: &'a HandlerRegistry,
    config: &'a EngineConfig,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        listeners: &'a ListenerRegistry,
        handlers: &'a HandlerRegistry,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            listeners,
            handlers,
            config,
        }
    }

    /// Drain the operation queue to quiescence. On error the caller drops
    /// the context unconsumed — nothing reaches the store.
    pub async fn run(&self, ctx: &mut CommandContext) -> Result<()> {
        let mut steps = 0usize;
        while let Some(op) = ctx.next_op() {
            steps += 1;
            if steps > self.config.max_operations_per_command {
                return Err(EngineError::OperationLimit(
                    self.config.max_operations_per_command,
                ));
            }
            tracing::trace!(?op, step = steps, "applying operation");
            self.apply(ctx, op).await?;
        }
        Ok(())
    }

    async fn apply(&self, ctx: &mut CommandContext, op: Operation) -> Result<()> {
        match op {
            Operation::ExecuteNode { execution, node } => {
                self.execute_node(ctx, execution, node).await
            }
            Operation::ContinueNode { execution, node } => {
                self.continue_node(ctx, execution, node).await
            }
            Operation::LeaveNode { execution, node } => self.leave_node(ctx, execution, node),
            Operation::TakeTransition { execution, edge } => {
                self.take_transition(ctx, execution, edge)
            }
            Operation::Fork { execution, node } => self.fork(ctx, execution, node),
            Operation::Join { execution, node } => self.join(ctx, execution, node),
            Operation::EndExecution { execution } => self.end_execution(ctx, execution),
        }
    }

    // ── Node behaviors ──

    async fn execute_node(
        &self,
        ctx: &mut CommandContext,
        execution: Uuid,
        node: NodeId,
    ) -> Result<()> {
        let definition = ctx.definition.clone();
        let kind = definition
            .node(&node)
            .ok_or_else(|| EngineError::UnknownElement(node.clone()))?
            .kind
            .clone();

        let exec = ctx
            .state
            .execution_mut(execution)
            .ok_or(EngineError::ExecutionNotFound(execution))?;
        exec.current_node_id = Some(node.clone());
        ctx.record(RuntimeEvent::NodeEntered {
            execution_id: execution,
            node_id: node.clone(),
        });

        if let Err(err) = self.fire_listeners(ctx, &node, ListenerEvent::NodeStart, execution) {
            return self.route_or_fail(ctx, execution, &node, err);
        }

        match kind {
            NodeKind::StartEvent => {
                ctx.enqueue(Operation::LeaveNode { execution, node });
                Ok(())
            }

            NodeKind::EndEvent => {
                if let Err(err) =
                    self.fire_listeners(ctx, &node, ListenerEvent::NodeEnd, execution)
                {
                    return self.route_or_fail(ctx, execution, &node, err);
                }
                ctx.enqueue(Operation::EndExecution { execution });
                Ok(())
            }

            NodeKind::UserTask => {
                // Wait state: parked until the command API completes it.
                ctx.record(RuntimeEvent::WaitStateReached {
                    execution_id: execution,
                    node_id: node,
                });
                Ok(())
            }

            NodeKind::ServiceTask {
                handler,
                asynchronous,
            } => {
                if asynchronous {
                    self.schedule_job(ctx, execution, node, JobKind::AsyncContinuation, 0);
                    Ok(())
                } else {
                    match self.invoke_handler(ctx, execution, &node, &handler).await {
                        Ok(()) => {
                            ctx.enqueue(Operation::LeaveNode { execution, node });
                            Ok(())
                        }
                        Err(err) => self.route_or_fail(ctx, execution, &node, err),
                    }
                }
            }

            NodeKind::TimerEvent { timer } => {
                self.schedule_job(
                    ctx,
                    execution,
                    node,
                    JobKind::Timer {
                        repeat: timer.repeat.clone(),
                    },
                    timer.delay_ms,
                );
                Ok(())
            }

            NodeKind::ExclusiveGateway => {
                let edge = self.choose_exclusive_flow(ctx, execution, &node)?;
                if let Err(err) =
                    self.fire_listeners(ctx, &node, ListenerEvent::NodeEnd, execution)
                {
                    return self.route_or_fail(ctx, execution, &node, err);
                }
                ctx.enqueue(Operation::TakeTransition { execution, edge });
                Ok(())
            }

            NodeKind::ParallelGateway => {
                let fan_in = ctx.definition.incoming(&node).len();
                let fan_out = ctx.definition.outgoing(&node).len();
                if fan_in > 1 {
                    ctx.enqueue(Operation::Join { execution, node });
                } else if fan_out > 1 {
                    ctx.enqueue(Operation::Fork { execution, node });
                } else {
                    ctx.enqueue(Operation::LeaveNode { execution, node });
                }
                Ok(())
            }

            // Boundaries are normally reached by error routing, which jumps
            // straight to LeaveNode; an explicitly modeled flow into one
            // behaves as a pass-through.
            NodeKind::ErrorBoundary { .. } => {
                ctx.enqueue(Operation::LeaveNode { execution, node });
                Ok(())
            }
        }
    }

    async fn continue_node(
        &self,
        ctx: &mut CommandContext,
        execution: Uuid,
        node: NodeId,
    ) -> Result<()> {
        let definition = ctx.definition.clone();
        let kind = definition
            .node(&node)
            .ok_or_else(|| EngineError::UnknownElement(node.clone()))?
            .kind
            .clone();
        match kind {
            NodeKind::ServiceTask { handler, .. } => {
                match self.invoke_handler(ctx, execution, &node, &handler).await {
                    Ok(()) => {
                        ctx.enqueue(Operation::LeaveNode { execution, node });
                        Ok(())
                    }
                    Err(err) => self.route_or_fail(ctx, execution, &node, err),
                }
            }
            _ => {
                ctx.enqueue(Operation::LeaveNode { execution, node });
                Ok(())
            }
        }
    }

    fn leave_node(&self, ctx: &mut CommandContext, execution: Uuid, node: NodeId) -> Result<()> {
        if let Err(err) = self.fire_listeners(ctx, &node, ListenerEvent::NodeEnd, execution) {
            return self.route_or_fail(ctx, execution, &node, err);
        }
        let outgoing: Vec<EdgeId> = ctx
            .definition
            .outgoing(&node)
            .iter()
            .map(|f| f.id.clone())
            .collect();
        match outgoing.len() {
            0 => ctx.enqueue(Operation::EndExecution { execution }),
            1 => ctx.enqueue(Operation::TakeTransition {
                execution,
                edge: outgoing.into_iter().next().unwrap_or_default(),
            }),
            // Only parallel gateways carry multiple outgoing flows past the
            // builder, and those arrive here only on the join-release path.
            _ => ctx.enqueue(Operation::Fork { execution, node }),
        }
        Ok(())
    }

    fn take_transition(
        &self,
        ctx: &mut CommandContext,
        execution: Uuid,
        edge: EdgeId,
    ) -> Result<()> {
        let definition = ctx.definition.clone();
        let flow = definition
            .flow(&edge)
            .ok_or_else(|| EngineError::UnknownElement(edge.clone()))?;

        if let Err(err) =
            self.fire_listeners(ctx, &flow.id, ListenerEvent::TransitionTake, execution)
        {
            return self.route_or_fail(ctx, execution, &flow.from, err);
        }

        let exec = ctx
            .state
            .execution_mut(execution)
            .ok_or(EngineError::ExecutionNotFound(execution))?;
        exec.current_node_id = Some(flow.to.clone());
        ctx.record(RuntimeEvent::TransitionTaken {
            execution_id: execution,
            edge_id: flow.id.clone(),
            from: flow.from.clone(),
            to: flow.to.clone(),
        });
        ctx.enqueue(Operation::ExecuteNode {
            execution,
            node: flow.to.clone(),
        });
        Ok(())
    }

    fn fork(&self, ctx: &mut CommandContext, execution: Uuid, node: NodeId) -> Result<()> {
        if let Err(err) = self.fire_listeners(ctx, &node, ListenerEvent::NodeEnd, execution) {
            return self.route_or_fail(ctx, execution, &node, err);
        }
        let edges: Vec<EdgeId> = ctx
            .definition
            .outgoing(&node)
            .iter()
            .map(|f| f.id.clone())
            .collect();

        // The arriving execution becomes the inactive inner parent of the
        // concurrent branches.
        let exec = ctx
            .state
            .execution_mut(execution)
            .ok_or(EngineError::ExecutionNotFound(execution))?;
        exec.is_active = false;
        exec.current_node_id = None;

        let mut children = Vec::with_capacity(edges.len());
        for edge in edges {
            let child = ctx.state.spawn_concurrent_child(execution, node.clone());
            children.push(child);
            ctx.enqueue(Operation::TakeTransition {
                execution: child,
                edge,
            });
        }
        ctx.record(RuntimeEvent::Forked {
            parent_execution_id: execution,
            node_id: node,
            children,
        });
        Ok(())
    }

    fn join(&self, ctx: &mut CommandContext, execution: Uuid, node: NodeId) -> Result<()> {
        let expected = ctx.definition.incoming(&node).len();

        let exec = ctx
            .state
            .execution_mut(execution)
            .ok_or(EngineError::ExecutionNotFound(execution))?;
        let parent = exec.parent_id;
        // Arrivals park absorbed at the gateway until the activation is
        // complete.
        exec.is_active = false;
        exec.current_node_id = Some(node.clone());

        let arrived_ids: Vec<Uuid> = match parent {
            Some(p) => ctx
                .state
                .children_of(p)
                .iter()
                .filter(|e| {
                    e.is_concurrent
                        && !e.is_active
                        && e.current_node_id.as_deref() == Some(node.as_str())
                })
                .map(|e| e.id)
                .collect(),
            None => Vec::new(),
        };

        ctx.record(RuntimeEvent::JoinArrived {
            execution_id: execution,
            node_id: node.clone(),
            arrived: arrived_ids.len(),
            expected,
        });

        let Some(parent) = parent else {
            // A sole root token walked into a join; with fan-in > 1 it is
            // silently absorbed until siblings that will never come.
            return Ok(());
        };

        if arrived_ids.len() >= expected {
            for id in arrived_ids {
                ctx.state.remove_execution(id);
            }
            let parent_exec = ctx
                .state
                .execution_mut(parent)
                .ok_or(EngineError::ExecutionNotFound(parent))?;
            parent_exec.is_active = true;
            parent_exec.current_node_id = Some(node.clone());
            ctx.record(RuntimeEvent::JoinReleased {
                node_id: node.clone(),
                continued_execution_id: parent,
            });

            if ctx.definition.outgoing(&node).len() > 1 {
                ctx.enqueue(Operation::Fork {
                    execution: parent,
                    node,
                });
            } else {
                ctx.enqueue(Operation::LeaveNode {
                    execution: parent,
                    node,
                });
            }
        }
        Ok(())
    }

    fn end_execution(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let root = ctx.state.root_execution_id();
        if execution == root {
            let exec = ctx
                .state
                .execution_mut(execution)
                .ok_or(EngineError::ExecutionNotFound(execution))?;
            exec.is_active = false;
            exec.current_node_id = None;
            if ctx.state.children_of(root).is_empty() {
                ctx.state.status = InstanceStatus::Completed;
                ctx.record(RuntimeEvent::InstanceCompleted {
                    instance_id: ctx.state.instance_id,
                });
            }
            return Ok(());
        }

        let parent = ctx
            .state
            .execution(execution)
            .ok_or(EngineError::ExecutionNotFound(execution))?
            .parent_id;
        ctx.state.remove_execution(execution);

        if let Some(parent) = parent {
            let parent_active = ctx
                .state
                .execution(parent)
                .map(|e| e.is_active)
                .unwrap_or(false);
            // An inner parent with no children left ends too. An *active*
            // parent is itself a parked leaf (repeating-timer spawn point)
            // and stays.
            if ctx.state.children_of(parent).is_empty() && !parent_active {
                ctx.enqueue(Operation::EndExecution { execution: parent });
            }
        }
        Ok(())
    }

    // ── Helpers ──

    fn choose_exclusive_flow(
        &self,
        ctx: &CommandContext,
        execution: Uuid,
        node: &str,
    ) -> Result<EdgeId> {
        let outgoing = ctx.definition.outgoing(node);
        let lookup = |name: &str| ctx.state.get_variable(execution, name).cloned();

        let matched = outgoing.iter().find(|f| {
            !f.is_default
                && f.condition
                    .as_ref()
                    .map(|c| c.evaluate(&lookup))
                    .unwrap_or(true)
        });
        let chosen = matched.or_else(|| outgoing.iter().find(|f| f.is_default));

        chosen.map(|f| f.id.clone()).ok_or_else(|| {
            EngineError::NoFlowTaken {
                node: node.to_string(),
                reason: "no guard matched and no default flow is configured".into(),
            }
        })
    }

    fn schedule_job(
        &self,
        ctx: &mut CommandContext,
        execution: Uuid,
        node: NodeId,
        kind: JobKind,
        delay_ms: u64,
    ) {
        let job = Job::new(
            kind,
            ctx.state.instance_id,
            execution,
            node.clone(),
            Utc::now() + Duration::milliseconds(delay_ms as i64),
            self.config.default_job_retries,
        );
        ctx.record(RuntimeEvent::JobCreated {
            job_id: job.id,
            execution_id: execution,
            node_id: node.clone(),
            due_at: job.due_at,
        });
        ctx.record(RuntimeEvent::WaitStateReached {
            execution_id: execution,
            node_id: node,
        });
        ctx.record_job_op(JobOp::Create(job));
    }

    fn fire_listeners(
        &self,
        ctx: &mut CommandContext,
        element_id: &str,
        event: ListenerEvent,
        execution: Uuid,
    ) -> std::result::Result<(), BehaviorError> {
        let info = ExecutionInfo {
            execution_id: execution,
            process_instance_id: ctx.state.instance_id,
            node_id: ctx
                .state
                .execution(execution)
                .and_then(|e| e.current_node_id.clone()),
        };
        let mut vars = ScopeVars::new(&mut ctx.state, execution);
        self.listeners.fire(element_id, event, &info, &mut vars)
    }

    async fn invoke_handler(
        &self,
        ctx: &mut CommandContext,
        execution: Uuid,
        node: &str,
        handler_name: &str,
    ) -> std::result::Result<(), BehaviorError> {
        let handler = self.handlers.get(handler_name).ok_or_else(|| {
            BehaviorError::new(format!(
                "no handler registered under '{handler_name}' for node '{node}'"
            ))
        })?;
        let info = ExecutionInfo {
            execution_id: execution,
            process_instance_id: ctx.state.instance_id,
            node_id: Some(node.to_string()),
        };
        let mut vars = ScopeVars::new(&mut ctx.state, execution);
        handler.execute(&info, &mut vars).await
    }

    /// Behavior/listener errors consult the error boundaries attached to
    /// the failing node; a match reroutes the execution, otherwise the
    /// whole command aborts.
    fn route_or_fail(
        &self,
        ctx: &mut CommandContext,
        execution: Uuid,
        node: &str,
        err: BehaviorError,
    ) -> Result<()> {
        let definition = ctx.definition.clone();
        for boundary in definition.boundaries_of(node) {
            let NodeKind::ErrorBoundary { error_code, .. } = &boundary.kind else {
                continue;
            };
            let caught = match (error_code, &err.code) {
                (None, _) => true,
                (Some(expected), Some(raised)) => expected == raised,
                (Some(_), None) => false,
            };
            if caught {
                ctx.record(RuntimeEvent::ErrorRouted {
                    execution_id: execution,
                    node_id: node.to_string(),
                    boundary_id: boundary.id.clone(),
                    error_code: err.code.clone(),
                });
                if let Some(exec) = ctx.state.execution_mut(execution) {
                    exec.current_node_id = Some(boundary.id.clone());
                }
                ctx.enqueue(Operation::LeaveNode {
                    execution,
                    node: boundary.id.clone(),
                });
                return Ok(());
            }
        }
        Err(EngineError::Behavior {
            node: node.to_string(),
            source: err,
        })
    }
}
