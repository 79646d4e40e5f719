//! Extension points: execution listeners and service-task handlers.
//!
//! Listeners are synchronous by contract — they run fully inside the
//! enclosing command's transaction and must not span wait states, so the
//! trait offers no way to await. Service-task handlers carry the actual
//! business logic and are async; an asynchronous task defers the call to a
//! job instead of running it inside the triggering command.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::definition::NodeId;
use crate::error::BehaviorError;
use crate::execution::InstanceState;

/// Read-only identity of the execution a hook runs against.
#[derive(Clone, Debug)]
pub struct ExecutionInfo {
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub node_id: Option<NodeId>,
}

/// Read/write view of the variables visible to one execution, scoped the
/// same way the interpreter scopes them.
pub struct ScopeVars<'a> {
    state: &'a mut InstanceState,
    execution: Uuid,
}

impl<'a> ScopeVars<'a> {
    pub(crate) fn new(state: &'a mut InstanceState, execution: Uuid) -> Self {
        Self { state, execution }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.state.get_variable(self.execution, name).cloned()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.state.set_variable(self.execution, name, value);
    }

    pub fn all(&self) -> BTreeMap<String, Value> {
        self.state.visible_variables(self.execution)
    }
}

/// Transition points at which listeners fire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerEvent {
    NodeStart,
    NodeEnd,
    /// Sequence-flow take; the registration key is the flow id.
    TransitionTake,
}

/// Synchronous extension hook. An error aborts the enclosing command
/// exactly as a node-behavior error would (boundary routing included).
pub trait ExecutionListener: Send + Sync {
    fn notify(
        &self,
        execution: &ExecutionInfo,
        event: ListenerEvent,
        vars: &mut ScopeVars<'_>,
    ) -> Result<(), BehaviorError>;
}

impl<F> ExecutionListener for F
where
    F: Fn(&ExecutionInfo, ListenerEvent, &mut ScopeVars<'_>) -> Result<(), BehaviorError>
        + Send
        + Sync,
{
    fn notify(
        &self,
        execution: &ExecutionInfo,
        event: ListenerEvent,
        vars: &mut ScopeVars<'_>,
    ) -> Result<(), BehaviorError> {
        self(execution, event, vars)
    }
}

/// Registered listeners, invoked in registration order: global listeners
/// first, then the ones keyed to the (element id, event) pair.
#[derive(Default)]
pub struct ListenerRegistry {
    global: Vec<Arc<dyn ExecutionListener>>,
    keyed: HashMap<(String, ListenerEvent), Vec<Arc<dyn ExecutionListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_global(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.global.push(listener);
    }

    /// `element_id` is a node id for NodeStart/NodeEnd and a flow id for
    /// TransitionTake.
    pub fn register(
        &mut self,
        element_id: impl Into<String>,
        event: ListenerEvent,
        listener: Arc<dyn ExecutionListener>,
    ) {
        self.keyed
            .entry((element_id.into(), event))
            .or_default()
            .push(listener);
    }

    pub fn fire(
        &self,
        element_id: &str,
        event: ListenerEvent,
        execution: &ExecutionInfo,
        vars: &mut ScopeVars<'_>,
    ) -> Result<(), BehaviorError> {
        for listener in &self.global {
            listener.notify(execution, event, vars)?;
        }
        if let Some(listeners) = self.keyed.get(&(element_id.to_string(), event)) {
            for listener in listeners {
                listener.notify(execution, event, vars)?;
            }
        }
        Ok(())
    }
}

/// Business-logic behavior of a service task.
#[async_trait::async_trait]
pub trait ServiceTaskHandler: Send + Sync {
    async fn execute(
        &self,
        execution: &ExecutionInfo,
        vars: &mut ScopeVars<'_>,
    ) -> Result<(), BehaviorError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ServiceTaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServiceTaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceTaskHandler>> {
        self.handlers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listeners_fire_in_registration_order_and_short_circuit() {
        let mut registry = ListenerRegistry::new();
        registry.register(
            "task",
            ListenerEvent::NodeStart,
            Arc::new(
                |_: &ExecutionInfo, _: ListenerEvent, vars: &mut ScopeVars<'_>| {
                    let n = vars.get("calls").and_then(|v| v.as_i64()).unwrap_or(0);
                    vars.set("calls", json!(n + 1));
                    Ok(())
                },
            ),
        );
        registry.register(
            "task",
            ListenerEvent::NodeStart,
            Arc::new(
                |_: &ExecutionInfo, _: ListenerEvent, _: &mut ScopeVars<'_>| {
                    Err(BehaviorError::new("second listener fails"))
                },
            ),
        );
        registry.register(
            "task",
            ListenerEvent::NodeStart,
            Arc::new(
                |_: &ExecutionInfo, _: ListenerEvent, vars: &mut ScopeVars<'_>| {
                    vars.set("calls", json!(99));
                    Ok(())
                },
            ),
        );

        let mut state = InstanceState::new("p".into(), [0u8; 32]);
        let root = state.root_execution_id();
        let info = ExecutionInfo {
            execution_id: root,
            process_instance_id: state.instance_id,
            node_id: Some("task".into()),
        };

        let mut vars = ScopeVars::new(&mut state, root);
        let result = registry.fire("task", ListenerEvent::NodeStart, &info, &mut vars);

        assert!(result.is_err());
        // First listener ran, third never did.
        assert_eq!(state.get_variable(root, "calls"), Some(&json!(1)));
    }
}
