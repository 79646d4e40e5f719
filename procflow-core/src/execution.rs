//! The execution tree — the mutable runtime state of one process instance.
//!
//! Executions form an arena keyed by id with parent/child links expressed as
//! id references. The whole tree plus variable scopes lives in one
//! [`InstanceState`] value, which a command deep-clones as its transactional
//! snapshot and writes back wholesale on commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::definition::NodeId;

/// One token of control through the process graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    /// `None` for the root execution.
    pub parent_id: Option<Uuid>,
    /// Node the execution is at; `None` mid-transition or for an inner
    /// execution whose children carry the tokens.
    pub current_node_id: Option<NodeId>,
    pub is_active: bool,
    /// Owns its own variable frame.
    pub is_scope: bool,
    /// Sibling of a parallel fork.
    pub is_concurrent: bool,
}

/// A single variable in a scope frame. Names are unique per scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: Value,
    pub revision: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Terminated,
}

impl InstanceStatus {
    pub fn is_ended(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

/// Full mutable state of one process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: Uuid,
    pub definition_key: String,
    pub definition_version: [u8; 32],
    pub status: InstanceStatus,
    pub executions: BTreeMap<Uuid, Execution>,
    /// Variable frames keyed by owning scope execution.
    pub variables: BTreeMap<Uuid, BTreeMap<String, Variable>>,
    root_execution_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl InstanceState {
    /// Create a fresh instance with its root execution (a scope, active, not
    /// yet positioned at a node).
    pub fn new(definition_key: String, definition_version: [u8; 32]) -> Self {
        let instance_id = Uuid::now_v7();
        let root_id = Uuid::now_v7();
        let root = Execution {
            id: root_id,
            process_instance_id: instance_id,
            parent_id: None,
            current_node_id: None,
            is_active: true,
            is_scope: true,
            is_concurrent: false,
        };
        Self {
            instance_id,
            definition_key,
            definition_version,
            status: InstanceStatus::Running,
            executions: BTreeMap::from([(root_id, root)]),
            variables: BTreeMap::new(),
            root_execution_id: root_id,
            created_at: Utc::now(),
        }
    }

    pub fn root_execution_id(&self) -> Uuid {
        self.root_execution_id
    }

    pub fn execution(&self, id: Uuid) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn execution_mut(&mut self, id: Uuid) -> Option<&mut Execution> {
        self.executions.get_mut(&id)
    }

    pub fn children_of(&self, parent: Uuid) -> Vec<&Execution> {
        self.executions
            .values()
            .filter(|e| e.parent_id == Some(parent))
            .collect()
    }

    /// Spawn a concurrent child under `parent`. The child shares the parent
    /// scope (`is_scope = false`) so sibling branches see the same variables.
    pub fn spawn_concurrent_child(&mut self, parent: Uuid, at_node: NodeId) -> Uuid {
        let id = Uuid::now_v7();
        let child = Execution {
            id,
            process_instance_id: self.instance_id,
            parent_id: Some(parent),
            current_node_id: Some(at_node),
            is_active: true,
            is_scope: false,
            is_concurrent: true,
        };
        self.executions.insert(id, child);
        id
    }

    /// Remove an execution and its variable frame. Descendants are the
    /// caller's responsibility.
    pub fn remove_execution(&mut self, id: Uuid) {
        self.executions.remove(&id);
        self.variables.remove(&id);
    }

    /// Remove an execution together with every descendant.
    pub fn remove_subtree(&mut self, id: Uuid) {
        let children: Vec<Uuid> = self.children_of(id).iter().map(|e| e.id).collect();
        for child in children {
            self.remove_subtree(child);
        }
        self.remove_execution(id);
    }

    /// Active leaf executions — the parked tokens a wait state consists of.
    pub fn active_leaves(&self) -> Vec<&Execution> {
        self.executions
            .values()
            .filter(|e| e.is_active && self.children_of(e.id).is_empty())
            .collect()
    }

    // ── Variable scoping ──

    /// Nearest enclosing scope execution of `execution` (itself included).
    pub fn nearest_scope(&self, execution: Uuid) -> Option<Uuid> {
        let mut cursor = self.execution(execution)?;
        loop {
            if cursor.is_scope {
                return Some(cursor.id);
            }
            cursor = self.execution(cursor.parent_id?)?;
        }
    }

    /// Walk from `execution` up the ancestor chain to the nearest scope
    /// owning `name`.
    fn owning_scope(&self, execution: Uuid, name: &str) -> Option<Uuid> {
        let mut cursor = self.execution(execution)?;
        loop {
            if cursor.is_scope {
                if let Some(frame) = self.variables.get(&cursor.id) {
                    if frame.contains_key(name) {
                        return Some(cursor.id);
                    }
                }
            }
            cursor = self.execution(cursor.parent_id?)?;
        }
    }

    pub fn get_variable(&self, execution: Uuid, name: &str) -> Option<&Value> {
        let scope = self.owning_scope(execution, name)?;
        self.variables.get(&scope)?.get(name).map(|v| &v.value)
    }

    /// Write targets the nearest existing owner; if no ancestor owns the
    /// name, the variable is created in the execution's nearest scope.
    /// Returns the owning scope and the revision written.
    pub fn set_variable(&mut self, execution: Uuid, name: &str, value: Value) -> (Uuid, u32) {
        let scope = self
            .owning_scope(execution, name)
            .or_else(|| self.nearest_scope(execution))
            .unwrap_or(self.root_execution_id);
        let frame = self.variables.entry(scope).or_default();
        match frame.get_mut(name) {
            Some(var) => {
                var.value = value;
                var.revision += 1;
                (scope, var.revision)
            }
            None => {
                frame.insert(
                    name.to_string(),
                    Variable {
                        name: name.to_string(),
                        value,
                        revision: 0,
                    },
                );
                (scope, 0)
            }
        }
    }

    /// Every variable visible from `execution`, inner scopes shadowing
    /// outer ones.
    pub fn visible_variables(&self, execution: Uuid) -> BTreeMap<String, Value> {
        let mut chain = Vec::new();
        let mut cursor = self.execution(execution);
        while let Some(exec) = cursor {
            if exec.is_scope {
                chain.push(exec.id);
            }
            cursor = exec.parent_id.and_then(|p| self.execution(p));
        }
        // Outermost first so inner frames overwrite.
        let mut out = BTreeMap::new();
        for scope in chain.into_iter().rev() {
            if let Some(frame) = self.variables.get(&scope) {
                for (name, var) in frame {
                    out.insert(name.clone(), var.value.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> InstanceState {
        InstanceState::new("order".into(), [0u8; 32])
    }

    #[test]
    fn root_execution_is_an_active_scope() {
        let s = state();
        let root = s.execution(s.root_execution_id()).unwrap();
        assert!(root.is_active);
        assert!(root.is_scope);
        assert!(!root.is_concurrent);
        assert!(root.parent_id.is_none());
    }

    #[test]
    fn concurrent_children_share_the_parent_frame() {
        let mut s = state();
        let root = s.root_execution_id();
        s.set_variable(root, "total", json!(100));

        let a = s.spawn_concurrent_child(root, "branch-a".into());
        let b = s.spawn_concurrent_child(root, "branch-b".into());

        // Both branches read the root frame.
        assert_eq!(s.get_variable(a, "total"), Some(&json!(100)));
        assert_eq!(s.get_variable(b, "total"), Some(&json!(100)));

        // A write from one branch to an existing name lands in the root
        // frame and is visible to the sibling.
        s.set_variable(a, "total", json!(150));
        assert_eq!(s.get_variable(b, "total"), Some(&json!(150)));

        // A brand-new name also lands in the nearest scope, which for a
        // non-scope child is the root.
        s.set_variable(b, "note", json!("hi"));
        assert_eq!(s.get_variable(a, "note"), Some(&json!("hi")));
    }

    #[test]
    fn revisions_bump_on_every_overwrite() {
        let mut s = state();
        let root = s.root_execution_id();
        s.set_variable(root, "n", json!(1));
        s.set_variable(root, "n", json!(2));
        s.set_variable(root, "n", json!(3));
        let var = &s.variables[&root]["n"];
        assert_eq!(var.revision, 2);
        assert_eq!(var.value, json!(3));
    }

    #[test]
    fn remove_subtree_drops_descendants_and_frames() {
        let mut s = state();
        let root = s.root_execution_id();
        let a = s.spawn_concurrent_child(root, "a".into());
        let aa = s.spawn_concurrent_child(a, "aa".into());
        assert_eq!(s.executions.len(), 3);

        s.remove_subtree(a);
        assert_eq!(s.executions.len(), 1);
        assert!(s.execution(aa).is_none());
    }

    #[test]
    fn active_leaves_skip_inner_executions() {
        let mut s = state();
        let root = s.root_execution_id();
        let a = s.spawn_concurrent_child(root, "a".into());
        let b = s.spawn_concurrent_child(root, "b".into());

        let leaves: Vec<Uuid> = s.active_leaves().iter().map(|e| e.id).collect();
        assert!(leaves.contains(&a));
        assert!(leaves.contains(&b));
        assert!(!leaves.contains(&root));
    }
}
