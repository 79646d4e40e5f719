//! The immutable process definition graph.
//!
//! Produced by an external parser/deployer and shared read-only across every
//! instance and worker. The engine trusts the invariants the builder
//! enforces (single start node, fixed gateway fan-in/out, at most one
//! outgoing flow on non-gateway nodes) and does no further validation.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Graph node identifier (stable across deployments of the same model).
pub type NodeId = String;

/// Sequence-flow identifier.
pub type EdgeId = String;

// ── Conditions ──

/// Guard expression on a sequence flow, evaluated against the variables
/// visible to the crossing execution. A closed evaluator — conditions are
/// data, not code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// True when the named variable is set and truthy (bool true, non-zero
    /// number, non-empty string).
    IsTrue(String),
    Equals(String, Value),
    NotEquals(String, Value),
}

impl Condition {
    pub fn evaluate(&self, lookup: impl Fn(&str) -> Option<Value>) -> bool {
        match self {
            Condition::IsTrue(name) => lookup(name).map(|v| is_truthy(&v)).unwrap_or(false),
            Condition::Equals(name, expected) => {
                lookup(name).map(|v| &v == expected).unwrap_or(false)
            }
            Condition::NotEquals(name, expected) => {
                lookup(name).map(|v| &v != expected).unwrap_or(false)
            }
        }
    }
}

pub(crate) fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ── Timers ──

/// Repeating timer cycle, ISO 8601 `R[n]/PT…` form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    /// Interval between fires in milliseconds.
    pub interval_ms: u64,
    /// Remaining fires. `None` = unbounded.
    pub remaining: Option<u32>,
}

impl RepeatSpec {
    /// Parse the cycle form: `R/PT10S`, `R3/PT1M`, `R5/PT2H`.
    /// Only the `PT` duration designators S, M and H are supported.
    pub fn parse(spec: &str) -> Result<Self> {
        let rest = spec
            .strip_prefix('R')
            .ok_or_else(|| anyhow!("repeat spec must start with 'R': {spec}"))?;
        let (count, duration) = rest
            .split_once('/')
            .ok_or_else(|| anyhow!("repeat spec missing '/': {spec}"))?;
        let remaining = if count.is_empty() {
            None
        } else {
            Some(count.parse::<u32>()?)
        };
        let body = duration
            .strip_prefix("PT")
            .ok_or_else(|| anyhow!("repeat duration must start with 'PT': {spec}"))?;
        if body.is_empty() {
            bail!("empty repeat duration: {spec}");
        }
        let mut interval_ms: u64 = 0;
        let mut digits = String::new();
        for ch in body.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            let n: u64 = digits.parse().map_err(|_| anyhow!("bad duration: {spec}"))?;
            digits.clear();
            let ms = match ch {
                'S' => n.checked_mul(1_000),
                'M' => n.checked_mul(60_000),
                'H' => n.checked_mul(3_600_000),
                other => bail!("unsupported duration designator '{other}' in {spec}"),
            };
            interval_ms = ms
                .and_then(|ms| interval_ms.checked_add(ms))
                .ok_or_else(|| anyhow!("repeat duration overflows: {spec}"))?;
        }
        if !digits.is_empty() {
            bail!("trailing digits without designator: {spec}");
        }
        Ok(Self {
            interval_ms,
            remaining,
        })
    }
}

/// Timer behavior parameters for an intermediate timer event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerSpec {
    /// Delay before the first fire, in milliseconds from node entry.
    pub delay_ms: u64,
    /// If set, the timer re-fires on this cycle after the first fire.
    pub repeat: Option<RepeatSpec>,
}

// ── Nodes ──

/// The closed set of node behaviors the interpreter dispatches on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    /// Wait state — completed externally via the command API.
    UserTask,
    /// Invokes the registered handler. `asynchronous` defers the invocation
    /// to a job instead of running inside the triggering command.
    ServiceTask {
        handler: String,
        asynchronous: bool,
    },
    ExclusiveGateway,
    ParallelGateway,
    /// Intermediate timer — parks the execution and schedules a timer job.
    TimerEvent { timer: TimerSpec },
    /// Catches behavior errors raised at `attached_to`. `error_code: None`
    /// is a catch-all; coded boundaries match before the catch-all.
    ErrorBoundary {
        attached_to: NodeId,
        error_code: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

/// Directed sequence flow between two nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub condition: Option<Condition>,
    /// Taken from an exclusive gateway only when no conditioned flow matches.
    pub is_default: bool,
}

// ── Definition ──

/// Immutable, validated process definition. Safe to share via `Arc` across
/// instances and workers without locking.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub key: String,
    /// SHA-256 over the canonical serialized graph, the version identity.
    pub version: [u8; 32],
    nodes: BTreeMap<NodeId, Node>,
    flows: Vec<SequenceFlow>,
    start_node: NodeId,
}

impl ProcessDefinition {
    pub fn start_node(&self) -> &NodeId {
        &self.start_node
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// Outgoing flows of a node, in declaration order. Declaration order is
    /// the evaluation order at exclusive gateways.
    pub fn outgoing(&self, node: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.from == node).collect()
    }

    pub fn incoming(&self, node: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.to == node).collect()
    }

    /// Error boundaries attached to a node, coded boundaries first so a
    /// specific match beats the catch-all.
    pub fn boundaries_of(&self, node: &str) -> Vec<&Node> {
        let mut found: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| {
                matches!(&n.kind, NodeKind::ErrorBoundary { attached_to, .. } if attached_to == node)
            })
            .collect();
        found.sort_by_key(|n| {
            matches!(
                &n.kind,
                NodeKind::ErrorBoundary {
                    error_code: None,
                    ..
                }
            )
        });
        found
    }

    pub fn version_hex(&self) -> String {
        self.version.iter().map(|b| format!("{b:02x}")).collect()
    }
}

// ── Builder ──

/// Assembles and validates a definition. Stands in for the external
/// parser/deployer in tests and embedders.
pub struct DefinitionBuilder {
    key: String,
    nodes: BTreeMap<NodeId, Node>,
    flows: Vec<SequenceFlow>,
}

impl DefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            nodes: BTreeMap::new(),
            flows: Vec::new(),
        }
    }

    pub fn node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        self.nodes.insert(id.clone(), Node { id, kind });
        self
    }

    pub fn flow(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.flow_full(from, to, None, false)
    }

    pub fn conditional_flow(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Condition,
    ) -> Self {
        self.flow_full(from, to, Some(condition), false)
    }

    pub fn default_flow(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.flow_full(from, to, None, true)
    }

    fn flow_full(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Option<Condition>,
        is_default: bool,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        let id = format!("{from}->{to}");
        self.flows.push(SequenceFlow {
            id,
            from,
            to,
            condition,
            is_default,
        });
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        let mut starts = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::StartEvent);
        let start_node = starts
            .next()
            .ok_or_else(|| anyhow!("definition '{}' has no start event", self.key))?
            .id
            .clone();
        if starts.next().is_some() {
            bail!("definition '{}' has more than one start event", self.key);
        }

        for flow in &self.flows {
            if !self.nodes.contains_key(&flow.from) {
                bail!("flow {} leaves unknown node '{}'", flow.id, flow.from);
            }
            if !self.nodes.contains_key(&flow.to) {
                bail!("flow {} enters unknown node '{}'", flow.id, flow.to);
            }
        }

        for node in self.nodes.values() {
            let out = self.flows.iter().filter(|f| f.from == node.id).count();
            match &node.kind {
                NodeKind::EndEvent => {
                    if out != 0 {
                        bail!("end event '{}' must have no outgoing flow", node.id);
                    }
                }
                NodeKind::ExclusiveGateway | NodeKind::ParallelGateway => {}
                NodeKind::ErrorBoundary { attached_to, .. } => {
                    if !self.nodes.contains_key(attached_to) {
                        bail!("boundary '{}' attached to unknown node", node.id);
                    }
                    if out != 1 {
                        bail!("boundary '{}' must have exactly one outgoing flow", node.id);
                    }
                }
                _ => {
                    if out > 1 {
                        bail!(
                            "node '{}' has {out} outgoing flows — route through a gateway",
                            node.id
                        );
                    }
                }
            }
        }

        let mut def = ProcessDefinition {
            key: self.key,
            version: [0u8; 32],
            nodes: self.nodes,
            flows: self.flows,
            start_node,
        };
        def.version = digest_of(&def)?;
        Ok(def)
    }
}

fn digest_of(def: &ProcessDefinition) -> Result<[u8; 32]> {
    // Canonical form: key + serialized nodes/flows. BTreeMap keeps node
    // order stable.
    let mut hasher = Sha256::new();
    hasher.update(def.key.as_bytes());
    hasher.update(serde_json::to_vec(&def.nodes)?);
    hasher.update(serde_json::to_vec(&def.flows)?);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repeat_spec_parses_cycle_forms() {
        assert_eq!(
            RepeatSpec::parse("R3/PT10S").unwrap(),
            RepeatSpec {
                interval_ms: 10_000,
                remaining: Some(3),
            }
        );
        assert_eq!(
            RepeatSpec::parse("R/PT1M").unwrap(),
            RepeatSpec {
                interval_ms: 60_000,
                remaining: None,
            }
        );
        assert_eq!(
            RepeatSpec::parse("R2/PT1H30M").unwrap().interval_ms,
            5_400_000
        );
    }

    #[test]
    fn repeat_spec_rejects_garbage() {
        assert!(RepeatSpec::parse("PT10S").is_err());
        assert!(RepeatSpec::parse("R3/10S").is_err());
        assert!(RepeatSpec::parse("R3/PT").is_err());
        assert!(RepeatSpec::parse("R3/PT5X").is_err());
    }

    #[test]
    fn repeat_spec_rejects_overflowing_durations() {
        // Parseable digits whose millisecond conversion exceeds u64.
        assert!(RepeatSpec::parse("R/PT9999999999999999H").is_err());
        assert!(RepeatSpec::parse("R/PT18446744073709551615S").is_err());
        // Each designator fits on its own; the sum does not.
        assert!(RepeatSpec::parse("R/PT5124095576030H2000S").is_err());
    }

    #[test]
    fn condition_evaluation() {
        let vars = |name: &str| match name {
            "approved" => Some(json!(true)),
            "amount" => Some(json!(250)),
            "region" => Some(json!("emea")),
            _ => None,
        };
        assert!(Condition::IsTrue("approved".into()).evaluate(vars));
        assert!(!Condition::IsTrue("missing".into()).evaluate(vars));
        assert!(Condition::Equals("region".into(), json!("emea")).evaluate(vars));
        assert!(Condition::NotEquals("amount".into(), json!(100)).evaluate(vars));
        // NotEquals on a missing variable is false, not "trivially unequal".
        assert!(!Condition::NotEquals("missing".into(), json!(1)).evaluate(vars));
    }

    #[test]
    fn builder_enforces_single_start() {
        let result = DefinitionBuilder::new("two-starts")
            .node("s1", NodeKind::StartEvent)
            .node("s2", NodeKind::StartEvent)
            .node("end", NodeKind::EndEvent)
            .flow("s1", "end")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_rejects_implicit_fork() {
        let result = DefinitionBuilder::new("implicit-fork")
            .node("start", NodeKind::StartEvent)
            .node("task", NodeKind::UserTask)
            .node("e1", NodeKind::EndEvent)
            .node("e2", NodeKind::EndEvent)
            .flow("start", "task")
            .flow("task", "e1")
            .flow("task", "e2")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn version_digest_is_content_addressed() {
        let build = |key: &str, with_task: bool| {
            let mut b = DefinitionBuilder::new(key)
                .node("start", NodeKind::StartEvent)
                .node("end", NodeKind::EndEvent);
            if with_task {
                b = b
                    .node("t", NodeKind::UserTask)
                    .flow("start", "t")
                    .flow("t", "end");
            } else {
                b = b.flow("start", "end");
            }
            b.build().unwrap()
        };
        let a = build("p", true);
        let b = build("p", true);
        let c = build("p", false);
        assert_eq!(a.version, b.version);
        assert_ne!(a.version, c.version);
    }

    #[test]
    fn boundaries_sort_specific_first() {
        let def = DefinitionBuilder::new("boundaries")
            .node("start", NodeKind::StartEvent)
            .node(
                "work",
                NodeKind::ServiceTask {
                    handler: "h".into(),
                    asynchronous: false,
                },
            )
            .node(
                "any",
                NodeKind::ErrorBoundary {
                    attached_to: "work".into(),
                    error_code: None,
                },
            )
            .node(
                "coded",
                NodeKind::ErrorBoundary {
                    attached_to: "work".into(),
                    error_code: Some("E42".into()),
                },
            )
            .node("end", NodeKind::EndEvent)
            .node("fallback", NodeKind::EndEvent)
            .node("handled", NodeKind::EndEvent)
            .flow("start", "work")
            .flow("work", "end")
            .flow("any", "fallback")
            .flow("coded", "handled")
            .build()
            .unwrap();

        let boundaries = def.boundaries_of("work");
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].id, "coded");
        assert_eq!(boundaries[1].id, "any");
    }
}
