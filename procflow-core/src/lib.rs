//! procflow-core — a durable business-process execution engine.
//!
//! Walks an immutable definition graph token-by-token, forking and joining
//! concurrent branches, committing state atomically at every wait point,
//! and resuming asynchronously through a durable, lock-based job scheduler
//! with retries and dead-lettering.
//!
//! The pieces, leaf-first: [`definition`] (the read-only graph),
//! [`execution`] (the per-instance tree of tokens and variable scopes),
//! [`interpreter`] (the operation queue), [`command`] (the transaction
//! boundary), [`job`] + [`scheduler`] (deferred work), [`store`] (pluggable
//! persistence), and [`engine`] (the command API everything enters
//! through).

pub mod command;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod interpreter;
pub mod job;
pub mod listener;
pub mod scheduler;
pub mod store;
pub mod store_memory;

pub use config::EngineConfig;
pub use definition::{
    Condition, DefinitionBuilder, NodeKind, ProcessDefinition, RepeatSpec, TimerSpec,
};
pub use engine::{Engine, JobRun};
pub use error::{BehaviorError, EngineError};
pub use execution::{Execution, InstanceState, InstanceStatus, Variable};
pub use job::{Job, JobKind};
pub use listener::{
    ExecutionInfo, ExecutionListener, ListenerEvent, ScopeVars, ServiceTaskHandler,
};
pub use scheduler::{spawn_workers, JobScheduler};
pub use store::EngineStore;
pub use store_memory::MemoryStore;
