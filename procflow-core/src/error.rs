use thiserror::Error;
use uuid::Uuid;

/// Error raised by a service-task handler or an execution listener.
///
/// An optional machine-readable `code` makes the error routable through an
/// error-boundary node attached to the failing activity; without a matching
/// boundary the enclosing command aborts.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BehaviorError {
    pub code: Option<String>,
    pub message: String,
}

impl BehaviorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Engine error taxonomy.
///
/// Definition errors and unrouted behavior errors abort the triggering
/// command with nothing committed. Staleness (a job referencing a since
/// deleted execution) is deliberately *not* here — it is a no-op, handled
/// inside job execution. Optimistic-lock losses during job acquisition are
/// silent as well: the contested job simply is not returned.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no process definition deployed under key '{0}'")]
    DefinitionNotFound(String),

    #[error("process instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("execution {execution} is not waiting at a completable node (parked at {at:?})")]
    NotWaiting {
        execution: Uuid,
        at: Option<String>,
    },

    #[error("definition element '{0}' not found")]
    UnknownElement(String),

    #[error("no outgoing flow could be taken at '{node}': {reason}")]
    NoFlowTaken { node: String, reason: String },

    #[error("behavior failed at '{node}': {source}")]
    Behavior {
        node: String,
        #[source]
        source: BehaviorError,
    },

    #[error("process instance {0} has already ended")]
    InstanceEnded(Uuid),

    #[error("command exceeded the operation limit ({0}); likely a definition loop without a wait state")]
    OperationLimit(usize),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// The behavior error code carried by this error, if any. Used for
    /// error-boundary routing before the command gives up.
    pub fn behavior_code(&self) -> Option<&str> {
        match self {
            EngineError::Behavior { source, .. } => source.code.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
