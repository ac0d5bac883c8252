//! Error types for the execution engine

use uuid::Uuid;

use crate::types::ExecutionStatus;
use crate::workflow_state::WorkflowStateError;

/// Errors surfaced by engine operations
///
/// `NotFound` and `InvalidStateTransition` are expected outcomes a caller maps
/// to its own responses; everything else is an operational failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Execution {execution_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[source] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Workflow state error: {0}")]
    WorkflowState(#[from] WorkflowStateError),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Primary SQLite result codes for a write that lost a lock race
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // extended codes carry the primary code in the low byte
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED)) {
                return EngineError::Conflict(format!(
                    "concurrent write holds the store lock: {}",
                    db_err.message()
                ));
            }
        }
        EngineError::Store(err)
    }
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the caller can act on this error without operator help
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InvalidStateTransition { .. }
                | Self::Validation(_)
                | Self::PreconditionFailed(_)
                | Self::Conflict(_)
        )
    }

    /// Message safe to show outside the engine
    ///
    /// Operational failures get a correlation id which is logged together with
    /// the underlying error so support can find it.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound { .. } => "resource not found".to_string(),
            Self::InvalidStateTransition { from, to, .. } => {
                format!("cannot change execution status from {} to {}", from, to)
            }
            Self::Validation(msg) => msg.clone(),
            Self::PreconditionFailed(msg) => msg.clone(),
            Self::Conflict(_) => "the execution was modified concurrently, retry the request".to_string(),
            other => {
                let correlation_id = Uuid::new_v4();
                tracing::error!(%correlation_id, error = %other, "engine failure");
                format!("internal error (correlation id {})", correlation_id)
            }
        }
    }
}

/// Build a decode error for a column value the engine does not understand
pub(crate) fn decode_error(message: impl Into<String>) -> sqlx::Error {
    let message: String = message.into();
    sqlx::Error::Decode(message.into())
}
