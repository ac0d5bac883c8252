use crate::error::{EngineError, EngineResult};
use crate::types::ExecutionStatus;

/// Whether `to` is a legal successor of `from`
pub fn can_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;

    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

/// Fail with `InvalidStateTransition` unless `from -> to` is legal
pub fn validate_transition(
    execution_id: &str,
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> EngineResult<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidStateTransition {
            execution_id: execution_id.to_string(),
            from,
            to,
        })
    }
}

pub fn can_retry(status: ExecutionStatus) -> bool {
    matches!(status, ExecutionStatus::Failed | ExecutionStatus::Cancelled)
}

/// A retry starts a new run, so it is reported as a move back to `pending`
pub fn validate_retry(execution_id: &str, status: ExecutionStatus) -> EngineResult<()> {
    if can_retry(status) {
        Ok(())
    } else {
        Err(EngineError::InvalidStateTransition {
            execution_id: execution_id.to_string(),
            from: status,
            to: ExecutionStatus::Pending,
        })
    }
}
