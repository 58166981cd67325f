//! Batch error taxonomy.

use thiserror::Error;

use crate::id::ExecutionId;

/// Result type used across the batch layers.
pub type BatchResult<T> = Result<T, BatchError>;

/// Error surfaced by control and query operations.
///
/// Per-item failures never show up here directly: the chunk pipeline absorbs them
/// up to its fault-tolerance limits and only exhaustion becomes
/// [`BatchError::ExecutionFailure`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Unknown job name or execution id.
    #[error("not found: {0}")]
    NotFound(String),

    /// The job's cluster-wide lock is held by another execution.
    #[error("job is already running: {0}")]
    AlreadyRunning(String),

    /// The execution could not be started.
    #[error("failed to launch job {job_name}: {reason}")]
    LaunchFailure { job_name: String, reason: String },

    /// A step exhausted its fault-tolerance limits.
    #[error("execution {execution_id} of {job_name} failed: {reason}")]
    ExecutionFailure {
        job_name: String,
        execution_id: ExecutionId,
        reason: String,
    },

    /// The instance is not in a restartable terminal state.
    #[error("execution {execution_id} cannot be restarted: {reason}")]
    RestartNotAllowed {
        execution_id: ExecutionId,
        reason: String,
    },

    /// The stop signal could not be delivered.
    #[error("execution {execution_id} cannot be stopped: {reason}")]
    StopFailure {
        execution_id: ExecutionId,
        reason: String,
    },

    /// The execution is still running and cannot be abandoned.
    #[error("execution {0} is still active")]
    ExecutionActive(ExecutionId),

    /// A job definition failed validation (duplicate name, empty step list, ...).
    #[error("invalid job definition: {0}")]
    InvalidDefinition(String),

    /// The execution ledger failed while serving a query.
    #[error("storage error: {0}")]
    Storage(String),
}

impl BatchError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_running(job_name: impl Into<String>) -> Self {
        Self::AlreadyRunning(job_name.into())
    }

    pub fn launch_failure(job_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LaunchFailure {
            job_name: job_name.into(),
            reason: reason.into(),
        }
    }

    pub fn restart_not_allowed(execution_id: ExecutionId, reason: impl Into<String>) -> Self {
        Self::RestartNotAllowed {
            execution_id,
            reason: reason.into(),
        }
    }

    pub fn stop_failure(execution_id: ExecutionId, reason: impl Into<String>) -> Self {
        Self::StopFailure {
            execution_id,
            reason: reason.into(),
        }
    }

    pub fn invalid_definition(msg: impl Into<String>) -> Self {
        Self::InvalidDefinition(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Stable error code for outer layers (HTTP mapping, alerting).
    pub fn code(&self) -> &'static str {
        match self {
            BatchError::NotFound(_) => "B001",
            BatchError::AlreadyRunning(_) => "B002",
            BatchError::LaunchFailure { .. } => "B003",
            BatchError::StopFailure { .. } => "B004",
            BatchError::ExecutionFailure { .. } => "B005",
            BatchError::InvalidDefinition(_) => "B006",
            BatchError::RestartNotAllowed { .. } => "B008",
            BatchError::ExecutionActive(_) => "B009",
            BatchError::Storage(_) => "B010",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            BatchError::not_found("x"),
            BatchError::already_running("x"),
            BatchError::launch_failure("x", "y"),
            BatchError::ExecutionFailure {
                job_name: "x".into(),
                execution_id: ExecutionId::new(1),
                reason: "y".into(),
            },
            BatchError::restart_not_allowed(ExecutionId::new(1), "y"),
            BatchError::stop_failure(ExecutionId::new(1), "y"),
            BatchError::ExecutionActive(ExecutionId::new(1)),
            BatchError::invalid_definition("x"),
            BatchError::storage("x"),
        ];

        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn messages_name_the_job() {
        let err = BatchError::already_running("sampleJob");
        assert_eq!(err.to_string(), "job is already running: sampleJob");
    }
}
