use std::sync::Arc;
use std::thread::JoinHandle;

use forgebatch_core::{BatchError, BatchResult, BatchStatus, ExecutionId, ExecutionSummary};

use crate::ledger::ExecutionLedger;

enum State {
    Finished(BatchStatus),
    Running(JoinHandle<BatchStatus>),
}

/// Returned by a launch. Synchronous launches hand back an already finished
/// handle; asynchronous ones can be polled or joined.
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    job_name: String,
    ledger: Arc<dyn ExecutionLedger>,
    state: State,
}

impl core::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("execution_id", &self.execution_id)
            .field("job_name", &self.job_name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ExecutionHandle {
    pub(crate) fn finished(
        execution_id: ExecutionId,
        job_name: String,
        ledger: Arc<dyn ExecutionLedger>,
        status: BatchStatus,
    ) -> Self {
        Self {
            execution_id,
            job_name,
            ledger,
            state: State::Finished(status),
        }
    }

    pub(crate) fn running(
        execution_id: ExecutionId,
        job_name: String,
        ledger: Arc<dyn ExecutionLedger>,
        join: JoinHandle<BatchStatus>,
    ) -> Self {
        Self {
            execution_id,
            job_name,
            ledger,
            state: State::Running(join),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Finished(_) => true,
            State::Running(join) => join.is_finished(),
        }
    }

    /// Current state as recorded in the ledger.
    pub fn summary(&self) -> BatchResult<ExecutionSummary> {
        let execution = self
            .ledger
            .get_execution(self.execution_id)?
            .ok_or_else(|| BatchError::not_found(format!("execution {}", self.execution_id)))?;
        Ok(ExecutionSummary::from(&execution))
    }

    /// Block until the execution reaches a terminal status and return its summary,
    /// whatever that status is.
    pub fn wait(self) -> BatchResult<ExecutionSummary> {
        self.wait_status().map(|(_, summary)| summary)
    }

    /// Like [`wait`](Self::wait), but a FAILED execution becomes
    /// [`BatchError::ExecutionFailure`].
    pub fn join(self) -> BatchResult<ExecutionSummary> {
        let execution_id = self.execution_id;
        let job_name = self.job_name.clone();
        let (status, summary) = self.wait_status()?;
        if status == BatchStatus::Failed {
            return Err(BatchError::ExecutionFailure {
                job_name,
                execution_id,
                reason: summary.failure_messages.join("; "),
            });
        }
        Ok(summary)
    }

    fn wait_status(self) -> BatchResult<(BatchStatus, ExecutionSummary)> {
        let Self {
            execution_id,
            job_name,
            ledger,
            state,
        } = self;
        let status = match state {
            State::Finished(status) => status,
            State::Running(join) => join.join().map_err(|_| BatchError::ExecutionFailure {
                job_name,
                execution_id,
                reason: "execution thread panicked".to_string(),
            })?,
        };

        let execution = ledger
            .get_execution(execution_id)?
            .ok_or_else(|| BatchError::not_found(format!("execution {execution_id}")))?;
        Ok((status, ExecutionSummary::from(&execution)))
    }
}
