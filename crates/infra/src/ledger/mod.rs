//! Execution ledger: durable history of job instances, executions and steps.
//!
//! Executions and steps are stored separately: [`ExecutionLedger::update_execution`]
//! writes job-level fields only, step rows are written through
//! [`ExecutionLedger::add_step`] / [`ExecutionLedger::update_step`]. Reads return
//! executions with their steps attached.

use std::sync::Arc;

use forgebatch_core::{
    BatchError, ExecutionId, InstanceId, JobExecution, JobInstance, JobParameters, StepExecution,
};
use thiserror::Error;

mod in_memory;
mod postgres;

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Terminal executions only change by being abandoned.
    #[error("execution {0} already finished")]
    TerminalExecution(ExecutionId),

    #[error("instance already exists: {job_name} [{identity_key}]")]
    DuplicateInstance { job_name: String, identity_key: String },

    #[error("ledger backend error: {0}")]
    Backend(String),

    #[error("ledger state poisoned")]
    Poisoned,
}

impl From<LedgerError> for BatchError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(what) => BatchError::NotFound(what),
            other => BatchError::storage(other.to_string()),
        }
    }
}

pub trait ExecutionLedger: Send + Sync {
    fn find_instance(&self, job_name: &str, identity_key: &str) -> Result<Option<JobInstance>, LedgerError>;

    fn create_instance(&self, job_name: &str, identity_key: &str) -> Result<JobInstance, LedgerError>;

    /// New execution in `STARTING` for `instance`.
    fn create_execution(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution, LedgerError>;

    /// Persist job-level fields (status, times, exit status, context, failures).
    fn update_execution(&self, execution: &JobExecution) -> Result<(), LedgerError>;

    /// Store a new step execution and assign its id.
    fn add_step(&self, step: &mut StepExecution) -> Result<(), LedgerError>;

    fn update_step(&self, step: &StepExecution) -> Result<(), LedgerError>;

    fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, LedgerError>;

    /// Executions of one instance, newest first.
    fn executions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>, LedgerError>;

    fn latest_execution(&self, job_name: &str) -> Result<Option<JobExecution>, LedgerError>;

    /// Executions of a job sorted by start time descending; `page` is zero-based.
    fn history(&self, job_name: &str, page: usize, size: usize) -> Result<Vec<JobExecution>, LedgerError>;

    /// Most recent step execution named `step_name` across the instance's executions.
    fn last_step_execution(
        &self,
        instance_id: InstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, LedgerError> {
        for execution in self.executions_for_instance(instance_id)? {
            if let Some(step) = execution.step(step_name) {
                return Ok(Some(step.clone()));
            }
        }
        Ok(None)
    }
}

impl<T: ExecutionLedger + ?Sized> ExecutionLedger for Arc<T> {
    fn find_instance(&self, job_name: &str, identity_key: &str) -> Result<Option<JobInstance>, LedgerError> {
        (**self).find_instance(job_name, identity_key)
    }

    fn create_instance(&self, job_name: &str, identity_key: &str) -> Result<JobInstance, LedgerError> {
        (**self).create_instance(job_name, identity_key)
    }

    fn create_execution(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution, LedgerError> {
        (**self).create_execution(instance, parameters)
    }

    fn update_execution(&self, execution: &JobExecution) -> Result<(), LedgerError> {
        (**self).update_execution(execution)
    }

    fn add_step(&self, step: &mut StepExecution) -> Result<(), LedgerError> {
        (**self).add_step(step)
    }

    fn update_step(&self, step: &StepExecution) -> Result<(), LedgerError> {
        (**self).update_step(step)
    }

    fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, LedgerError> {
        (**self).get_execution(id)
    }

    fn executions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>, LedgerError> {
        (**self).executions_for_instance(instance_id)
    }

    fn latest_execution(&self, job_name: &str) -> Result<Option<JobExecution>, LedgerError> {
        (**self).latest_execution(job_name)
    }

    fn history(&self, job_name: &str, page: usize, size: usize) -> Result<Vec<JobExecution>, LedgerError> {
        (**self).history(job_name, page, size)
    }

    fn last_step_execution(
        &self,
        instance_id: InstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, LedgerError> {
        (**self).last_step_execution(instance_id, step_name)
    }
}

/// Sort for history listings: start time (or creation time) descending, newest id first on ties.
pub(crate) fn sort_newest_first(executions: &mut [JobExecution]) {
    executions.sort_by(|a, b| {
        b.started_or_created()
            .cmp(&a.started_or_created())
            .then(b.id.cmp(&a.id))
    });
}

pub(crate) fn page<T>(items: Vec<T>, page: usize, size: usize) -> Vec<T> {
    items
        .into_iter()
        .skip(page.saturating_mul(size))
        .take(size)
        .collect()
}
