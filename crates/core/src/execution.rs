//! Job instance, job execution and step execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::id::{ExecutionId, InstanceId, StepExecutionId};
use crate::parameters::JobParameters;
use crate::status::{BatchStatus, ExitStatus};

/// A job identified by name plus its identifying launch parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub job_name: String,
    pub identity_key: String,
}

/// Counters and state for one step of one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Assigned by the ledger when the step execution is first stored.
    pub id: Option<StepExecutionId>,
    pub job_execution_id: ExecutionId,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub execution_context: ExecutionContext,
    pub failure_messages: Vec<String>,
}

impl StepExecution {
    pub fn new(job_execution_id: ExecutionId, step_name: impl Into<String>) -> Self {
        Self {
            id: None,
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            commit_count: 0,
            rollback_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            start_time: None,
            end_time: None,
            last_updated: Utc::now(),
            execution_context: ExecutionContext::new(),
            failure_messages: Vec::new(),
        }
    }

    /// Seed the context restored from a previous attempt.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.execution_context = context;
        self
    }

    /// Total skips across the read, process and write phases.
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.status = BatchStatus::Started;
        self.exit_status = ExitStatus::executing();
        self.start_time = Some(now);
        self.last_updated = now;
    }

    pub fn mark_completed(&mut self) {
        self.finish(BatchStatus::Completed, ExitStatus::completed());
    }

    pub fn mark_stopped(&mut self) {
        self.finish(BatchStatus::Stopped, ExitStatus::stopped());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.failure_messages.push(error.clone());
        self.finish(BatchStatus::Failed, ExitStatus::failed(error));
    }

    pub fn finish(&mut self, status: BatchStatus, exit_status: ExitStatus) {
        let now = Utc::now();
        self.status = status;
        self.exit_status = exit_status;
        self.end_time = Some(now);
        self.last_updated = now;
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Add another step's counters into this one (partition aggregation).
    pub fn accumulate(&mut self, other: &StepExecution) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.filter_count += other.filter_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
    }
}

/// One attempt to run a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub instance: JobInstance,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub step_executions: Vec<StepExecution>,
    pub execution_context: ExecutionContext,
    pub failure_messages: Vec<String>,
}

impl JobExecution {
    pub fn new(id: ExecutionId, instance: JobInstance, parameters: JobParameters) -> Self {
        let now = Utc::now();
        Self {
            id,
            instance,
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: now,
            start_time: None,
            end_time: None,
            last_updated: now,
            step_executions: Vec::new(),
            execution_context: ExecutionContext::new(),
            failure_messages: Vec::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.instance.job_name
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Sort key for history listings: start time, falling back to creation time.
    pub fn started_or_created(&self) -> DateTime<Utc> {
        self.start_time.unwrap_or(self.create_time)
    }

    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.status = BatchStatus::Started;
        self.exit_status = ExitStatus::executing();
        self.start_time = Some(now);
        self.last_updated = now;
    }

    pub fn mark_stopping(&mut self) {
        self.status = BatchStatus::Stopping;
        self.last_updated = Utc::now();
    }

    pub fn mark_finished(&mut self, status: BatchStatus, exit_status: ExitStatus) {
        let now = Utc::now();
        self.status = status;
        self.exit_status = exit_status;
        self.end_time = Some(now);
        self.last_updated = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.failure_messages.push(error.clone());
        self.mark_finished(BatchStatus::Failed, ExitStatus::failed(error));
    }

    pub fn mark_abandoned(&mut self) {
        let now = Utc::now();
        self.status = BatchStatus::Abandoned;
        self.exit_status = ExitStatus::for_status(BatchStatus::Abandoned, "abandoned by operator");
        if self.end_time.is_none() {
            self.end_time = Some(now);
        }
        self.last_updated = now;
    }

    /// Insert or replace a step execution (matched by id, then by name).
    pub fn upsert_step(&mut self, step: StepExecution) {
        let slot = self.step_executions.iter_mut().find(|s| match (s.id, step.id) {
            (Some(a), Some(b)) => a == b,
            _ => s.step_name == step.step_name,
        });
        match slot {
            Some(existing) => *existing = step,
            None => self.step_executions.push(step),
        }
        self.last_updated = Utc::now();
    }

    pub fn step(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| s.step_name == step_name)
    }

    /// All failure messages of the job and its steps.
    pub fn all_failure_messages(&self) -> Vec<String> {
        let mut out = self.failure_messages.clone();
        for step in &self.step_executions {
            for msg in &step.failure_messages {
                if !out.contains(msg) {
                    out.push(msg.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> JobInstance {
        JobInstance {
            id: InstanceId::new(1),
            job_name: "sampleJob".into(),
            identity_key: "run.time=now".into(),
        }
    }

    #[test]
    fn job_execution_lifecycle() {
        let mut exec = JobExecution::new(ExecutionId::new(1), instance(), JobParameters::new());
        assert_eq!(exec.status, BatchStatus::Starting);
        assert!(exec.is_running());

        exec.mark_started();
        assert!(exec.start_time.is_some());

        exec.mark_finished(BatchStatus::Completed, ExitStatus::completed());
        assert!(!exec.is_running());
        assert!(exec.end_time.is_some());
        assert_eq!(exec.exit_status.exit_code, ExitStatus::COMPLETED);
    }

    #[test]
    fn upsert_step_replaces_by_id() {
        let mut exec = JobExecution::new(ExecutionId::new(1), instance(), JobParameters::new());
        let mut step = StepExecution::new(exec.id, "sampleStep");
        step.id = Some(StepExecutionId::new(7));
        exec.upsert_step(step.clone());

        step.read_count = 5;
        exec.upsert_step(step);

        assert_eq!(exec.step_executions.len(), 1);
        assert_eq!(exec.step("sampleStep").unwrap().read_count, 5);
    }

    #[test]
    fn skip_count_sums_phases() {
        let mut step = StepExecution::new(ExecutionId::new(1), "s");
        step.read_skip_count = 1;
        step.process_skip_count = 2;
        step.write_skip_count = 3;
        assert_eq!(step.skip_count(), 6);
    }

    #[test]
    fn failure_messages_include_steps() {
        let mut exec = JobExecution::new(ExecutionId::new(1), instance(), JobParameters::new());
        let mut step = StepExecution::new(exec.id, "s");
        step.mark_failed("boom");
        exec.upsert_step(step);
        exec.mark_failed("step s failed");

        let all = exec.all_failure_messages();
        assert_eq!(all, vec!["step s failed".to_string(), "boom".to_string()]);
    }
}
