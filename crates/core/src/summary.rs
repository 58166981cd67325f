//! Read-side views handed to outer layers (HTTP, CLI, dashboards).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{JobExecution, StepExecution};
use crate::id::{ExecutionId, InstanceId};
use crate::status::BatchStatus;

/// Step counters as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionSummary {
    pub step_name: String,
    pub status: BatchStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub skip_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub filter_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&StepExecution> for StepExecutionSummary {
    fn from(step: &StepExecution) -> Self {
        Self {
            step_name: step.step_name.clone(),
            status: step.status,
            read_count: step.read_count,
            write_count: step.write_count,
            commit_count: step.commit_count,
            rollback_count: step.rollback_count,
            skip_count: step.skip_count(),
            read_skip_count: step.read_skip_count,
            process_skip_count: step.process_skip_count,
            write_skip_count: step.write_skip_count,
            filter_count: step.filter_count,
            start_time: step.start_time,
            end_time: step.end_time,
        }
    }
}

/// Execution as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub job_name: String,
    pub instance_id: InstanceId,
    pub status: BatchStatus,
    pub exit_code: String,
    pub exit_description: String,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub parameters: BTreeMap<String, String>,
    pub step_executions: Vec<StepExecutionSummary>,
    pub failure_messages: Vec<String>,
}

impl ExecutionSummary {
    pub fn step(&self, step_name: &str) -> Option<&StepExecutionSummary> {
        self.step_executions.iter().find(|s| s.step_name == step_name)
    }
}

impl From<&JobExecution> for ExecutionSummary {
    fn from(execution: &JobExecution) -> Self {
        Self {
            execution_id: execution.id,
            job_name: execution.instance.job_name.clone(),
            instance_id: execution.instance.id,
            status: execution.status,
            exit_code: execution.exit_status.exit_code.clone(),
            exit_description: execution.exit_status.exit_description.clone(),
            create_time: execution.create_time,
            start_time: execution.start_time,
            end_time: execution.end_time,
            last_updated: execution.last_updated,
            parameters: execution.parameters.to_string_map(),
            step_executions: execution
                .step_executions
                .iter()
                .map(StepExecutionSummary::from)
                .collect(),
            failure_messages: execution.all_failure_messages(),
        }
    }
}

/// Registered job with its most recent execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub job_name: String,
    pub last_execution_id: Option<ExecutionId>,
    pub last_status: Option<BatchStatus>,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_end_time: Option<DateTime<Utc>>,
    pub is_running: bool,
}

impl JobInfo {
    pub fn new(job_name: impl Into<String>, last: Option<&JobExecution>, is_running: bool) -> Self {
        Self {
            job_name: job_name.into(),
            last_execution_id: last.map(|e| e.id),
            last_status: last.map(|e| e.status),
            last_start_time: last.and_then(|e| e.start_time),
            last_end_time: last.and_then(|e| e.end_time),
            is_running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::JobInstance;
    use crate::parameters::JobParameters;

    #[test]
    fn summary_serializes_camel_case() {
        let exec = JobExecution::new(
            ExecutionId::new(3),
            JobInstance {
                id: InstanceId::new(2),
                job_name: "sampleJob".into(),
                identity_key: String::new(),
            },
            JobParameters::from_map([("date", "2024-01-01")]),
        );

        let json = serde_json::to_value(ExecutionSummary::from(&exec)).unwrap();
        assert_eq!(json["executionId"], 3);
        assert_eq!(json["instanceId"], 2);
        assert_eq!(json["status"], "STARTING");
        assert_eq!(json["parameters"]["date"], "2024-01-01");
    }

    #[test]
    fn job_info_without_history() {
        let info = JobInfo::new("partitionJob", None, false);
        assert!(info.last_execution_id.is_none());
        assert!(!info.is_running);
    }
}
