//! Execution status model shared by jobs and steps.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job or step execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Created by the launcher, not yet running
    Starting,
    /// Currently executing
    Started,
    /// A stop was requested; the pipeline will halt at the next chunk boundary
    Stopping,
    /// Halted by a stop request
    Stopped,
    /// Finished successfully
    Completed,
    /// Finished with an unrecoverable error
    Failed,
    /// Force-marked as never to be restarted
    Abandoned,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Abandoned
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// FAILED and STOPPED are the only states a restart may resume from.
    pub fn is_restartable(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Stopped)
    }

    /// Combine two terminal outcomes, keeping the more severe one.
    pub fn max(self, other: BatchStatus) -> BatchStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    fn severity(&self) -> u8 {
        match self {
            BatchStatus::Completed => 0,
            BatchStatus::Starting => 1,
            BatchStatus::Started => 2,
            BatchStatus::Stopping => 3,
            BatchStatus::Stopped => 4,
            BatchStatus::Failed => 5,
            BatchStatus::Abandoned => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// Exit code and description recorded when an execution finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl ExitStatus {
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";
    pub const NOOP: &'static str = "NOOP";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(exit_code: impl Into<String>, exit_description: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: exit_description.into(),
        }
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING, "")
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED, "")
    }

    pub fn noop(description: impl Into<String>) -> Self {
        Self::new(Self::NOOP, description)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED, "stop requested")
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::new(Self::FAILED, description)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN, "")
    }

    /// Exit status that mirrors a terminal batch status.
    pub fn for_status(status: BatchStatus, description: impl Into<String>) -> Self {
        match status {
            BatchStatus::Completed => Self::new(Self::COMPLETED, description),
            BatchStatus::Failed => Self::failed(description),
            BatchStatus::Stopped => Self::new(Self::STOPPED, description),
            BatchStatus::Abandoned => Self::new("ABANDONED", description),
            _ => Self::new(Self::EXECUTING, description),
        }
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failed_and_stopped_are_restartable() {
        assert!(BatchStatus::Failed.is_restartable());
        assert!(BatchStatus::Stopped.is_restartable());
        assert!(!BatchStatus::Completed.is_restartable());
        assert!(!BatchStatus::Abandoned.is_restartable());
        assert!(!BatchStatus::Started.is_restartable());
    }

    #[test]
    fn max_keeps_the_worst_outcome() {
        assert_eq!(
            BatchStatus::Completed.max(BatchStatus::Failed),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Stopped.max(BatchStatus::Completed),
            BatchStatus::Stopped
        );
        assert_eq!(
            BatchStatus::Failed.max(BatchStatus::Stopped),
            BatchStatus::Failed
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            BatchStatus::Starting,
            BatchStatus::Started,
            BatchStatus::Stopping,
            BatchStatus::Stopped,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
    }
}
