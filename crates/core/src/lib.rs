//! `forgebatch-core`: batch domain building blocks.
//!
//! This crate contains **pure domain** records (no storage, no threads): the
//! status model, launch parameters, execution records and the error taxonomy
//! shared by the engine and infrastructure layers.

pub mod context;
pub mod error;
pub mod execution;
pub mod id;
pub mod parameters;
pub mod status;
pub mod summary;

pub use context::ExecutionContext;
pub use error::{BatchError, BatchResult};
pub use execution::{JobExecution, JobInstance, StepExecution};
pub use id::{ExecutionId, InstanceId, StepExecutionId};
pub use parameters::{JobParameter, JobParameters, RUN_TIME_KEY};
pub use status::{BatchStatus, ExitStatus};
pub use summary::{ExecutionSummary, JobInfo, StepExecutionSummary};
