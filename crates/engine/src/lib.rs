//! `forgebatch-engine`: batch mechanics without storage.
//!
//! Item contracts, the fault-tolerant chunk pipeline, partition planning,
//! observers, and job/step definitions with their catalog. Persistence, locking
//! and thread management live in `forgebatch-infra`.

pub mod catalog;
pub mod chunk;
pub mod fault;
pub mod item;
pub mod job;
pub mod observer;
pub mod partition;
pub mod step;

pub use catalog::JobCatalog;
pub use chunk::ChunkStep;
pub use fault::FaultPolicy;
pub use item::{ErrorKind, ItemError, ItemProcessor, ItemReader, ItemWriter, PassThrough, VecReader};
pub use job::{JobBuilder, JobDefinition};
pub use observer::{ChunkEvent, ErrorEvent, ItemEvent, Observer, Observers, Phase, SkipEvent};
pub use partition::{
    BalancedPartitioner, DomainBounds, KeyRange, MAX_ID_KEY, MIN_ID_KEY, Partition, PartitionStrategy,
    StridePartitioner,
};
pub use step::{
    Checkpoint, ChunkRunner, NoCheckpoint, PartitionedStep, StepDefinition, StepKind, StepOutcome,
    StepRuntime, StepScope, StopSignal, Tasklet, TaskletContext,
};
