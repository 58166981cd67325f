//! Step definitions and the runtime handed to a step while it executes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use forgebatch_core::{ExecutionContext, ExecutionId, JobParameters, StepExecution};

use crate::chunk::ChunkStep;
use crate::item::ItemError;
use crate::observer::Observers;
use crate::partition::{BalancedPartitioner, DomainBounds, KeyRange, Partition, PartitionStrategy};

/// What a step knows about the run it belongs to.
#[derive(Debug, Clone)]
pub struct StepScope {
    pub job_execution_id: ExecutionId,
    pub job_name: String,
    pub step_name: String,
    pub parameters: JobParameters,
    /// Set for partition workers; readers use it to restrict their key range.
    pub partition: Option<Partition>,
}

impl StepScope {
    pub fn new(
        job_execution_id: ExecutionId,
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        parameters: JobParameters,
    ) -> Self {
        Self {
            job_execution_id,
            job_name: job_name.into(),
            step_name: step_name.into(),
            parameters,
            partition: None,
        }
    }

    /// Scope of one partition worker of this (manager) step.
    pub fn for_partition(&self, worker_name: &str, partition: Partition) -> Self {
        Self {
            job_execution_id: self.job_execution_id,
            job_name: self.job_name.clone(),
            step_name: format!("{worker_name}:{}", partition.name),
            parameters: self.parameters.clone(),
            partition: Some(partition),
        }
    }

    pub fn key_range(&self) -> Option<KeyRange> {
        self.partition.as_ref().map(|p| p.range)
    }
}

/// Cooperative cancellation flag, checked by pipelines at chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Persists a step execution after each committed chunk.
pub trait Checkpoint: Send + Sync {
    fn save(&self, step: &StepExecution) -> anyhow::Result<()>;
}

impl<F> Checkpoint for F
where
    F: Fn(&StepExecution) -> anyhow::Result<()> + Send + Sync,
{
    fn save(&self, step: &StepExecution) -> anyhow::Result<()> {
        self(step)
    }
}

/// Checkpoint that keeps nothing; used when no ledger is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn save(&self, _step: &StepExecution) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything a running step needs beyond its own definition.
#[derive(Clone)]
pub struct StepRuntime {
    pub observers: Arc<Observers>,
    pub stop: StopSignal,
    pub checkpoint: Arc<dyn Checkpoint>,
}

impl StepRuntime {
    pub fn new(observers: Arc<Observers>, stop: StopSignal, checkpoint: Arc<dyn Checkpoint>) -> Self {
        Self {
            observers,
            stop,
            checkpoint,
        }
    }

    /// No observers, no stop requests, no persistence.
    pub fn detached() -> Self {
        Self::new(Arc::new(Observers::new()), StopSignal::new(), Arc::new(NoCheckpoint))
    }
}

/// How a step body ended. The caller turns this into the step's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Mutable view handed to a tasklet.
pub struct TaskletContext<'a> {
    pub scope: &'a StepScope,
    pub execution_context: &'a mut ExecutionContext,
}

/// Single-shot unit of work.
pub trait Tasklet: Send + Sync {
    fn execute(&self, ctx: &mut TaskletContext<'_>) -> anyhow::Result<()>;
}

impl<F> Tasklet for F
where
    F: Fn(&mut TaskletContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut TaskletContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Type-erased chunk pipeline, so steps with different item types share one list.
pub trait ChunkRunner: Send + Sync {
    fn chunk_size(&self) -> usize;

    fn run(&self, scope: &StepScope, step: &mut StepExecution, runtime: &StepRuntime) -> StepOutcome;
}

/// Manager step that plans partitions and fans a worker pipeline out over them.
#[derive(Clone)]
pub struct PartitionedStep {
    pub worker_name: String,
    pub worker: Arc<dyn ChunkRunner>,
    pub strategy: Arc<dyn PartitionStrategy>,
    pub domain: Arc<dyn DomainBounds>,
    pub grid_size: usize,
}

impl PartitionedStep {
    pub const DEFAULT_GRID_SIZE: usize = 4;

    pub fn new<I, O, D>(worker_name: impl Into<String>, worker: ChunkStep<I, O>, domain: D) -> Self
    where
        I: core::fmt::Debug + Send + 'static,
        O: core::fmt::Debug + Send + 'static,
        D: Fn(&StepScope) -> Result<Option<KeyRange>, ItemError> + Send + Sync + 'static,
    {
        Self {
            worker_name: worker_name.into(),
            worker: Arc::new(worker),
            strategy: Arc::new(BalancedPartitioner),
            domain: Arc::new(domain),
            grid_size: Self::DEFAULT_GRID_SIZE,
        }
    }

    pub fn with_strategy(mut self, strategy: impl PartitionStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn with_grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }
}

#[derive(Clone)]
pub enum StepKind {
    Tasklet(Arc<dyn Tasklet>),
    Chunk(Arc<dyn ChunkRunner>),
    Partitioned(PartitionedStep),
}

/// Named step of a job definition.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
}

impl core::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match &self.kind {
            StepKind::Tasklet(_) => "tasklet",
            StepKind::Chunk(_) => "chunk",
            StepKind::Partitioned(_) => "partitioned",
        };
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

impl StepDefinition {
    pub fn tasklet<F>(name: impl Into<String>, tasklet: F) -> Self
    where
        F: Fn(&mut TaskletContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Tasklet(Arc::new(tasklet)),
        }
    }

    pub fn chunk<I, O>(name: impl Into<String>, step: ChunkStep<I, O>) -> Self
    where
        I: core::fmt::Debug + Send + 'static,
        O: core::fmt::Debug + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Chunk(Arc::new(step)),
        }
    }

    pub fn partitioned(name: impl Into<String>, step: PartitionedStep) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Partitioned(step),
        }
    }

    /// Structural checks applied when the owning job is built.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("step name must not be empty".into());
        }
        match &self.kind {
            StepKind::Tasklet(_) => Ok(()),
            StepKind::Chunk(runner) if runner.chunk_size() == 0 => {
                Err(format!("step {}: chunk size must be positive", self.name))
            }
            StepKind::Chunk(_) => Ok(()),
            StepKind::Partitioned(p) => {
                if p.grid_size == 0 {
                    Err(format!("step {}: grid size must be positive", self.name))
                } else if p.worker.chunk_size() == 0 {
                    Err(format!("step {}: worker chunk size must be positive", self.name))
                } else if p.worker_name.trim().is_empty() {
                    Err(format!("step {}: worker name must not be empty", self.name))
                } else {
                    Ok(())
                }
            }
        }
    }
}
