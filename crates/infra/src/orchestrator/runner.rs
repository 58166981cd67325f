//! Drives one job execution through its steps and records every transition.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use forgebatch_core::{BatchStatus, ExitStatus, JobExecution, StepExecution};
use forgebatch_engine::{
    Checkpoint, ChunkRunner, JobDefinition, Observers, Partition, PartitionedStep, StepDefinition,
    StepKind, StepOutcome, StepRuntime, StepScope, StopSignal, Tasklet, TaskletContext,
};
use forgebatch_observability::{job_span, partition_span, step_span};
use tracing::{Span, debug, error, info, warn};

use super::pool::{PermitPool, fan_out, panic_message};
use crate::ledger::ExecutionLedger;

/// Context key under which a manager step stores its partition plan.
pub const PARTITION_PLAN_KEY: &str = "partition.plan";

/// How a step body finished, before it is mapped onto the step execution.
enum StepEnd {
    Done(StepOutcome),
    /// Nothing to do (empty partition plan).
    Noop(&'static str),
}

pub(crate) struct JobRunner {
    pub job: Arc<JobDefinition>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub observers: Arc<Observers>,
    pub stop: StopSignal,
    pub chunk_permits: PermitPool,
    pub partition_pool_size: usize,
}

impl JobRunner {
    /// Run every step in order. The execution is persisted when it starts and
    /// when it reaches its terminal status.
    pub fn run(&self, execution: &mut JobExecution) -> BatchStatus {
        let span = job_span(self.job.name(), execution.id);
        let _entered = span.enter();

        execution.mark_started();
        if let Err(err) = self.ledger.update_execution(execution) {
            error!(error = %err, "could not record job start");
            execution.mark_failed(format!("could not record job start: {err}"));
            self.finish(execution);
            return execution.status;
        }
        info!(parameters = ?execution.parameters.to_string_map(), "job started");
        self.observers.before_job(execution);

        let mut status = BatchStatus::Completed;
        let mut failure = None;
        for step in self.job.steps() {
            if self.stop.is_requested() {
                info!(step_name = %step.name, "stop requested before step");
                status = BatchStatus::Stopped;
                break;
            }

            let prior = match self.prior_step(execution, &step.name) {
                Ok(prior) => prior,
                Err(err) => {
                    status = BatchStatus::Failed;
                    failure = Some(err);
                    break;
                }
            };
            if prior.as_ref().is_some_and(|p| p.status == BatchStatus::Completed) {
                info!(step_name = %step.name, "step already completed by a previous execution, skipping");
                continue;
            }

            let (manager, workers) = self.run_step(step, execution, prior);
            for worker in workers {
                execution.upsert_step(worker);
            }
            let step_status = manager.status;
            let step_failure = manager.failure_messages.last().cloned();
            execution.upsert_step(manager);

            match step_status {
                BatchStatus::Completed => {}
                BatchStatus::Stopped => {
                    status = BatchStatus::Stopped;
                    break;
                }
                _ => {
                    status = BatchStatus::Failed;
                    failure = Some(format!(
                        "step {} failed: {}",
                        step.name,
                        step_failure.unwrap_or_else(|| "unknown error".to_string())
                    ));
                    break;
                }
            }
        }

        match status {
            BatchStatus::Completed => execution.mark_finished(BatchStatus::Completed, ExitStatus::completed()),
            BatchStatus::Stopped => execution.mark_finished(BatchStatus::Stopped, ExitStatus::stopped()),
            _ => execution.mark_failed(failure.unwrap_or_else(|| "job failed".to_string())),
        }
        self.finish(execution);
        execution.status
    }

    fn finish(&self, execution: &JobExecution) {
        if let Err(err) = self.ledger.update_execution(execution) {
            error!(error = %err, status = %execution.status, "could not record job end");
        }
        match execution.status {
            BatchStatus::Failed => warn!(
                status = %execution.status,
                failures = ?execution.failure_messages,
                "job finished"
            ),
            _ => info!(status = %execution.status, exit_code = %execution.exit_status.exit_code, "job finished"),
        }
        self.observers.after_job(execution);
    }

    /// Most recent execution of `step_name` for this instance, excluding the current run.
    fn prior_step(&self, execution: &JobExecution, step_name: &str) -> Result<Option<StepExecution>, String> {
        self.ledger
            .last_step_execution(execution.instance.id, step_name)
            .map(|prior| prior.filter(|p| p.job_execution_id != execution.id))
            .map_err(|err| format!("could not load previous step {step_name}: {err}"))
    }

    fn runtime(&self) -> StepRuntime {
        let ledger = self.ledger.clone();
        let checkpoint: Arc<dyn Checkpoint> =
            Arc::new(move |step: &StepExecution| -> anyhow::Result<()> {
                ledger.update_step(step)?;
                Ok(())
            });
        StepRuntime::new(self.observers.clone(), self.stop.clone(), checkpoint)
    }

    /// Returns the step's own execution plus any partition worker executions.
    fn run_step(
        &self,
        def: &StepDefinition,
        execution: &JobExecution,
        prior: Option<StepExecution>,
    ) -> (StepExecution, Vec<StepExecution>) {
        let mut step = StepExecution::new(execution.id, &def.name);
        if let Some(prior) = prior {
            debug!(step_name = %def.name, "resuming step from previous context");
            step = step.with_context(prior.execution_context);
        }
        step.mark_started();
        if let Err(err) = self.ledger.add_step(&mut step) {
            error!(step_name = %def.name, error = %err, "could not record step start");
            step.mark_failed(format!("could not record step start: {err}"));
            return (step, Vec::new());
        }

        let span = step_span(&def.name);
        let _entered = span.enter();
        self.observers.before_step(&step);

        let scope = StepScope::new(
            execution.id,
            self.job.name(),
            &def.name,
            execution.parameters.clone(),
        );
        let mut workers = Vec::new();
        let body = panic::catch_unwind(AssertUnwindSafe(|| match &def.kind {
            StepKind::Tasklet(tasklet) => StepEnd::Done(run_tasklet(tasklet.as_ref(), &scope, &mut step)),
            StepKind::Chunk(runner) => StepEnd::Done(self.run_chunk(runner.as_ref(), &scope, &mut step)),
            StepKind::Partitioned(partitioned) => {
                self.run_partitioned(partitioned, &scope, execution, &mut step, &mut workers)
            }
        }));
        let end = body.unwrap_or_else(|payload| {
            StepEnd::Done(StepOutcome::Failed(format!(
                "step panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

        self.complete_step(&mut step, end);
        (step, workers)
    }

    fn complete_step(&self, step: &mut StepExecution, end: StepEnd) {
        match end {
            StepEnd::Done(StepOutcome::Completed) => step.mark_completed(),
            StepEnd::Done(StepOutcome::Stopped) => step.mark_stopped(),
            StepEnd::Done(StepOutcome::Failed(reason)) => step.mark_failed(reason),
            StepEnd::Noop(reason) => step.finish(BatchStatus::Completed, ExitStatus::noop(reason)),
        }
        if let Err(err) = self.ledger.update_step(step) {
            error!(step_name = %step.step_name, error = %err, "could not record step end");
            if step.status == BatchStatus::Completed {
                step.mark_failed(format!("could not record step end: {err}"));
            }
        }

        info!(
            step_name = %step.step_name,
            status = %step.status,
            read_count = step.read_count,
            write_count = step.write_count,
            commit_count = step.commit_count,
            rollback_count = step.rollback_count,
            skip_count = step.skip_count(),
            filter_count = step.filter_count,
            "step finished"
        );
        self.observers.after_step(step);
    }

    fn run_chunk(&self, runner: &dyn ChunkRunner, scope: &StepScope, step: &mut StepExecution) -> StepOutcome {
        let _permit = self.chunk_permits.acquire();
        runner.run(scope, step, &self.runtime())
    }

    fn run_partitioned(
        &self,
        def: &PartitionedStep,
        scope: &StepScope,
        execution: &JobExecution,
        manager: &mut StepExecution,
        workers: &mut Vec<StepExecution>,
    ) -> StepEnd {
        let plan = match self.plan(def, scope, manager) {
            Ok(plan) => plan,
            Err(reason) => return StepEnd::Done(StepOutcome::Failed(reason)),
        };
        if plan.is_empty() {
            info!("no eligible rows, nothing to partition");
            return StepEnd::Noop("no partitions to process");
        }

        let threads = def.grid_size.min(self.partition_pool_size).min(plan.len()).max(1);
        info!(partitions = plan.len(), threads, "partitioned step fanning out");

        let parent = Span::current();
        let results = fan_out(plan.clone(), threads, "partition-worker", |partition| {
            self.run_worker(def, scope, execution, partition, &parent)
        });

        let mut status = BatchStatus::Completed;
        let mut failures = Vec::new();
        for (partition, result) in plan.iter().zip(results) {
            match result {
                Ok(Some(worker)) => {
                    manager.accumulate(&worker);
                    status = status.max(worker.status);
                    if worker.status == BatchStatus::Failed {
                        let reason = worker.failure_messages.last().cloned().unwrap_or_default();
                        failures.push(format!("{} failed: {reason}", partition.name));
                    }
                    workers.push(worker);
                }
                Ok(None) => {}
                Err(panic) => {
                    status = BatchStatus::Failed;
                    failures.push(format!("{} panicked: {panic}", partition.name));
                }
            }
        }

        match status {
            BatchStatus::Completed => StepEnd::Done(StepOutcome::Completed),
            BatchStatus::Stopped => StepEnd::Done(StepOutcome::Stopped),
            _ => StepEnd::Done(StepOutcome::Failed(failures.join("; "))),
        }
    }

    /// Reuse the plan stored by a previous attempt, otherwise query the domain and plan it.
    fn plan(
        &self,
        def: &PartitionedStep,
        scope: &StepScope,
        manager: &mut StepExecution,
    ) -> Result<Vec<Partition>, String> {
        if let Some(stored) = manager.execution_context.get(PARTITION_PLAN_KEY) {
            match serde_json::from_value::<Vec<Partition>>(stored.clone()) {
                Ok(plan) => {
                    debug!(partitions = plan.len(), "reusing stored partition plan");
                    return Ok(plan);
                }
                Err(err) => warn!(error = %err, "stored partition plan unreadable, planning again"),
            }
        }

        let bounds = def
            .domain
            .bounds(scope)
            .map_err(|err| format!("partition bounds query failed: {err}"))?;
        let plan = def.strategy.plan(bounds, def.grid_size);
        debug!(?bounds, partitions = plan.len(), "partition plan computed");

        let stored = serde_json::to_value(&plan).map_err(|err| format!("could not store partition plan: {err}"))?;
        manager.execution_context.put(PARTITION_PLAN_KEY, stored);
        manager.touch();
        self.ledger
            .update_step(manager)
            .map_err(|err| format!("could not record partition plan: {err}"))?;
        Ok(plan)
    }

    /// Run one partition. `None` when a previous execution already completed it.
    fn run_worker(
        &self,
        def: &PartitionedStep,
        scope: &StepScope,
        execution: &JobExecution,
        partition: Partition,
        parent: &Span,
    ) -> Option<StepExecution> {
        let worker_scope = scope.for_partition(&def.worker_name, partition.clone());
        let span = partition_span(parent, &worker_scope.step_name, &partition.name);
        let _entered = span.enter();

        let prior = match self.prior_step(execution, &worker_scope.step_name) {
            Ok(prior) => prior,
            Err(reason) => {
                let mut failed = StepExecution::new(execution.id, &worker_scope.step_name);
                failed.mark_failed(reason);
                return Some(failed);
            }
        };
        if prior.as_ref().is_some_and(|p| p.status == BatchStatus::Completed) {
            debug!("partition already completed by a previous execution, skipping");
            return None;
        }

        let context = match prior {
            Some(prior) => prior.execution_context,
            None => partition.to_context(),
        };
        let mut worker = StepExecution::new(execution.id, &worker_scope.step_name).with_context(context);
        worker.mark_started();
        if let Err(err) = self.ledger.add_step(&mut worker) {
            error!(error = %err, "could not record partition start");
            worker.mark_failed(format!("could not record partition start: {err}"));
            return Some(worker);
        }
        self.observers.before_step(&worker);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_chunk(def.worker.as_ref(), &worker_scope, &mut worker)
        }))
        .unwrap_or_else(|payload| {
            StepOutcome::Failed(format!("partition panicked: {}", panic_message(payload.as_ref())))
        });

        self.complete_step(&mut worker, StepEnd::Done(outcome));
        Some(worker)
    }
}

fn run_tasklet(tasklet: &dyn Tasklet, scope: &StepScope, step: &mut StepExecution) -> StepOutcome {
    let mut ctx = TaskletContext {
        scope,
        execution_context: &mut step.execution_context,
    };
    match tasklet.execute(&mut ctx) {
        Ok(()) => {
            step.commit_count += 1;
            StepOutcome::Completed
        }
        Err(err) => StepOutcome::Failed(format!("{err:#}")),
    }
}
