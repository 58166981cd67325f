//! Side-effect-only hooks fired at job, step and chunk boundaries.
//!
//! An [`Observer`] is a record of optional callback slots; a job run fires every
//! registered observer in order. Hook failures (errors and panics) are logged at
//! `warn` and swallowed: observers can never change counts or statuses.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use forgebatch_core::{JobExecution, StepExecution};
use tracing::{debug, error, info, trace, warn};

use crate::item::ItemError;

/// Callback slot payload type.
pub type Hook<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Pipeline phase an item event belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Read,
    Process,
    Write,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Phase::Read => f.write_str("read"),
            Phase::Process => f.write_str("process"),
            Phase::Write => f.write_str("write"),
        }
    }
}

/// A single item crossed a read or process boundary.
#[derive(Debug, Clone)]
pub struct ItemEvent {
    pub step_name: String,
    pub phase: Phase,
    pub item: String,
    /// Rendered processor output (process phase only; `None` when filtered).
    pub output: Option<String>,
}

/// A chunk is about to be, or has been, written.
#[derive(Debug, Clone)]
pub struct ChunkEvent {
    pub step_name: String,
    pub size: usize,
}

/// A reader, processor or writer raised an error.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub step_name: String,
    pub phase: Phase,
    pub item: Option<String>,
    pub error: ItemError,
}

/// An item was dropped by the skip policy.
#[derive(Debug, Clone)]
pub struct SkipEvent {
    pub step_name: String,
    pub phase: Phase,
    pub item: Option<String>,
    pub error: ItemError,
}

/// One observer: a name plus any subset of callback slots.
#[derive(Clone, Default)]
pub struct Observer {
    name: String,
    before_job: Option<Hook<JobExecution>>,
    after_job: Option<Hook<JobExecution>>,
    before_step: Option<Hook<StepExecution>>,
    after_step: Option<Hook<StepExecution>>,
    after_read: Option<Hook<ItemEvent>>,
    after_process: Option<Hook<ItemEvent>>,
    before_write: Option<Hook<ChunkEvent>>,
    after_write: Option<Hook<ChunkEvent>>,
    on_error: Option<Hook<ErrorEvent>>,
    on_skip: Option<Hook<SkipEvent>>,
}

impl core::fmt::Debug for Observer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Observer").field("name", &self.name).finish()
    }
}

macro_rules! hook_setter {
    ($method:ident, $slot:ident, $payload:ty) => {
        pub fn $method<F>(mut self, hook: F) -> Self
        where
            F: Fn(&$payload) -> anyhow::Result<()> + Send + Sync + 'static,
        {
            self.$slot = Some(Arc::new(hook));
            self
        }
    };
}

impl Observer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    hook_setter!(on_before_job, before_job, JobExecution);
    hook_setter!(on_after_job, after_job, JobExecution);
    hook_setter!(on_before_step, before_step, StepExecution);
    hook_setter!(on_after_step, after_step, StepExecution);
    hook_setter!(on_after_read, after_read, ItemEvent);
    hook_setter!(on_after_process, after_process, ItemEvent);
    hook_setter!(on_before_write, before_write, ChunkEvent);
    hook_setter!(on_after_write, after_write, ChunkEvent);
    hook_setter!(on_error, on_error, ErrorEvent);
    hook_setter!(on_skip, on_skip, SkipEvent);

    fn wants_items(&self) -> bool {
        self.after_read.is_some()
            || self.after_process.is_some()
            || self.on_error.is_some()
            || self.on_skip.is_some()
    }

    /// Job, step, chunk, skip and error logging via `tracing`.
    pub fn logging() -> Self {
        Observer::new("logging")
            .on_before_job(|job| {
                info!(
                    job_name = %job.job_name(),
                    execution_id = %job.id,
                    parameters = ?job.parameters.to_string_map(),
                    start_time = ?job.start_time,
                    "job started"
                );
                Ok(())
            })
            .on_after_job(|job| {
                let duration_secs = match (job.start_time, job.end_time) {
                    (Some(start), Some(end)) => (end - start).num_seconds(),
                    _ => 0,
                };
                info!(
                    job_name = %job.job_name(),
                    execution_id = %job.id,
                    status = %job.status,
                    exit_code = %job.exit_status.exit_code,
                    duration_secs,
                    "job finished"
                );
                for step in &job.step_executions {
                    info!(
                        step_name = %step.step_name,
                        read = step.read_count,
                        write = step.write_count,
                        skip = step.skip_count(),
                        read_skip = step.read_skip_count,
                        process_skip = step.process_skip_count,
                        write_skip = step.write_skip_count,
                        commit = step.commit_count,
                        rollback = step.rollback_count,
                        "step summary"
                    );
                }
                for failure in job.all_failure_messages() {
                    error!(job_name = %job.job_name(), failure = %failure, "job failure");
                }
                Ok(())
            })
            .on_before_step(|step| {
                info!(step_name = %step.step_name, "step started");
                Ok(())
            })
            .on_after_step(|step| {
                let duration_ms = match (step.start_time, step.end_time) {
                    (Some(start), Some(end)) => (end - start).num_milliseconds(),
                    _ => 0,
                };
                info!(
                    step_name = %step.step_name,
                    status = %step.status,
                    duration_ms,
                    read = step.read_count,
                    write = step.write_count,
                    skip = step.skip_count(),
                    "step finished"
                );
                Ok(())
            })
            .on_after_read(|event| {
                trace!(step_name = %event.step_name, item = %event.item, "item read");
                Ok(())
            })
            .on_after_process(|event| {
                trace!(
                    step_name = %event.step_name,
                    item = %event.item,
                    output = ?event.output,
                    "item processed"
                );
                Ok(())
            })
            .on_before_write(|event| {
                debug!(step_name = %event.step_name, items = event.size, "before write");
                Ok(())
            })
            .on_after_write(|event| {
                debug!(step_name = %event.step_name, items = event.size, "chunk written");
                Ok(())
            })
            .on_error(|event| {
                error!(
                    step_name = %event.step_name,
                    phase = %event.phase,
                    item = ?event.item,
                    error = %event.error,
                    "item error"
                );
                Ok(())
            })
            .on_skip(|event| {
                warn!(
                    step_name = %event.step_name,
                    phase = %event.phase,
                    item = ?event.item,
                    error = %event.error,
                    "item skipped"
                );
                Ok(())
            })
    }
}

/// Ordered set of observers fired together.
#[derive(Debug, Clone, Default)]
pub struct Observers {
    list: Vec<Observer>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Observer) {
        self.list.push(observer);
    }

    pub fn with(mut self, observer: Observer) -> Self {
        self.push(observer);
        self
    }

    /// New set holding `self` followed by `other`.
    pub fn chain(&self, other: &Observers) -> Observers {
        let mut list = self.list.clone();
        list.extend(other.list.iter().cloned());
        Observers { list }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Whether any observer needs rendered items; lets the pipeline skip formatting.
    pub fn wants_items(&self) -> bool {
        self.list.iter().any(Observer::wants_items)
    }

    pub fn before_job(&self, job: &JobExecution) {
        self.dispatch("before_job", job, |o| o.before_job.as_ref());
    }

    pub fn after_job(&self, job: &JobExecution) {
        self.dispatch("after_job", job, |o| o.after_job.as_ref());
    }

    pub fn before_step(&self, step: &StepExecution) {
        self.dispatch("before_step", step, |o| o.before_step.as_ref());
    }

    pub fn after_step(&self, step: &StepExecution) {
        self.dispatch("after_step", step, |o| o.after_step.as_ref());
    }

    pub fn after_read(&self, event: &ItemEvent) {
        self.dispatch("after_read", event, |o| o.after_read.as_ref());
    }

    pub fn after_process(&self, event: &ItemEvent) {
        self.dispatch("after_process", event, |o| o.after_process.as_ref());
    }

    pub fn before_write(&self, event: &ChunkEvent) {
        self.dispatch("before_write", event, |o| o.before_write.as_ref());
    }

    pub fn after_write(&self, event: &ChunkEvent) {
        self.dispatch("after_write", event, |o| o.after_write.as_ref());
    }

    pub fn on_error(&self, event: &ErrorEvent) {
        self.dispatch("on_error", event, |o| o.on_error.as_ref());
    }

    pub fn on_skip(&self, event: &SkipEvent) {
        self.dispatch("on_skip", event, |o| o.on_skip.as_ref());
    }

    fn dispatch<T>(
        &self,
        hook_name: &'static str,
        payload: &T,
        select: impl Fn(&Observer) -> Option<&Hook<T>>,
    ) {
        for observer in &self.list {
            let Some(hook) = select(observer) else {
                continue;
            };

            match panic::catch_unwind(AssertUnwindSafe(|| hook(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(
                        observer = %observer.name,
                        hook = hook_name,
                        error = %err,
                        "observer hook failed"
                    );
                }
                Err(_) => {
                    warn!(observer = %observer.name, hook = hook_name, "observer hook panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use forgebatch_core::ExecutionId;

    fn step() -> StepExecution {
        StepExecution::new(ExecutionId::new(1), "sampleStep")
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());

        let observers = Observers::new()
            .with(Observer::new("a").on_before_step(move |_| {
                a.lock().unwrap().push("a");
                Ok(())
            }))
            .with(Observer::new("b").on_before_step(move |_| {
                b.lock().unwrap().push("b");
                Ok(())
            }));

        observers.before_step(&step());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn failing_and_panicking_hooks_do_not_stop_later_observers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let observers = Observers::new()
            .with(Observer::new("errors").on_after_step(|_| anyhow::bail!("metrics backend down")))
            .with(Observer::new("panics").on_after_step(|_| panic!("bug in observer")))
            .with(Observer::new("counts").on_after_step(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));

        observers.after_step(&step());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wants_items_only_with_item_hooks() {
        let lifecycle_only = Observers::new().with(Observer::new("x").on_before_job(|_| Ok(())));
        assert!(!lifecycle_only.wants_items());

        let with_skip = lifecycle_only.chain(&Observers::new().with(Observer::new("y").on_skip(|_| Ok(()))));
        assert!(with_skip.wants_items());
        assert_eq!(with_skip.len(), 2);
    }
}
