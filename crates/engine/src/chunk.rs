//! Chunk-oriented read → process → write pipeline with skip and retry.
//!
//! Items are read one at a time and grouped into chunks of `chunk_size`. Each
//! chunk is processed and then handed to the writer in one call; a successful
//! write is a commit. After every commit the reader saves its position into the
//! step context and the step execution is checkpointed, so a restart resumes
//! after the last committed chunk.
//!
//! Error handling per chunk, in order:
//! 1. skippable error with skip budget left: drop only the offending item;
//! 2. retryable error with retry budget left: roll back and re-attempt the chunk;
//! 3. anything else fails the step.
//!
//! A chunk that lost items to process skips counts one rollback, since its
//! transaction is redone without them.
//!
//! When a write fails without naming an item, the chunk is written one item per
//! transaction. Each single-item write gets the same skip and retry treatment,
//! and the number of chunk items already resolved is checkpointed under
//! [`SCAN_PROGRESS_KEY`], so a restart re-reading that chunk drops them.

use std::fmt::Debug;
use std::sync::Arc;

use forgebatch_core::StepExecution;
use tracing::{debug, warn};

use crate::fault::FaultPolicy;
use crate::item::{ItemError, ItemProcessor, ItemReader, ItemWriter};
use crate::observer::{ChunkEvent, ErrorEvent, ItemEvent, Phase, SkipEvent};
use crate::step::{ChunkRunner, StepOutcome, StepRuntime, StepScope};

/// Step context key holding how many items of the current chunk were already
/// written (or skipped) one at a time.
pub const SCAN_PROGRESS_KEY: &str = "chunk.scan.resolved";

type ReaderFactory<I> =
    Arc<dyn Fn(&StepScope) -> Result<Box<dyn ItemReader<Item = I>>, ItemError> + Send + Sync>;
type WriterFactory<O> = Arc<dyn Fn(&StepScope) -> Result<Box<dyn ItemWriter<O>>, ItemError> + Send + Sync>;

/// Chunk step definition. Readers and writers are built fresh for every
/// execution (and every partition) from their factories.
pub struct ChunkStep<I, O> {
    chunk_size: usize,
    policy: FaultPolicy,
    reader: ReaderFactory<I>,
    processor: Arc<dyn ItemProcessor<I, O>>,
    writer: WriterFactory<O>,
}

impl<I, O> Clone for ChunkStep<I, O> {
    fn clone(&self) -> Self {
        Self {
            chunk_size: self.chunk_size,
            policy: self.policy.clone(),
            reader: self.reader.clone(),
            processor: self.processor.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<I, O> ChunkStep<I, O>
where
    I: Debug + Send + 'static,
    O: Debug + Send + 'static,
{
    pub fn new<R, RF, P, W, WF>(chunk_size: usize, reader: RF, processor: P, writer: WF) -> Self
    where
        R: ItemReader<Item = I> + 'static,
        RF: Fn(&StepScope) -> Result<R, ItemError> + Send + Sync + 'static,
        P: ItemProcessor<I, O> + 'static,
        W: ItemWriter<O> + 'static,
        WF: Fn(&StepScope) -> Result<W, ItemError> + Send + Sync + 'static,
    {
        Self {
            chunk_size,
            policy: FaultPolicy::strict(),
            reader: Arc::new(move |scope: &StepScope| {
                reader(scope).map(|r| Box::new(r) as Box<dyn ItemReader<Item = I>>)
            }),
            processor: Arc::new(processor),
            writer: Arc::new(move |scope: &StepScope| {
                writer(scope).map(|w| Box::new(w) as Box<dyn ItemWriter<O>>)
            }),
        }
    }

    pub fn with_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &FaultPolicy {
        &self.policy
    }
}

impl<I, O> ChunkRunner for ChunkStep<I, O>
where
    I: Debug + Send + 'static,
    O: Debug + Send + 'static,
{
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn run(&self, scope: &StepScope, step: &mut StepExecution, runtime: &StepRuntime) -> StepOutcome {
        let reader = match (self.reader)(scope) {
            Ok(reader) => reader,
            Err(err) => return StepOutcome::Failed(format!("reader could not be created: {err}")),
        };
        let writer = match (self.writer)(scope) {
            Ok(writer) => writer,
            Err(err) => return StepOutcome::Failed(format!("writer could not be created: {err}")),
        };

        let mut pipeline = Pipeline {
            def: self,
            step,
            runtime,
            reader,
            writer,
            render: runtime.observers.wants_items(),
            resume_scan: 0,
            scan_base: 0,
        };
        pipeline.run()
    }
}

/// Outcome of one chunk.
enum ChunkEnd {
    More,
    Exhausted,
}

struct Pipeline<'a, I, O> {
    def: &'a ChunkStep<I, O>,
    step: &'a mut StepExecution,
    runtime: &'a StepRuntime,
    reader: Box<dyn ItemReader<Item = I>>,
    writer: Box<dyn ItemWriter<O>>,
    render: bool,
    /// Resolved prefix of the first chunk after a restart.
    resume_scan: usize,
    /// Offset of the chunk slice being processed within the chunk read.
    scan_base: usize,
}

impl<I: Debug, O: Debug> Pipeline<'_, I, O> {
    fn run(&mut self) -> StepOutcome {
        if let Err(err) = self.reader.open(&self.step.execution_context) {
            return StepOutcome::Failed(format!("reader could not be opened: {err}"));
        }
        self.resume_scan = self
            .step
            .execution_context
            .get_u64(SCAN_PROGRESS_KEY)
            .map_or(0, |n| n as usize);

        loop {
            if self.runtime.stop.is_requested() {
                debug!(step_name = %self.step.step_name, "stop requested, leaving at chunk boundary");
                return StepOutcome::Stopped;
            }
            match self.chunk() {
                Ok(ChunkEnd::More) => continue,
                Ok(ChunkEnd::Exhausted) => return StepOutcome::Completed,
                Err(reason) => return StepOutcome::Failed(reason),
            }
        }
    }

    fn chunk(&mut self) -> Result<ChunkEnd, String> {
        let (inputs, exhausted) = self.read_chunk()?;
        let resolved = std::mem::take(&mut self.resume_scan).min(inputs.len());
        self.scan_base = resolved;
        if resolved > 0 {
            debug!(
                step_name = %self.step.step_name,
                resolved,
                "dropping items already written before restart"
            );
        }
        if resolved < inputs.len() {
            self.process_and_write(&inputs[resolved..])?;
        } else if resolved > 0 {
            self.save_position()?;
        }
        Ok(if exhausted {
            ChunkEnd::Exhausted
        } else {
            ChunkEnd::More
        })
    }

    fn read_chunk(&mut self) -> Result<(Vec<I>, bool), String> {
        let size = self.def.chunk_size;
        let mut inputs = Vec::with_capacity(size);

        while inputs.len() < size {
            match self.reader.read() {
                Ok(Some(item)) => {
                    self.step.read_count += 1;
                    if self.render {
                        self.runtime.observers.after_read(&ItemEvent {
                            step_name: self.step.step_name.clone(),
                            phase: Phase::Read,
                            item: format!("{item:?}"),
                            output: None,
                        });
                    }
                    inputs.push(item);
                }
                Ok(None) => return Ok((inputs, true)),
                Err(err) => {
                    self.report_error(Phase::Read, None, &err);
                    if self.def.policy.can_skip(&err, self.step.skip_count()) {
                        self.step.read_skip_count += 1;
                        self.report_skip(Phase::Read, None, &err);
                        continue;
                    }
                    return Err(format!("read failed: {err}"));
                }
            }
        }
        Ok((inputs, false))
    }

    fn process_and_write(&mut self, inputs: &[I]) -> Result<(), String> {
        // Skip decisions survive chunk retries so an item is never counted twice.
        let mut process_skipped = vec![false; inputs.len()];
        let mut write_skipped = vec![false; inputs.len()];
        let mut retries: u32 = 0;

        loop {
            let (mut indices, mut outputs, filtered) =
                match self.process(inputs, &mut process_skipped) {
                    Ok(processed) => processed,
                    Err(err) => {
                        self.retry_or_fail(&err, &mut retries, Phase::Process)?;
                        continue;
                    }
                };

            if write_skipped.iter().any(|s| *s) {
                (indices, outputs) = indices
                    .into_iter()
                    .zip(outputs)
                    .filter(|(i, _)| !write_skipped[*i])
                    .unzip();
            }

            match self.write(&mut indices, &mut outputs, &mut write_skipped) {
                Ok(WriteEnd::Committed) => {
                    return self.commit(outputs.len() as u64, filtered);
                }
                Ok(WriteEnd::Scan) => {
                    return self.scan(inputs, indices, outputs, filtered, &mut write_skipped);
                }
                Err(err) => {
                    self.retry_or_fail(&err, &mut retries, Phase::Write)?;
                }
            }
        }
    }

    /// Process every input not already skipped. Returns input positions and
    /// outputs in lockstep, plus the number of filtered items.
    fn process(
        &mut self,
        inputs: &[I],
        skipped: &mut [bool],
    ) -> Result<(Vec<usize>, Vec<O>, u64), ItemError> {
        let mut indices = Vec::with_capacity(inputs.len());
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut filtered = 0u64;
        let mut skipped_here = false;

        for (idx, item) in inputs.iter().enumerate() {
            if skipped[idx] {
                continue;
            }
            match self.def.processor.process(item) {
                Ok(output) => {
                    if self.render {
                        self.runtime.observers.after_process(&ItemEvent {
                            step_name: self.step.step_name.clone(),
                            phase: Phase::Process,
                            item: format!("{item:?}"),
                            output: output.as_ref().map(|o| format!("{o:?}")),
                        });
                    }
                    match output {
                        Some(output) => {
                            indices.push(idx);
                            outputs.push(output);
                        }
                        None => filtered += 1,
                    }
                }
                Err(err) => {
                    let rendered = self.render.then(|| format!("{item:?}"));
                    self.report_error(Phase::Process, rendered.clone(), &err);
                    if self.def.policy.can_skip(&err, self.step.skip_count()) {
                        skipped[idx] = true;
                        skipped_here = true;
                        self.step.process_skip_count += 1;
                        self.report_skip(Phase::Process, rendered, &err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        if skipped_here {
            self.step.rollback_count += 1;
            debug!(
                step_name = %self.step.step_name,
                "chunk rolled back, redoing it without skipped items"
            );
        }
        Ok((indices, outputs, filtered))
    }

    fn write(
        &mut self,
        indices: &mut Vec<usize>,
        outputs: &mut Vec<O>,
        write_skipped: &mut [bool],
    ) -> Result<WriteEnd, ItemError> {
        loop {
            if outputs.is_empty() {
                return Ok(WriteEnd::Committed);
            }

            self.runtime.observers.before_write(&ChunkEvent {
                step_name: self.step.step_name.clone(),
                size: outputs.len(),
            });

            let err = match self.writer.write(outputs.as_slice()) {
                Ok(()) => {
                    self.runtime.observers.after_write(&ChunkEvent {
                        step_name: self.step.step_name.clone(),
                        size: outputs.len(),
                    });
                    return Ok(WriteEnd::Committed);
                }
                Err(err) => err,
            };

            let offending = err.item_index.filter(|i| *i < outputs.len());
            let rendered = match offending {
                Some(i) if self.render => Some(format!("{:?}", outputs[i])),
                _ => None,
            };
            self.report_error(Phase::Write, rendered.clone(), &err);

            if !self.def.policy.can_skip(&err, self.step.skip_count()) {
                return Err(err);
            }

            self.step.rollback_count += 1;
            let Some(i) = offending else {
                warn!(
                    step_name = %self.step.step_name,
                    items = outputs.len(),
                    "write failed without item position, rolling back to write items one by one"
                );
                return Ok(WriteEnd::Scan);
            };

            let input_idx = indices.remove(i);
            outputs.remove(i);
            write_skipped[input_idx] = true;
            self.step.write_skip_count += 1;
            self.report_skip(Phase::Write, rendered, &err);
        }
    }

    /// Write items one per transaction after a chunk write failed without
    /// pointing at an item.
    fn scan(
        &mut self,
        inputs: &[I],
        indices: Vec<usize>,
        outputs: Vec<O>,
        filtered: u64,
        write_skipped: &mut [bool],
    ) -> Result<(), String> {
        for (input_idx, output) in indices.into_iter().zip(outputs) {
            let mut retries: u32 = 0;
            loop {
                let err = match self.writer.write(std::slice::from_ref(&output)) {
                    Ok(()) => {
                        self.step.write_count += 1;
                        self.step.commit_count += 1;
                        break;
                    }
                    Err(err) => err,
                };

                let rendered = self.render.then(|| format!("{:?}", inputs[input_idx]));
                self.report_error(Phase::Write, rendered.clone(), &err);
                if self.def.policy.can_skip(&err, self.step.skip_count()) {
                    self.step.rollback_count += 1;
                    write_skipped[input_idx] = true;
                    self.step.write_skip_count += 1;
                    self.report_skip(Phase::Write, rendered, &err);
                    break;
                }
                self.retry_or_fail(&err, &mut retries, Phase::Write)?;
            }
            self.save_scan_progress(input_idx + 1)?;
        }
        self.step.filter_count += filtered;
        self.save_position()
    }

    /// Checkpoint the resolved prefix of a chunk being written one by one. The
    /// reader position stays at the start of the chunk.
    fn save_scan_progress(&mut self, resolved: usize) -> Result<(), String> {
        self.step
            .execution_context
            .put_u64(SCAN_PROGRESS_KEY, (self.scan_base + resolved) as u64);
        self.step.touch();
        self.runtime
            .checkpoint
            .save(self.step)
            .map_err(|err| format!("checkpoint failed: {err:#}"))
    }

    fn retry_or_fail(&mut self, err: &ItemError, retries: &mut u32, phase: Phase) -> Result<(), String> {
        if self.def.policy.can_retry(err, *retries) {
            *retries += 1;
            self.step.rollback_count += 1;
            warn!(
                step_name = %self.step.step_name,
                phase = %phase,
                attempt = *retries,
                error = %err,
                "chunk rolled back, retrying"
            );
            return Ok(());
        }
        Err(format!("{phase} failed: {err}"))
    }

    fn commit(&mut self, written: u64, filtered: u64) -> Result<(), String> {
        self.step.write_count += written;
        self.step.filter_count += filtered;
        self.step.commit_count += 1;
        debug!(
            step_name = %self.step.step_name,
            written,
            commit = self.step.commit_count,
            "chunk committed"
        );
        self.save_position()
    }

    fn save_position(&mut self) -> Result<(), String> {
        self.step.execution_context.remove(SCAN_PROGRESS_KEY);
        self.reader.update(&mut self.step.execution_context);
        self.step.touch();
        self.runtime
            .checkpoint
            .save(self.step)
            .map_err(|err| format!("checkpoint failed: {err:#}"))
    }

    fn report_error(&self, phase: Phase, item: Option<String>, error: &ItemError) {
        self.runtime.observers.on_error(&ErrorEvent {
            step_name: self.step.step_name.clone(),
            phase,
            item,
            error: error.clone(),
        });
    }

    fn report_skip(&self, phase: Phase, item: Option<String>, error: &ItemError) {
        self.runtime.observers.on_skip(&SkipEvent {
            step_name: self.step.step_name.clone(),
            phase,
            item,
            error: error.clone(),
        });
    }
}

enum WriteEnd {
    Committed,
    Scan,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use forgebatch_core::{ExecutionId, JobParameters};
    use proptest::prelude::*;

    use crate::item::{ErrorKind, PassThrough, VecReader};
    use crate::observer::{Observer, Observers};
    use crate::step::{NoCheckpoint, StopSignal};

    fn scope() -> StepScope {
        StepScope::new(ExecutionId::new(1), "testJob", "testStep", JobParameters::new())
    }

    fn run<I, O>(def: &ChunkStep<I, O>, runtime: &StepRuntime) -> (StepOutcome, StepExecution)
    where
        I: Debug + Send + 'static,
        O: Debug + Send + 'static,
    {
        let mut step = StepExecution::new(ExecutionId::new(1), "testStep");
        let outcome = def.run(&scope(), &mut step, runtime);
        (outcome, step)
    }

    struct SharedWriter(Arc<Mutex<Vec<i64>>>);

    impl ItemWriter<i64> for SharedWriter {
        fn write(&mut self, items: &[i64]) -> Result<(), ItemError> {
            self.0.lock().unwrap().extend_from_slice(items);
            Ok(())
        }
    }

    fn numbers(n: i64) -> Vec<i64> {
        (1..=n).collect()
    }

    fn collecting(n: i64, chunk: usize) -> (ChunkStep<i64, i64>, Arc<Mutex<Vec<i64>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let target = written.clone();
        let def = ChunkStep::new(
            chunk,
            move |_| Ok(VecReader::new("numbers", numbers(n))),
            PassThrough,
            move |_| Ok(SharedWriter(target.clone())),
        );
        (def, written)
    }

    #[test]
    fn fault_free_run_counts_reads_writes_and_commits() {
        let (def, written) = collecting(5, 2);
        let (outcome, step) = run(&def, &StepRuntime::detached());

        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(step.read_count, 5);
        assert_eq!(step.write_count, 5);
        assert_eq!(step.commit_count, 3);
        assert_eq!(step.rollback_count, 0);
        assert_eq!(*written.lock().unwrap(), numbers(5));
        assert_eq!(step.execution_context.get_u64("numbers.read.count"), Some(5));
    }

    #[test]
    fn exact_multiple_does_not_commit_an_empty_chunk() {
        let (def, _) = collecting(4, 2);
        let (_, step) = run(&def, &StepRuntime::detached());
        assert_eq!(step.commit_count, 2);
    }

    #[test]
    fn empty_source_completes_without_commits() {
        let (def, _) = collecting(0, 3);
        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(step.commit_count, 0);
    }

    fn rejecting(bad: &'static [i64]) -> impl Fn(&i64) -> Result<Option<i64>, ItemError> + Send + Sync {
        move |x: &i64| {
            if bad.contains(x) {
                Err(ItemError::validation(format!("{x} rejected")))
            } else {
                Ok(Some(*x))
            }
        }
    }

    #[test]
    fn process_skips_within_limit_complete_the_step() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let target = written.clone();
        let def = ChunkStep::new(
            3,
            |_| Ok(VecReader::new("numbers", numbers(7))),
            rejecting(&[2, 6]),
            move |_| Ok(SharedWriter(target.clone())),
        )
        .with_policy(FaultPolicy::tolerant(2, 0));

        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(step.process_skip_count, 2);
        assert_eq!(step.write_count, 5);
        assert_eq!(step.commit_count, 3);
        assert_eq!(step.rollback_count, 2);
        assert_eq!(*written.lock().unwrap(), vec![1, 3, 4, 5, 7]);
    }

    #[test]
    fn skips_beyond_limit_fail_the_step() {
        let def = ChunkStep::new(
            10,
            |_| Ok(VecReader::new("numbers", numbers(5))),
            rejecting(&[1, 2, 3]),
            |_| Ok(|_: &[i64]| -> Result<(), ItemError> { Ok(()) }),
        )
        .with_policy(FaultPolicy::tolerant(2, 0));

        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert!(matches!(outcome, StepOutcome::Failed(msg) if msg.contains("3 rejected")));
        assert_eq!(step.process_skip_count, 2);
        assert_eq!(step.write_count, 0);
    }

    #[test]
    fn transient_processor_failure_retries_the_chunk() {
        let failures = Arc::new(AtomicU32::new(0));
        let seen = failures.clone();
        let def = ChunkStep::new(
            2,
            |_| Ok(VecReader::new("numbers", numbers(4))),
            move |x: &i64| -> Result<Option<i64>, ItemError> {
                if *x == 3 && seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(ItemError::transient("deadlock"));
                }
                Ok(Some(*x))
            },
            |_| Ok(|_: &[i64]| -> Result<(), ItemError> { Ok(()) }),
        )
        .with_policy(FaultPolicy::tolerant(0, 3));

        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(step.rollback_count, 2);
        assert_eq!(step.commit_count, 2);
        assert_eq!(step.write_count, 4);
    }

    #[test]
    fn retry_exhaustion_fails_without_counting_final_abort() {
        let def = ChunkStep::new(
            2,
            |_| Ok(VecReader::new("numbers", numbers(2))),
            |_: &i64| -> Result<Option<i64>, ItemError> { Err(ItemError::transient("timeout")) },
            |_| Ok(|_: &[i64]| -> Result<(), ItemError> { Ok(()) }),
        )
        .with_policy(FaultPolicy::tolerant(0, 1));

        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert_eq!(step.rollback_count, 1);
        assert_eq!(step.commit_count, 0);
    }

    #[test]
    fn positioned_write_error_drops_only_that_item() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let target = written.clone();
        let def = ChunkStep::new(
            3,
            |_| Ok(VecReader::new("numbers", numbers(3))),
            PassThrough,
            move |_| {
                let target = target.clone();
                Ok(move |items: &[i64]| -> Result<(), ItemError> {
                    if let Some(pos) = items.iter().position(|x| *x == 2) {
                        return Err(ItemError::validation("constraint violation").at(pos));
                    }
                    target.lock().unwrap().extend_from_slice(items);
                    Ok(())
                })
            },
        )
        .with_policy(FaultPolicy::tolerant(5, 0));

        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(step.write_skip_count, 1);
        assert_eq!(step.rollback_count, 1);
        assert_eq!(step.write_count, 2);
        assert_eq!(step.commit_count, 1);
        assert_eq!(*written.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn unpositioned_write_error_scans_items_one_by_one() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let target = written.clone();
        let def = ChunkStep::new(
            4,
            |_| Ok(VecReader::new("numbers", numbers(4))),
            PassThrough,
            move |_| {
                let target = target.clone();
                Ok(move |items: &[i64]| -> Result<(), ItemError> {
                    if items.contains(&3) {
                        return Err(ItemError::validation("batch insert failed"));
                    }
                    target.lock().unwrap().extend_from_slice(items);
                    Ok(())
                })
            },
        )
        .with_policy(FaultPolicy::tolerant(5, 0));

        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(step.write_skip_count, 1);
        assert_eq!(step.write_count, 3);
        assert_eq!(step.commit_count, 3);
        assert_eq!(step.rollback_count, 2);
        assert_eq!(*written.lock().unwrap(), vec![1, 2, 4]);
    }

    /// Rejects multi-item batches without naming an item, as a bulk insert
    /// would, and hands single items to `single`.
    #[derive(Clone)]
    struct BulkRejecting {
        target: Arc<Mutex<Vec<i64>>>,
        single: Arc<dyn Fn(i64) -> Result<(), ItemError> + Send + Sync>,
    }

    impl BulkRejecting {
        fn new(
            target: Arc<Mutex<Vec<i64>>>,
            single: impl Fn(i64) -> Result<(), ItemError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                target,
                single: Arc::new(single),
            }
        }
    }

    impl ItemWriter<i64> for BulkRejecting {
        fn write(&mut self, items: &[i64]) -> Result<(), ItemError> {
            if items.len() > 1 {
                return Err(ItemError::validation("batch insert failed"));
            }
            for item in items {
                (self.single)(*item)?;
            }
            self.target.lock().unwrap().extend_from_slice(items);
            Ok(())
        }
    }

    #[test]
    fn single_item_writes_are_checkpointed_and_not_repeated_on_restart() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = saved.clone();
        let checkpoint = move |step: &StepExecution| -> anyhow::Result<()> {
            sink.lock().unwrap().push(step.execution_context.get_u64(SCAN_PROGRESS_KEY));
            Ok(())
        };
        let runtime = StepRuntime::new(Arc::new(Observers::new()), StopSignal::new(), Arc::new(checkpoint));

        let failing = ChunkStep::new(
            4,
            |_| Ok(VecReader::new("numbers", numbers(4))),
            PassThrough,
            {
                let writer = BulkRejecting::new(written.clone(), |x| {
                    if x == 3 {
                        return Err(ItemError::fatal("disk full"));
                    }
                    Ok(())
                });
                move |_| Ok(writer.clone())
            },
        )
        .with_policy(FaultPolicy::tolerant(5, 0));

        let (outcome, first) = run(&failing, &runtime);
        assert_eq!(outcome, StepOutcome::Failed("write failed: fatal error: disk full".into()));
        assert_eq!(*written.lock().unwrap(), vec![1, 2]);
        assert_eq!(first.commit_count, 2);
        assert_eq!(*saved.lock().unwrap(), vec![Some(1), Some(2)]);

        let target = written.clone();
        let healthy = ChunkStep::new(
            4,
            |_| Ok(VecReader::new("numbers", numbers(4))),
            PassThrough,
            move |_| Ok(SharedWriter(target.clone())),
        );
        let mut step = StepExecution::new(ExecutionId::new(2), "testStep")
            .with_context(first.execution_context.clone());
        let outcome = healthy.run(&scope(), &mut step, &StepRuntime::detached());

        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(*written.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(step.write_count, 2);
        assert_eq!(step.commit_count, 1);
        assert!(!step.execution_context.contains(SCAN_PROGRESS_KEY));
    }

    #[test]
    fn transient_single_item_write_is_retried() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(AtomicU32::new(0));
        let def = ChunkStep::new(
            3,
            |_| Ok(VecReader::new("numbers", numbers(3))),
            PassThrough,
            {
                let writer = BulkRejecting::new(written.clone(), move |x| {
                    if x == 2 && failures.fetch_add(1, Ordering::SeqCst) < 1 {
                        return Err(ItemError::transient("deadlock"));
                    }
                    Ok(())
                });
                move |_| Ok(writer.clone())
            },
        )
        .with_policy(FaultPolicy::tolerant(5, 2));

        let (outcome, step) = run(&def, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(*written.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(step.write_count, 3);
        assert_eq!(step.commit_count, 3);
        assert_eq!(step.skip_count(), 0);
        // One for falling back to single writes, one for the retried item.
        assert_eq!(step.rollback_count, 2);
    }

    #[test]
    fn filtered_items_are_not_skips() {
        let def = ChunkStep::new(
            2,
            |_| Ok(VecReader::new("numbers", numbers(5))),
            |x: &i64| -> Result<Option<i64>, ItemError> { Ok((x % 2 == 1).then_some(*x)) },
            |_| Ok(|_: &[i64]| -> Result<(), ItemError> { Ok(()) }),
        );

        let (_, step) = run(&def, &StepRuntime::detached());
        assert_eq!(step.filter_count, 2);
        assert_eq!(step.write_count, 3);
        assert_eq!(step.skip_count(), 0);
        assert_eq!(step.commit_count, 3);
    }

    #[test]
    fn fatal_write_error_fails_step() {
        let def = ChunkStep::new(
            2,
            |_| Ok(VecReader::new("numbers", numbers(2))),
            PassThrough,
            |_| Ok(|_: &[i64]| -> Result<(), ItemError> { Err(ItemError::fatal("disk full")) }),
        )
        .with_policy(FaultPolicy::tolerant(10, 10).skip(ErrorKind::Transient));

        let (outcome, _) = run(&def, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Failed("write failed: fatal error: disk full".into()));
    }

    #[test]
    fn stop_request_is_honoured_at_the_next_chunk_boundary() {
        let stop = StopSignal::new();
        let trigger = stop.clone();
        let observers = Observers::new().with(Observer::new("stopper").on_after_write(move |_| {
            trigger.request();
            Ok(())
        }));
        let runtime = StepRuntime::new(Arc::new(observers), stop, Arc::new(NoCheckpoint));

        let (def, written) = collecting(10, 3);
        let (outcome, step) = run(&def, &runtime);

        assert_eq!(outcome, StepOutcome::Stopped);
        assert_eq!(step.commit_count, 1);
        assert_eq!(written.lock().unwrap().len(), 3);
        assert_eq!(step.execution_context.get_u64("numbers.read.count"), Some(3));
    }

    #[test]
    fn restart_resumes_after_last_commit() {
        let (def, written) = collecting(7, 3);
        let mut step = StepExecution::new(ExecutionId::new(1), "testStep");
        step.execution_context.put_u64("numbers.read.count", 6);

        let outcome = def.run(&scope(), &mut step, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(*written.lock().unwrap(), vec![7]);
        assert_eq!(step.read_count, 1);
    }

    #[test]
    fn checkpoint_is_saved_after_every_commit() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = saved.clone();
        let checkpoint = move |step: &StepExecution| -> anyhow::Result<()> {
            sink.lock().unwrap().push(step.commit_count);
            Ok(())
        };
        let runtime = StepRuntime::new(Arc::new(Observers::new()), StopSignal::new(), Arc::new(checkpoint));

        let (def, _) = collecting(5, 2);
        run(&def, &runtime);
        assert_eq!(*saved.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn failing_checkpoint_fails_the_step() {
        let checkpoint = |_: &StepExecution| -> anyhow::Result<()> { anyhow::bail!("ledger down") };
        let runtime = StepRuntime::new(Arc::new(Observers::new()), StopSignal::new(), Arc::new(checkpoint));

        let (def, _) = collecting(5, 2);
        let (outcome, step) = run(&def, &runtime);
        assert!(matches!(outcome, StepOutcome::Failed(msg) if msg.contains("ledger down")));
        assert_eq!(step.commit_count, 1);
    }

    proptest! {
        #[test]
        fn commit_count_is_ceil_of_items_over_chunk(k in 0i64..200, c in 1usize..17) {
            let (def, _) = collecting(k, c);
            let (outcome, step) = run(&def, &StepRuntime::detached());

            prop_assert_eq!(outcome, StepOutcome::Completed);
            prop_assert_eq!(step.read_count, k as u64);
            prop_assert_eq!(step.write_count, k as u64);
            prop_assert_eq!(step.commit_count, (k as u64).div_ceil(c as u64));
            prop_assert_eq!(step.rollback_count, 0);
        }

        #[test]
        fn skipped_plus_written_equals_read(k in 1i64..100, c in 1usize..10, every in 2i64..7) {
            let def = ChunkStep::new(
                c,
                move |_| Ok(VecReader::new("numbers", numbers(k))),
                move |x: &i64| -> Result<Option<i64>, ItemError> {
                    if x % every == 0 { Err(ItemError::validation("bad")) } else { Ok(Some(*x)) }
                },
                |_| Ok(|_: &[i64]| -> Result<(), ItemError> { Ok(()) }),
            )
            .with_policy(FaultPolicy::tolerant(u64::MAX, 0));

            let (outcome, step) = run(&def, &StepRuntime::detached());
            prop_assert_eq!(outcome, StepOutcome::Completed);
            prop_assert_eq!(step.process_skip_count, (k / every) as u64);
            prop_assert_eq!(step.write_count + step.skip_count(), k as u64);
        }
    }
}
