//! Public entry point: launch, stop, restart, abandon and query job executions.
//!
//! The orchestrator composes the job catalog, the job lock and the execution
//! ledger. A launch holds the job's lock from acquisition until the execution
//! reaches a terminal status; the [`LockLease`] travels with the execution onto
//! whichever thread runs it, so asynchronous runs release from their own thread.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use chrono::Utc;
use forgebatch_core::{
    BatchError, BatchResult, BatchStatus, ExecutionId, ExecutionSummary, JobExecution, JobInfo,
    JobParameters,
};
use forgebatch_engine::{JobCatalog, JobDefinition, Observer, Observers, StopSignal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{BatchConfig, ConfigError};
use crate::ledger::{ExecutionLedger, InMemoryLedger, LedgerError};
use crate::lock::{BatchLock, InMemoryLockManager, LockManager, LockLease};

mod handle;
mod pool;
mod runner;

pub use handle::ExecutionHandle;
pub use pool::{Permit, PermitPool, fan_out};
pub use runner::PARTITION_PLAN_KEY;

use runner::JobRunner;

/// Launch request as received from outer layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub job_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Return immediately and run on a background thread.
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

impl RunRequest {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.run_async = true;
        self
    }
}

#[derive(Debug, Clone)]
struct RunningExecution {
    job_name: String,
    stop: StopSignal,
}

struct Inner {
    catalog: JobCatalog,
    ledger: Arc<dyn ExecutionLedger>,
    lock: BatchLock,
    config: BatchConfig,
    observers: Observers,
    running: Mutex<HashMap<ExecutionId, RunningExecution>>,
    chunk_permits: PermitPool,
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, HashMap<ExecutionId, RunningExecution>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Cheap to clone; clones share catalog, ledger, lock and running executions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("jobs", &self.inner.catalog.names())
            .field("lock", &self.inner.lock)
            .finish_non_exhaustive()
    }
}

pub struct OrchestratorBuilder {
    catalog: JobCatalog,
    ledger: Option<Arc<dyn ExecutionLedger>>,
    lock_manager: Option<Arc<dyn LockManager>>,
    config: BatchConfig,
    observers: Observers,
}

impl OrchestratorBuilder {
    pub fn with_ledger(mut self, ledger: Arc<dyn ExecutionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_lock_manager(mut self, manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(manager);
        self
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Observer fired for every job, ahead of the job's own observers.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observers.push(observer);
        self
    }

    /// Defaults to the in-memory ledger and lock manager when none were given.
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        self.config.validate()?;
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new()));
        let manager = self
            .lock_manager
            .unwrap_or_else(|| Arc::new(InMemoryLockManager::new()));

        info!(
            jobs = self.catalog.len(),
            lock_enabled = self.config.lock.enabled,
            chunk_pool_size = self.config.chunk_pool_size,
            partition_pool_size = self.config.partition_pool_size,
            "orchestrator ready"
        );
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                lock: BatchLock::new(manager, self.config.lock.clone()),
                chunk_permits: PermitPool::new(self.config.chunk_pool_size),
                catalog: self.catalog,
                ledger,
                config: self.config,
                observers: self.observers,
                running: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Orchestrator {
    pub fn builder(catalog: JobCatalog) -> OrchestratorBuilder {
        OrchestratorBuilder {
            catalog,
            ledger: None,
            lock_manager: None,
            config: BatchConfig::default(),
            observers: Observers::new(),
        }
    }

    pub fn catalog(&self) -> &JobCatalog {
        &self.inner.catalog
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        &self.inner.ledger
    }

    /// Launch a job. Fails `NotFound` for unknown jobs and `AlreadyRunning` when
    /// the job's lock is held elsewhere.
    #[instrument(skip(self, request), fields(job_name = %request.job_name, run_async = request.run_async), err)]
    pub fn run(&self, request: RunRequest) -> BatchResult<ExecutionHandle> {
        let job = self.inner.catalog.get(&request.job_name)?;
        let lease = self.acquire(&job)?;

        let parameters = JobParameters::from_map(request.parameters).with_run_time(Utc::now());
        let execution = match self.prepare(&job, &parameters) {
            Ok(execution) => execution,
            Err(err) => {
                release(lease);
                return Err(err);
            }
        };

        info!(execution_id = %execution.id, instance_id = %execution.instance.id, "launching job");
        self.dispatch(job, execution, lease, request.run_async)
    }

    /// Signal a running execution to stop at its next chunk boundary.
    ///
    /// `Ok(true)` when the signal was delivered, `Ok(false)` when the execution
    /// has already finished.
    #[instrument(skip(self), err)]
    pub fn stop(&self, execution_id: ExecutionId) -> BatchResult<bool> {
        let local = self.inner.running().get(&execution_id).cloned();
        if let Some(running) = local {
            running.stop.request();
            self.record_stopping(execution_id);
            info!(job_name = %running.job_name, "stop requested");
            return Ok(true);
        }

        let execution = self.find(execution_id)?;
        if execution.is_running() {
            return Err(BatchError::stop_failure(
                execution_id,
                format!("execution is {} but not owned by this process", execution.status),
            ));
        }
        debug!(status = %execution.status, "stop ignored, execution already finished");
        Ok(false)
    }

    /// Re-launch the instance of a FAILED or STOPPED execution and run it to
    /// completion. Completed steps and partitions are not re-run; other steps
    /// resume from their last committed chunk.
    #[instrument(skip(self), err)]
    pub fn restart(&self, execution_id: ExecutionId) -> BatchResult<ExecutionSummary> {
        let previous = self.find(execution_id)?;
        let job = self.inner.catalog.get(previous.job_name())?;
        if !job.is_restartable() {
            return Err(BatchError::restart_not_allowed(
                execution_id,
                format!("job {} is not restartable", job.name()),
            ));
        }

        let latest = self
            .inner
            .ledger
            .executions_for_instance(previous.instance.id)?
            .into_iter()
            .next()
            .unwrap_or_else(|| previous.clone());
        if !latest.status.is_restartable() {
            return Err(BatchError::restart_not_allowed(
                execution_id,
                format!(
                    "latest execution {} of the instance is {}",
                    latest.id, latest.status
                ),
            ));
        }

        let lease = self.acquire(&job)?;
        let execution = match self
            .inner
            .ledger
            .create_execution(&previous.instance, &previous.parameters)
        {
            Ok(execution) => execution,
            Err(err) => {
                release(lease);
                return Err(BatchError::launch_failure(job.name(), err.to_string()));
            }
        };

        info!(
            previous_execution_id = %previous.id,
            execution_id = %execution.id,
            "restarting job instance"
        );
        self.dispatch(job, execution, lease, false)?.wait()
    }

    /// Mark a finished or orphaned execution ABANDONED so it is never resumed.
    #[instrument(skip(self), err)]
    pub fn abandon(&self, execution_id: ExecutionId) -> BatchResult<ExecutionSummary> {
        let mut execution = self.find(execution_id)?;
        if self.inner.running().contains_key(&execution_id) {
            return Err(BatchError::ExecutionActive(execution_id));
        }
        if execution.is_running() {
            let locked = self
                .inner
                .lock
                .is_locked(execution.job_name())
                .map_err(|err| BatchError::storage(err.to_string()))?;
            if locked {
                return Err(BatchError::ExecutionActive(execution_id));
            }
        }

        execution.mark_abandoned();
        self.inner.ledger.update_execution(&execution)?;
        warn!(job_name = %execution.job_name(), "execution abandoned");
        Ok(ExecutionSummary::from(&execution))
    }

    /// Registered jobs in name order with their latest execution.
    pub fn list_jobs(&self) -> BatchResult<Vec<JobInfo>> {
        self.inner
            .catalog
            .names()
            .into_iter()
            .map(|name| self.describe(&name))
            .collect()
    }

    pub fn job_info(&self, job_name: &str) -> BatchResult<JobInfo> {
        let job = self.inner.catalog.get(job_name)?;
        self.describe(job.name())
    }

    pub fn get_execution(&self, execution_id: ExecutionId) -> BatchResult<ExecutionSummary> {
        self.find(execution_id).map(|e| ExecutionSummary::from(&e))
    }

    /// Zero-based page of a job's executions, newest first.
    pub fn history(&self, job_name: &str, page: usize, size: usize) -> BatchResult<Vec<ExecutionSummary>> {
        Ok(self
            .inner
            .ledger
            .history(job_name, page, size)?
            .iter()
            .map(ExecutionSummary::from)
            .collect())
    }

    /// Whether this process is currently running `execution_id`.
    pub fn is_running_locally(&self, execution_id: ExecutionId) -> bool {
        self.inner.running().contains_key(&execution_id)
    }

    fn describe(&self, job_name: &str) -> BatchResult<JobInfo> {
        let latest = self.inner.ledger.latest_execution(job_name)?;
        let running = self
            .inner
            .lock
            .is_locked(job_name)
            .map_err(|err| BatchError::storage(err.to_string()))?;
        Ok(JobInfo::new(job_name, latest.as_ref(), running))
    }

    fn find(&self, execution_id: ExecutionId) -> BatchResult<JobExecution> {
        self.inner
            .ledger
            .get_execution(execution_id)?
            .ok_or_else(|| BatchError::not_found(format!("execution {execution_id}")))
    }

    fn acquire(&self, job: &JobDefinition) -> BatchResult<LockLease> {
        match self.inner.lock.try_lock(job.name()) {
            Ok(Some(lease)) => Ok(lease),
            Ok(None) => Err(BatchError::already_running(job.name())),
            Err(err) => Err(BatchError::launch_failure(
                job.name(),
                format!("could not acquire job lock: {err}"),
            )),
        }
    }

    /// Find or create the instance for `parameters` and open a new execution on it.
    fn prepare(&self, job: &JobDefinition, parameters: &JobParameters) -> BatchResult<JobExecution> {
        let ledger = &self.inner.ledger;
        let launch_failure = |err: LedgerError| BatchError::launch_failure(job.name(), err.to_string());
        let identity = parameters.identity_key();

        let instance = match ledger.find_instance(job.name(), &identity).map_err(launch_failure)? {
            Some(instance) => {
                let latest = ledger
                    .executions_for_instance(instance.id)
                    .map_err(launch_failure)?
                    .into_iter()
                    .next();
                if let Some(latest) = latest {
                    match latest.status {
                        BatchStatus::Completed | BatchStatus::Abandoned => {
                            return Err(BatchError::launch_failure(
                                job.name(),
                                format!("instance already {} by execution {}", latest.status, latest.id),
                            ));
                        }
                        status if status.is_running() => {
                            return Err(BatchError::launch_failure(
                                job.name(),
                                format!("instance has a running execution {}", latest.id),
                            ));
                        }
                        _ if !job.is_restartable() => {
                            return Err(BatchError::launch_failure(
                                job.name(),
                                "instance failed before and the job is not restartable",
                            ));
                        }
                        _ => info!(previous_execution_id = %latest.id, "resuming existing instance"),
                    }
                }
                instance
            }
            None => ledger
                .create_instance(job.name(), &identity)
                .map_err(launch_failure)?,
        };

        ledger
            .create_execution(&instance, parameters)
            .map_err(launch_failure)
    }

    fn dispatch(
        &self,
        job: Arc<JobDefinition>,
        execution: JobExecution,
        lease: LockLease,
        run_async: bool,
    ) -> BatchResult<ExecutionHandle> {
        let execution_id = execution.id;
        let job_name = job.name().to_string();
        let stop = StopSignal::new();
        self.inner.running().insert(
            execution_id,
            RunningExecution {
                job_name: job_name.clone(),
                stop: stop.clone(),
            },
        );

        let runner = JobRunner {
            observers: Arc::new(self.inner.observers.chain(job.observers())),
            job,
            ledger: self.inner.ledger.clone(),
            stop,
            chunk_permits: self.inner.chunk_permits.clone(),
            partition_pool_size: self.inner.config.partition_pool_size,
        };
        let ledger = self.inner.ledger.clone();

        if !run_async {
            let status = execute(&self.inner, &runner, execution, lease);
            return Ok(ExecutionHandle::finished(execution_id, job_name, ledger, status));
        }

        let mut fallback = execution.clone();
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("async-batch-{execution_id}"))
            .spawn(move || execute(&inner, &runner, execution, lease));

        match spawned {
            Ok(join) => Ok(ExecutionHandle::running(execution_id, job_name, ledger, join)),
            Err(err) => {
                // The lease went down with the closure and has been released.
                self.inner.running().remove(&execution_id);
                fallback.mark_failed(format!("could not start execution thread: {err}"));
                if let Err(record_err) = self.inner.ledger.update_execution(&fallback) {
                    warn!(error = %record_err, "could not record launch failure");
                }
                Err(BatchError::launch_failure(job_name, err.to_string()))
            }
        }
    }

    /// Persist STOPPING so queries see the request before the pipeline reacts.
    fn record_stopping(&self, execution_id: ExecutionId) {
        let stored = match self.inner.ledger.get_execution(execution_id) {
            Ok(Some(execution)) => execution,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "could not load execution to record stop request");
                return;
            }
        };
        if !stored.is_running() {
            return;
        }
        let mut stopping = stored;
        stopping.mark_stopping();
        match self.inner.ledger.update_execution(&stopping) {
            Ok(()) | Err(LedgerError::TerminalExecution(_)) => {}
            Err(err) => warn!(error = %err, "could not record stop request"),
        }
    }
}

/// Run to a terminal status, then forget the execution and release its lock.
fn execute(inner: &Inner, runner: &JobRunner, mut execution: JobExecution, lease: LockLease) -> BatchStatus {
    let status = runner.run(&mut execution);
    inner.running().remove(&execution.id);
    release(lease);
    status
}

fn release(lease: LockLease) {
    let job_name = lease.job_name().to_string();
    if let Err(err) = lease.release() {
        warn!(job_name = %job_name, error = %err, "could not release job lock");
    }
}
