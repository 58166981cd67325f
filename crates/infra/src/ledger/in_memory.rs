use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use forgebatch_core::{
    BatchStatus, ExecutionId, InstanceId, JobExecution, JobInstance, JobParameters, StepExecution,
    StepExecutionId,
};

use super::{ExecutionLedger, LedgerError, page, sort_newest_first};

#[derive(Debug, Default)]
struct State {
    instances: BTreeMap<InstanceId, JobInstance>,
    identities: HashMap<(String, String), InstanceId>,
    executions: BTreeMap<ExecutionId, JobExecution>,
    next_instance: u64,
    next_execution: u64,
    next_step: u64,
}

/// In-memory execution ledger.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, LedgerError> {
        self.state.read().map_err(|_| LedgerError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, LedgerError> {
        self.state.write().map_err(|_| LedgerError::Poisoned)
    }
}

impl ExecutionLedger for InMemoryLedger {
    fn find_instance(&self, job_name: &str, identity_key: &str) -> Result<Option<JobInstance>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .identities
            .get(&(job_name.to_string(), identity_key.to_string()))
            .and_then(|id| state.instances.get(id))
            .cloned())
    }

    fn create_instance(&self, job_name: &str, identity_key: &str) -> Result<JobInstance, LedgerError> {
        let mut state = self.write()?;
        let identity = (job_name.to_string(), identity_key.to_string());
        if state.identities.contains_key(&identity) {
            return Err(LedgerError::DuplicateInstance {
                job_name: job_name.to_string(),
                identity_key: identity_key.to_string(),
            });
        }

        state.next_instance += 1;
        let instance = JobInstance {
            id: InstanceId::new(state.next_instance),
            job_name: job_name.to_string(),
            identity_key: identity_key.to_string(),
        };
        state.identities.insert(identity, instance.id);
        state.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    fn create_execution(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution, LedgerError> {
        let mut state = self.write()?;
        if !state.instances.contains_key(&instance.id) {
            return Err(LedgerError::NotFound(format!("instance {}", instance.id)));
        }

        state.next_execution += 1;
        let execution = JobExecution::new(
            ExecutionId::new(state.next_execution),
            instance.clone(),
            parameters.clone(),
        );
        state.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    fn update_execution(&self, execution: &JobExecution) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        let stored = state
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| LedgerError::NotFound(format!("execution {}", execution.id)))?;

        if stored.status.is_terminal() && execution.status != BatchStatus::Abandoned {
            return Err(LedgerError::TerminalExecution(execution.id));
        }

        stored.status = execution.status;
        stored.exit_status = execution.exit_status.clone();
        stored.start_time = execution.start_time;
        stored.end_time = execution.end_time;
        stored.last_updated = execution.last_updated;
        stored.execution_context = execution.execution_context.clone();
        stored.failure_messages = execution.failure_messages.clone();
        Ok(())
    }

    fn add_step(&self, step: &mut StepExecution) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        state.next_step += 1;
        let id = StepExecutionId::new(state.next_step);

        let execution = state
            .executions
            .get_mut(&step.job_execution_id)
            .ok_or_else(|| LedgerError::NotFound(format!("execution {}", step.job_execution_id)))?;
        step.id = Some(id);
        execution.step_executions.push(step.clone());
        execution.last_updated = Utc::now();
        Ok(())
    }

    fn update_step(&self, step: &StepExecution) -> Result<(), LedgerError> {
        let id = step
            .id
            .ok_or_else(|| LedgerError::NotFound(format!("step {} has no id", step.step_name)))?;
        let mut state = self.write()?;
        let execution = state
            .executions
            .get_mut(&step.job_execution_id)
            .ok_or_else(|| LedgerError::NotFound(format!("execution {}", step.job_execution_id)))?;

        let slot = execution
            .step_executions
            .iter_mut()
            .find(|s| s.id == Some(id))
            .ok_or_else(|| LedgerError::NotFound(format!("step execution {id}")))?;
        *slot = step.clone();
        execution.last_updated = Utc::now();
        Ok(())
    }

    fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, LedgerError> {
        Ok(self.read()?.executions.get(&id).cloned())
    }

    fn executions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .executions
            .values()
            .rev()
            .filter(|e| e.instance.id == instance_id)
            .cloned()
            .collect())
    }

    fn latest_execution(&self, job_name: &str) -> Result<Option<JobExecution>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .executions
            .values()
            .rev()
            .find(|e| e.job_name() == job_name)
            .cloned())
    }

    fn history(&self, job_name: &str, page_no: usize, size: usize) -> Result<Vec<JobExecution>, LedgerError> {
        let mut executions: Vec<JobExecution> = {
            let state = self.read()?;
            state
                .executions
                .values()
                .filter(|e| e.job_name() == job_name)
                .cloned()
                .collect()
        };
        sort_newest_first(&mut executions);
        Ok(page(executions, page_no, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_core::ExitStatus;

    fn launch(ledger: &InMemoryLedger, job: &str, key: &str) -> JobExecution {
        let instance = match ledger.find_instance(job, key).unwrap() {
            Some(i) => i,
            None => ledger.create_instance(job, key).unwrap(),
        };
        ledger.create_execution(&instance, &JobParameters::new()).unwrap()
    }

    #[test]
    fn instances_are_unique_per_identity() {
        let ledger = InMemoryLedger::new();
        let a = ledger.create_instance("sampleJob", "run.time=1").unwrap();
        assert_eq!(ledger.find_instance("sampleJob", "run.time=1").unwrap(), Some(a));
        assert!(matches!(
            ledger.create_instance("sampleJob", "run.time=1"),
            Err(LedgerError::DuplicateInstance { .. })
        ));
    }

    #[test]
    fn steps_get_ids_and_updates_replace_them() {
        let ledger = InMemoryLedger::new();
        let exec = launch(&ledger, "sampleJob", "k");

        let mut step = StepExecution::new(exec.id, "sampleStep");
        ledger.add_step(&mut step).unwrap();
        assert!(step.id.is_some());

        step.read_count = 4;
        ledger.update_step(&step).unwrap();

        let stored = ledger.get_execution(exec.id).unwrap().unwrap();
        assert_eq!(stored.step("sampleStep").unwrap().read_count, 4);
    }

    #[test]
    fn terminal_executions_only_change_to_abandoned() {
        let ledger = InMemoryLedger::new();
        let mut exec = launch(&ledger, "sampleJob", "k");
        exec.mark_started();
        exec.mark_failed("boom");
        ledger.update_execution(&exec).unwrap();

        exec.mark_finished(BatchStatus::Completed, ExitStatus::completed());
        assert_eq!(
            ledger.update_execution(&exec),
            Err(LedgerError::TerminalExecution(exec.id))
        );

        exec.mark_abandoned();
        ledger.update_execution(&exec).unwrap();
        assert_eq!(
            ledger.get_execution(exec.id).unwrap().unwrap().status,
            BatchStatus::Abandoned
        );
    }

    #[test]
    fn history_pages_newest_first() {
        let ledger = InMemoryLedger::new();
        let ids: Vec<_> = (0..5)
            .map(|i| launch(&ledger, "sampleJob", &format!("run.time={i}")).id)
            .collect();
        launch(&ledger, "otherJob", "x");

        let first = ledger.history("sampleJob", 0, 2).unwrap();
        let second = ledger.history("sampleJob", 1, 2).unwrap();
        let third = ledger.history("sampleJob", 2, 2).unwrap();

        let got: Vec<_> = first.iter().chain(&second).chain(&third).map(|e| e.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(got, expected);
        assert!(ledger.history("sampleJob", 0, 0).unwrap().is_empty());
    }

    #[test]
    fn last_step_execution_prefers_newest_attempt() {
        let ledger = InMemoryLedger::new();
        let first = launch(&ledger, "sampleJob", "k");
        let mut s1 = StepExecution::new(first.id, "sampleStep");
        s1.read_count = 1;
        ledger.add_step(&mut s1).unwrap();

        let second = launch(&ledger, "sampleJob", "k");
        let mut s2 = StepExecution::new(second.id, "sampleStep");
        s2.read_count = 2;
        ledger.add_step(&mut s2).unwrap();

        let last = ledger
            .last_step_execution(first.instance.id, "sampleStep")
            .unwrap()
            .unwrap();
        assert_eq!(last.read_count, 2);
        assert_eq!(
            ledger.latest_execution("sampleJob").unwrap().map(|e| e.id),
            Some(second.id)
        );
    }
}
