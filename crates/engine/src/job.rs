//! Job definitions: an ordered list of named steps plus job-scoped observers.

use std::collections::HashSet;

use forgebatch_core::{BatchError, BatchResult};

use crate::observer::{Observer, Observers};
use crate::step::StepDefinition;

/// Immutable once built; shared by every execution of the job.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    observers: Observers,
    restartable: bool,
}

impl JobDefinition {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            steps: Vec::new(),
            observers: Observers::new(),
            restartable: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }
}

#[derive(Debug)]
pub struct JobBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    observers: Observers,
    restartable: bool,
}

impl JobBuilder {
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.observers.push(observer);
        self
    }

    /// Jobs that must never resume a failed instance opt out here.
    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn build(self) -> BatchResult<JobDefinition> {
        if self.name.trim().is_empty() {
            return Err(BatchError::invalid_definition("job name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(BatchError::invalid_definition(format!(
                "job {} has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            step.validate()
                .map_err(|reason| BatchError::invalid_definition(format!("job {}: {reason}", self.name)))?;
            if !seen.insert(step.name.as_str()) {
                return Err(BatchError::invalid_definition(format!(
                    "job {} declares step {} twice",
                    self.name, step.name
                )));
            }
        }

        Ok(JobDefinition {
            name: self.name,
            steps: self.steps,
            observers: self.observers,
            restartable: self.restartable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::TaskletContext;

    fn noop(name: &str) -> StepDefinition {
        StepDefinition::tasklet(name, |_: &mut TaskletContext<'_>| Ok(()))
    }

    #[test]
    fn builds_job_with_ordered_steps() {
        let job = JobDefinition::builder("dataCleanupJob")
            .step(noop("cleanupOldResults"))
            .step(noop("logStatistics"))
            .step(noop("archiveProcessed"))
            .build()
            .unwrap();

        let names: Vec<_> = job.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["cleanupOldResults", "logStatistics", "archiveProcessed"]);
        assert!(job.is_restartable());
    }

    #[test]
    fn rejects_jobs_without_steps() {
        let err = JobDefinition::builder("emptyJob").build().unwrap_err();
        assert_eq!(err.code(), "B006");
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let err = JobDefinition::builder("dupJob")
            .step(noop("a"))
            .step(noop("a"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("step a twice"));
    }
}
