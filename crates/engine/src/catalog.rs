//! Name → job definition registry, filled once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use forgebatch_core::{BatchError, BatchResult};
use tracing::info;

use crate::job::JobDefinition;

#[derive(Debug, Clone, Default)]
pub struct JobCatalog {
    jobs: BTreeMap<String, Arc<JobDefinition>>,
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Names are unique; a second registration is rejected.
    pub fn register(&mut self, job: JobDefinition) -> BatchResult<()> {
        if self.jobs.contains_key(job.name()) {
            return Err(BatchError::invalid_definition(format!(
                "job {} is already registered",
                job.name()
            )));
        }
        info!(job_name = %job.name(), steps = job.steps().len(), "job registered");
        self.jobs.insert(job.name().to_string(), Arc::new(job));
        Ok(())
    }

    pub fn with(mut self, job: JobDefinition) -> BatchResult<Self> {
        self.register(job)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> BatchResult<Arc<JobDefinition>> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::not_found(format!("job {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered names in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepDefinition, TaskletContext};

    fn job(name: &str) -> JobDefinition {
        JobDefinition::builder(name)
            .step(StepDefinition::tasklet("only", |_: &mut TaskletContext<'_>| Ok(())))
            .build()
            .unwrap()
    }

    #[test]
    fn lookup_of_unknown_job_is_not_found() {
        let catalog = JobCatalog::new().with(job("sampleJob")).unwrap();
        assert!(catalog.get("sampleJob").is_ok());
        assert!(matches!(catalog.get("nope"), Err(BatchError::NotFound(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut catalog = JobCatalog::new();
        catalog.register(job("sampleJob")).unwrap();
        let err = catalog.register(job("sampleJob")).unwrap_err();
        assert!(matches!(err, BatchError::InvalidDefinition(_)));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn names_are_sorted() {
        let catalog = JobCatalog::new()
            .with(job("partitionJob"))
            .unwrap()
            .with(job("dataCleanupJob"))
            .unwrap();
        assert_eq!(catalog.names(), vec!["dataCleanupJob", "partitionJob"]);
    }
}
