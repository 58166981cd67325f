//! Spans carrying job and step identity.
//!
//! Enter a job span on whichever thread runs the job (including async and
//! partition worker threads) so every event inside is tagged with the job name
//! and execution id.

use std::fmt::Display;

use tracing::{Span, info_span};

pub fn job_span(job_name: &str, execution_id: impl Display) -> Span {
    info_span!("job", job_name = %job_name, execution_id = %execution_id)
}

pub fn step_span(step_name: &str) -> Span {
    info_span!("step", step_name = %step_name)
}

/// Span for one partition worker, parented explicitly since it runs on a pool thread.
pub fn partition_span(parent: &Span, step_name: &str, partition: &str) -> Span {
    info_span!(parent: parent, "partition", step_name = %step_name, partition = %partition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_can_be_entered_without_a_subscriber() {
        let job = job_span("sampleJob", 7);
        let _job = job.enter();
        let step = step_span("sampleStep");
        let _step = step.enter();
        let worker = partition_span(&step, "workerStep:partition0", "partition0");
        let _ = worker.enter();
    }
}
