//! Skip and retry policy for chunk-oriented steps.

use serde::{Deserialize, Serialize};

use crate::item::{ErrorKind, ItemError};

/// Bounds on how many failing items a step may drop and how often a failing
/// chunk may be re-attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    /// Maximum cumulative skips per step execution.
    pub skip_limit: u64,
    /// Maximum re-attempts of a single chunk.
    pub retry_limit: u32,
    skippable: Vec<ErrorKind>,
    retryable: Vec<ErrorKind>,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

impl FaultPolicy {
    /// Any item error fails the step.
    pub fn strict() -> Self {
        Self {
            skip_limit: 0,
            retry_limit: 0,
            skippable: Vec::new(),
            retryable: Vec::new(),
        }
    }

    /// Skip bad data and retry transient failures, up to the given limits.
    pub fn tolerant(skip_limit: u64, retry_limit: u32) -> Self {
        Self {
            skip_limit,
            retry_limit,
            skippable: vec![ErrorKind::Validation],
            retryable: vec![ErrorKind::Transient],
        }
    }

    /// Mark an error kind as skippable. Fatal errors are never skipped.
    pub fn skip(mut self, kind: ErrorKind) -> Self {
        if kind != ErrorKind::Fatal && !self.skippable.contains(&kind) {
            self.skippable.push(kind);
        }
        self
    }

    /// Mark an error kind as retryable. Fatal errors are never retried.
    pub fn retry(mut self, kind: ErrorKind) -> Self {
        if kind != ErrorKind::Fatal && !self.retryable.contains(&kind) {
            self.retryable.push(kind);
        }
        self
    }

    pub fn with_skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn is_skippable(&self, kind: ErrorKind) -> bool {
        self.skippable.contains(&kind)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Whether one more item may be skipped given the step's skips so far.
    pub fn can_skip(&self, error: &ItemError, skips_so_far: u64) -> bool {
        self.is_skippable(error.kind) && skips_so_far < self.skip_limit
    }

    /// Whether the current chunk may be re-attempted given its retries so far.
    pub fn can_retry(&self, error: &ItemError, retries_so_far: u32) -> bool {
        self.is_retryable(error.kind) && retries_so_far < self.retry_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_policy_absorbs_nothing() {
        let policy = FaultPolicy::strict();
        assert!(!policy.can_skip(&ItemError::validation("x"), 0));
        assert!(!policy.can_retry(&ItemError::transient("x"), 0));
    }

    #[test]
    fn skip_limit_is_inclusive_of_the_last_allowed_skip() {
        let policy = FaultPolicy::tolerant(2, 0);
        let err = ItemError::validation("bad row");
        assert!(policy.can_skip(&err, 0));
        assert!(policy.can_skip(&err, 1));
        assert!(!policy.can_skip(&err, 2));
    }

    #[test]
    fn retry_limit_counts_re_attempts() {
        let policy = FaultPolicy::tolerant(0, 3);
        let err = ItemError::transient("deadlock");
        assert!(policy.can_retry(&err, 2));
        assert!(!policy.can_retry(&err, 3));
    }

    #[test]
    fn fatal_errors_cannot_be_classified_as_tolerable() {
        let policy = FaultPolicy::tolerant(10, 10)
            .skip(ErrorKind::Fatal)
            .retry(ErrorKind::Fatal);
        let err = ItemError::fatal("disk gone");
        assert!(!policy.can_skip(&err, 0));
        assert!(!policy.can_retry(&err, 0));
    }

    #[test]
    fn kinds_can_be_both_skippable_and_retryable() {
        let policy = FaultPolicy::tolerant(1, 1).skip(ErrorKind::Transient);
        assert!(policy.is_skippable(ErrorKind::Transient));
        assert!(policy.is_retryable(ErrorKind::Transient));
    }
}
