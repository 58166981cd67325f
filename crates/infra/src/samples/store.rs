//! In-memory sample tables backing the bundled jobs.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use forgebatch_core::ExecutionId;
use forgebatch_engine::{ItemError, KeyRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SampleStatus {
    Active,
    Archived,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Active => "ACTIVE",
            SampleStatus::Archived => "ARCHIVED",
        }
    }
}

impl core::fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: SampleStatus,
    pub amount: Option<f64>,
    pub processed: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Failed => "FAILED",
        }
    }
}

/// Outcome row written by `sampleJob` for each processed sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub id: i64,
    pub sample_id: i64,
    pub job_execution_id: ExecutionId,
    pub status: ResultStatus,
    pub message: String,
    pub processed_at: DateTime<Utc>,
}

/// Result row before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResult {
    pub sample_id: i64,
    pub job_execution_id: ExecutionId,
    pub status: ResultStatus,
    pub message: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("sample {0} does not exist")]
    UnknownSample(i64),

    #[error("sample store state poisoned")]
    Poisoned,
}

impl From<StoreError> for ItemError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownSample(_) => ItemError::validation(err.to_string()),
            StoreError::Poisoned => ItemError::fatal(err.to_string()),
        }
    }
}

/// Which samples a paging query returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SampleQuery {
    /// `processed = false AND status = ACTIVE` (sample processing).
    UnprocessedActive,
    /// `processed = false` in any status (partition workers).
    Unprocessed,
    /// `status = ACTIVE` (file export).
    Active,
}

impl SampleQuery {
    fn matches(&self, sample: &Sample) -> bool {
        match self {
            SampleQuery::UnprocessedActive => !sample.processed && sample.status == SampleStatus::Active,
            SampleQuery::Unprocessed => !sample.processed,
            SampleQuery::Active => sample.status == SampleStatus::Active,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    samples: BTreeMap<i64, Sample>,
    results: BTreeMap<i64, SampleResult>,
    next_sample_id: i64,
    next_result_id: i64,
}

/// Sample and result tables. Multi-row writes are applied all-or-nothing.
#[derive(Debug, Default)]
pub struct SampleStore {
    tables: RwLock<Tables>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }

    /// Insert an ACTIVE, unprocessed sample and return it with its id.
    pub fn insert(
        &self,
        name: impl Into<String>,
        description: Option<String>,
        amount: Option<f64>,
    ) -> Result<Sample, StoreError> {
        let mut tables = self.write()?;
        tables.next_sample_id += 1;
        let sample = Sample {
            id: tables.next_sample_id,
            name: name.into(),
            description,
            status: SampleStatus::Active,
            amount,
            processed: false,
        };
        tables.samples.insert(sample.id, sample.clone());
        Ok(sample)
    }

    pub fn get(&self, id: i64) -> Result<Option<Sample>, StoreError> {
        Ok(self.read()?.samples.get(&id).cloned())
    }

    pub fn samples(&self) -> Result<Vec<Sample>, StoreError> {
        Ok(self.read()?.samples.values().cloned().collect())
    }

    pub fn results(&self) -> Result<Vec<SampleResult>, StoreError> {
        Ok(self.read()?.results.values().cloned().collect())
    }

    /// Next page of matching samples with `id > after`, restricted to `range`
    /// when given, in id order.
    pub fn page(
        &self,
        query: SampleQuery,
        after: Option<i64>,
        range: Option<KeyRange>,
        limit: usize,
    ) -> Result<Vec<Sample>, StoreError> {
        let tables = self.read()?;
        let lo = match (after, range) {
            (Some(after), Some(range)) => after.saturating_add(1).max(range.lo),
            (Some(after), None) => after.saturating_add(1),
            (None, Some(range)) => range.lo,
            (None, None) => i64::MIN,
        };
        let hi = range.map_or(i64::MAX, |r| r.hi);
        if lo > hi || (after == Some(i64::MAX)) {
            return Ok(Vec::new());
        }

        Ok(tables
            .samples
            .range(lo..=hi)
            .map(|(_, s)| s)
            .filter(|s| query.matches(s))
            .take(limit)
            .cloned()
            .collect())
    }

    /// `[min(id), max(id)]` over unprocessed samples, `None` when there are none.
    pub fn unprocessed_bounds(&self) -> Result<Option<KeyRange>, StoreError> {
        let tables = self.read()?;
        let mut ids = tables
            .samples
            .values()
            .filter(|s| SampleQuery::Unprocessed.matches(s))
            .map(|s| s.id);
        let Some(first) = ids.next() else {
            return Ok(None);
        };
        let last = ids.last().unwrap_or(first);
        Ok(Some(KeyRange::new(first, last)))
    }

    /// Store results and mark their samples processed in one transaction.
    pub fn commit_results(&self, results: &[NewResult]) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if let Some(missing) = results.iter().find(|r| !tables.samples.contains_key(&r.sample_id)) {
            return Err(StoreError::UnknownSample(missing.sample_id));
        }

        for result in results {
            tables.next_result_id += 1;
            let id = tables.next_result_id;
            tables.results.insert(
                id,
                SampleResult {
                    id,
                    sample_id: result.sample_id,
                    job_execution_id: result.job_execution_id,
                    status: result.status,
                    message: result.message.clone(),
                    processed_at: result.processed_at,
                },
            );
            if let Some(sample) = tables.samples.get_mut(&result.sample_id) {
                sample.processed = true;
            }
        }
        Ok(())
    }

    /// Mark samples processed; all ids must exist.
    pub fn mark_processed(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let mut tables = self.write()?;
        if let Some(missing) = ids.iter().find(|id| !tables.samples.contains_key(id)) {
            return Err(StoreError::UnknownSample(*missing));
        }
        let mut changed = 0;
        for id in ids {
            if let Some(sample) = tables.samples.get_mut(id) {
                changed += usize::from(!sample.processed);
                sample.processed = true;
            }
        }
        Ok(changed)
    }

    pub fn delete_results_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.write()?;
        let before = tables.results.len();
        tables.results.retain(|_, r| r.processed_at >= cutoff);
        Ok(before - tables.results.len())
    }

    /// Sample counts per status.
    pub fn status_counts(&self) -> Result<BTreeMap<&'static str, usize>, StoreError> {
        let tables = self.read()?;
        let mut counts = BTreeMap::new();
        for sample in tables.samples.values() {
            *counts.entry(sample.status.as_str()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Move processed ACTIVE samples to ARCHIVED.
    pub fn archive_processed(&self) -> Result<usize, StoreError> {
        let mut tables = self.write()?;
        let mut archived = 0;
        for sample in tables.samples.values_mut() {
            if sample.processed && sample.status == SampleStatus::Active {
                sample.status = SampleStatus::Archived;
                archived += 1;
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store_with(amounts: &[Option<f64>]) -> SampleStore {
        let store = SampleStore::new();
        for (i, amount) in amounts.iter().enumerate() {
            store.insert(format!("sample-{i}"), None, *amount).unwrap();
        }
        store
    }

    fn result(sample_id: i64, at: DateTime<Utc>) -> NewResult {
        NewResult {
            sample_id,
            job_execution_id: ExecutionId::new(1),
            status: ResultStatus::Success,
            message: "ok".into(),
            processed_at: at,
        }
    }

    #[test]
    fn paging_walks_ids_after_cursor() {
        let store = store_with(&[Some(1.0); 5]);
        let first = store.page(SampleQuery::UnprocessedActive, None, None, 2).unwrap();
        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);

        let next = store.page(SampleQuery::UnprocessedActive, Some(2), None, 2).unwrap();
        assert_eq!(next.iter().map(|s| s.id).collect::<Vec<_>>(), vec![3, 4]);

        let scoped = store
            .page(SampleQuery::Unprocessed, None, Some(KeyRange::new(2, 3)), 10)
            .unwrap();
        assert_eq!(scoped.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn commit_is_all_or_nothing() {
        let store = store_with(&[Some(1.0), Some(2.0)]);
        let now = Utc::now();

        let err = store.commit_results(&[result(1, now), result(99, now)]).unwrap_err();
        assert_eq!(err, StoreError::UnknownSample(99));
        assert!(store.results().unwrap().is_empty());
        assert!(!store.get(1).unwrap().unwrap().processed);

        store.commit_results(&[result(1, now), result(2, now)]).unwrap();
        assert_eq!(store.results().unwrap().len(), 2);
        assert_eq!(store.unprocessed_bounds().unwrap(), None);
    }

    #[test]
    fn bounds_cover_unprocessed_ids_only() {
        let store = store_with(&[Some(1.0); 6]);
        store.mark_processed(&[1, 6]).unwrap();
        assert_eq!(store.unprocessed_bounds().unwrap(), Some(KeyRange::new(2, 5)));
    }

    #[test]
    fn cleanup_and_archive() {
        let store = store_with(&[Some(1.0), Some(2.0), Some(3.0)]);
        let now = Utc::now();
        store
            .commit_results(&[result(1, now - chrono::Duration::days(40)), result(2, now)])
            .unwrap();

        assert_eq!(store.delete_results_older_than(now - chrono::Duration::days(30)).unwrap(), 1);
        assert_eq!(store.archive_processed().unwrap(), 2);

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.get("ARCHIVED"), Some(&2));
        assert_eq!(counts.get("ACTIVE"), Some(&1));
    }

    proptest! {
        #[test]
        fn cursor_paging_visits_each_match_once(
            processed in prop::collection::vec(any::<bool>(), 0..40),
            limit in 1usize..8,
            lo in 0i64..45,
            width in 0i64..45,
        ) {
            let store = SampleStore::new();
            for _ in &processed {
                store.insert("sample", None, Some(1.0)).unwrap();
            }
            let done: Vec<i64> = (1..).zip(&processed).filter(|(_, p)| **p).map(|(id, _)| id).collect();
            store.mark_processed(&done).unwrap();

            let range = KeyRange::new(lo, lo + width);
            let mut seen = Vec::new();
            let mut after = None;
            loop {
                let page = store.page(SampleQuery::Unprocessed, after, Some(range), limit).unwrap();
                prop_assert!(page.len() <= limit);
                let Some(last) = page.last() else { break };
                after = Some(last.id);
                seen.extend(page.iter().map(|s| s.id));
            }

            let expected: Vec<i64> = (1..)
                .zip(&processed)
                .filter(|(id, p)| !**p && range.contains(*id))
                .map(|(id, _)| id)
                .collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
