use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use forgebatch_core::{BatchResult, ExecutionContext, ExecutionId};
use forgebatch_engine::{
    ChunkStep, FaultPolicy, ItemError, ItemReader, ItemWriter, JobCatalog, JobDefinition, KeyRange,
    PartitionedStep, PassThrough, StepDefinition, StepScope, TaskletContext,
};
use tracing::info;

use super::store::{NewResult, ResultStatus, Sample, SampleQuery, SampleStore};
use crate::config::BatchConfig;

pub const SAMPLE_JOB: &str = "sampleJob";
pub const PARTITION_JOB: &str = "partitionJob";
pub const DATA_CLEANUP_JOB: &str = "dataCleanupJob";
pub const FILE_EXPORT_JOB: &str = "fileExportJob";

/// Results older than this are removed by `dataCleanupJob`.
pub const RESULT_RETENTION_DAYS: i64 = 30;

pub const CSV_HEADER: &str = "ID,NAME,DESCRIPTION,STATUS,AMOUNT,PROCESSED";

/// Pages through the sample table in id order.
///
/// With `save_state` the id of the last item handed out is stored under
/// `<name>.last.id` so a restarted step continues after it.
pub struct SampleReader {
    name: String,
    store: Arc<SampleStore>,
    query: SampleQuery,
    range: Option<KeyRange>,
    page_size: usize,
    save_state: bool,
    buffer: VecDeque<Sample>,
    fetched_up_to: Option<i64>,
    last_read: Option<i64>,
    exhausted: bool,
}

impl SampleReader {
    pub fn new(name: impl Into<String>, store: Arc<SampleStore>, query: SampleQuery, page_size: usize) -> Self {
        Self {
            name: name.into(),
            store,
            query,
            range: None,
            page_size: page_size.max(1),
            save_state: true,
            buffer: VecDeque::new(),
            fetched_up_to: None,
            last_read: None,
            exhausted: false,
        }
    }

    pub fn with_range(mut self, range: Option<KeyRange>) -> Self {
        self.range = range;
        self
    }

    pub fn stateless(mut self) -> Self {
        self.save_state = false;
        self
    }

    fn position_key(&self) -> String {
        format!("{}.last.id", self.name)
    }

    fn fill(&mut self) -> Result<(), ItemError> {
        let page = self
            .store
            .page(self.query, self.fetched_up_to, self.range, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.fetched_up_to = Some(last.id);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl ItemReader for SampleReader {
    type Item = Sample;

    fn open(&mut self, context: &ExecutionContext) -> Result<(), ItemError> {
        self.buffer.clear();
        self.exhausted = false;
        self.last_read = None;
        if self.save_state {
            self.last_read = context.get_i64(&self.position_key());
        }
        self.fetched_up_to = self.last_read;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Sample>, ItemError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill()?;
        }
        let next = self.buffer.pop_front();
        if let Some(sample) = &next {
            self.last_read = Some(sample.id);
        }
        Ok(next)
    }

    fn update(&mut self, context: &mut ExecutionContext) {
        if let (true, Some(id)) = (self.save_state, self.last_read) {
            context.put_i64(self.position_key(), id);
        }
    }
}

/// Validation outcome for one sample, before it is tied to an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedSample {
    pub sample_id: i64,
    pub status: ResultStatus,
    pub message: String,
    pub processed_at: DateTime<Utc>,
}

/// A sample is valid when it carries a non-negative amount. Invalid samples
/// still produce a FAILED result instead of an error.
pub fn validate_sample(sample: &Sample) -> Result<Option<ProcessedSample>, ItemError> {
    let valid = sample.amount.is_some_and(|amount| amount >= 0.0);
    let (status, message) = if valid {
        (ResultStatus::Success, "processed")
    } else {
        (ResultStatus::Failed, "invalid amount")
    };
    Ok(Some(ProcessedSample {
        sample_id: sample.id,
        status,
        message: message.to_string(),
        processed_at: Utc::now(),
    }))
}

/// Inserts results and flags their samples processed in one store transaction.
pub struct ResultWriter {
    store: Arc<SampleStore>,
    job_execution_id: ExecutionId,
}

impl ItemWriter<ProcessedSample> for ResultWriter {
    fn write(&mut self, items: &[ProcessedSample]) -> Result<(), ItemError> {
        let rows: Vec<NewResult> = items
            .iter()
            .map(|item| NewResult {
                sample_id: item.sample_id,
                job_execution_id: self.job_execution_id,
                status: item.status,
                message: item.message.clone(),
                processed_at: item.processed_at,
            })
            .collect();
        self.store.commit_results(&rows)?;
        Ok(())
    }
}

/// Marks written samples processed.
pub struct MarkProcessedWriter {
    store: Arc<SampleStore>,
}

impl ItemWriter<Sample> for MarkProcessedWriter {
    fn write(&mut self, items: &[Sample]) -> Result<(), ItemError> {
        let ids: Vec<i64> = items.iter().map(|s| s.id).collect();
        self.store.mark_processed(&ids)?;
        Ok(())
    }
}

/// Writes samples as CSV lines. The file is truncated (and its directory
/// created) when the writer is built.
pub struct CsvSampleWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl CsvSampleWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, ItemError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(&path, e))?;
        }
        let file = File::create(&path).map_err(|e| io_error(&path, e))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{CSV_HEADER}").map_err(|e| io_error(&path, e))?;
        out.flush().map_err(|e| io_error(&path, e))?;
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ItemWriter<Sample> for CsvSampleWriter {
    fn write(&mut self, items: &[Sample]) -> Result<(), ItemError> {
        for sample in items {
            writeln!(self.out, "{}", csv_line(sample)).map_err(|e| io_error(&self.path, e))?;
        }
        self.out.flush().map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ItemError {
    ItemError::fatal(format!("{}: {err}", path.display()))
}

pub fn csv_line(sample: &Sample) -> String {
    let amount = sample.amount.map(|a| a.to_string()).unwrap_or_default();
    [
        sample.id.to_string(),
        csv_field(&sample.name),
        csv_field(sample.description.as_deref().unwrap_or("")),
        sample.status.to_string(),
        amount,
        sample.processed.to_string(),
    ]
    .join(",")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// `outputPath` parameter, or `./output/sample_export_<yyyyMMdd>.csv`.
pub fn export_path(scope: &StepScope, today: DateTime<Utc>) -> PathBuf {
    match scope.parameters.get("outputPath") {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(format!("./output/sample_export_{}.csv", today.format("%Y%m%d"))),
    }
}

pub fn sample_job(store: Arc<SampleStore>, config: &BatchConfig) -> BatchResult<JobDefinition> {
    let page_size = config.page_size;
    let reader_store = store.clone();
    let chunk = ChunkStep::new(
        config.chunk_size,
        move |_: &StepScope| {
            Ok(SampleReader::new(
                "sampleReader",
                reader_store.clone(),
                SampleQuery::UnprocessedActive,
                page_size,
            ))
        },
        validate_sample,
        move |scope: &StepScope| {
            Ok(ResultWriter {
                store: store.clone(),
                job_execution_id: scope.job_execution_id,
            })
        },
    )
    .with_policy(FaultPolicy::tolerant(config.skip_limit, config.retry_limit));

    JobDefinition::builder(SAMPLE_JOB)
        .step(StepDefinition::chunk("sampleStep", chunk))
        .build()
}

pub fn partition_job(store: Arc<SampleStore>, config: &BatchConfig) -> BatchResult<JobDefinition> {
    let page_size = config.page_size;
    let reader_store = store.clone();
    let writer_store = store.clone();
    let worker = ChunkStep::new(
        config.chunk_size,
        move |scope: &StepScope| {
            Ok(SampleReader::new(
                "partitionReader",
                reader_store.clone(),
                SampleQuery::Unprocessed,
                page_size,
            )
            .with_range(scope.key_range()))
        },
        PassThrough,
        move |_: &StepScope| {
            Ok(MarkProcessedWriter {
                store: writer_store.clone(),
            })
        },
    )
    .with_policy(FaultPolicy::tolerant(config.skip_limit, config.retry_limit));

    let partitioned = PartitionedStep::new("partitionWorkerStep", worker, move |_: &StepScope| {
        Ok(store.unprocessed_bounds()?)
    })
    .with_grid_size(config.grid_size);

    JobDefinition::builder(PARTITION_JOB)
        .step(StepDefinition::partitioned("partitionMasterStep", partitioned))
        .build()
}

pub fn data_cleanup_job(store: Arc<SampleStore>) -> BatchResult<JobDefinition> {
    let cleanup_store = store.clone();
    let stats_store = store.clone();

    JobDefinition::builder(DATA_CLEANUP_JOB)
        .step(StepDefinition::tasklet(
            "cleanupOldDataStep",
            move |ctx: &mut TaskletContext<'_>| {
                let cutoff = Utc::now() - Duration::days(RESULT_RETENTION_DAYS);
                let deleted = cleanup_store.delete_results_older_than(cutoff)?;
                info!(deleted, %cutoff, "old sample results deleted");
                ctx.execution_context.put_u64("deletedCount", deleted as u64);
                Ok(())
            },
        ))
        .step(StepDefinition::tasklet(
            "updateStatisticsStep",
            move |_: &mut TaskletContext<'_>| {
                for (status, count) in stats_store.status_counts()? {
                    info!(status, count, "sample statistics");
                }
                Ok(())
            },
        ))
        .step(StepDefinition::tasklet(
            "archiveDataStep",
            move |ctx: &mut TaskletContext<'_>| {
                let archived = store.archive_processed()?;
                info!(archived, "processed samples archived");
                ctx.execution_context.put_u64("archivedCount", archived as u64);
                Ok(())
            },
        ))
        .build()
}

pub fn file_export_job(store: Arc<SampleStore>, config: &BatchConfig) -> BatchResult<JobDefinition> {
    let page_size = config.page_size;
    let chunk = ChunkStep::new(
        config.chunk_size,
        move |_: &StepScope| {
            Ok(SampleReader::new("fileExportReader", store.clone(), SampleQuery::Active, page_size).stateless())
        },
        PassThrough,
        |scope: &StepScope| {
            let path = export_path(scope, Utc::now());
            info!(path = %path.display(), "exporting samples");
            CsvSampleWriter::create(path)
        },
    );

    JobDefinition::builder(FILE_EXPORT_JOB)
        .step(StepDefinition::chunk("fileExportStep", chunk))
        .build()
}

/// Register the four sample jobs against one shared store.
pub fn register_all(catalog: &mut JobCatalog, store: Arc<SampleStore>, config: &BatchConfig) -> BatchResult<()> {
    catalog.register(sample_job(store.clone(), config)?)?;
    catalog.register(partition_job(store.clone(), config)?)?;
    catalog.register(data_cleanup_job(store.clone())?)?;
    catalog.register(file_export_job(store, config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_core::{JobParameters, StepExecution};
    use forgebatch_engine::{ChunkRunner, StepKind, StepOutcome, StepRuntime};

    fn seeded(amounts: &[Option<f64>]) -> Arc<SampleStore> {
        let store = Arc::new(SampleStore::new());
        for (i, amount) in amounts.iter().enumerate() {
            store.insert(format!("sample-{i}"), Some(format!("row {i}")), *amount).unwrap();
        }
        store
    }

    fn config(chunk_size: usize) -> BatchConfig {
        BatchConfig {
            chunk_size,
            page_size: 3,
            ..BatchConfig::default()
        }
    }

    fn chunk_runner(job: &JobDefinition) -> Arc<dyn ChunkRunner> {
        match &job.steps()[0].kind {
            StepKind::Chunk(runner) => runner.clone(),
            _ => panic!("expected a chunk step"),
        }
    }

    fn scope(job: &str, params: JobParameters) -> StepScope {
        StepScope::new(ExecutionId::new(7), job, "step", params)
    }

    #[test]
    fn reader_pages_and_resumes_after_last_id() {
        let store = seeded(&[Some(1.0); 7]);
        let mut reader = SampleReader::new("r", store.clone(), SampleQuery::Active, 2);
        reader.open(&ExecutionContext::new()).unwrap();
        for expected in 1..=3 {
            assert_eq!(reader.read().unwrap().unwrap().id, expected);
        }
        let mut ctx = ExecutionContext::new();
        reader.update(&mut ctx);
        assert_eq!(ctx.get_i64("r.last.id"), Some(3));

        let mut resumed = SampleReader::new("r", store, SampleQuery::Active, 2);
        resumed.open(&ctx).unwrap();
        let rest: Vec<i64> = std::iter::from_fn(|| resumed.read().unwrap()).map(|s| s.id).collect();
        assert_eq!(rest, vec![4, 5, 6, 7]);
    }

    #[test]
    fn invalid_amounts_become_failed_results() {
        let store = seeded(&[Some(1.0), Some(-2.0), None]);
        let samples = store.samples().unwrap();
        let statuses: Vec<ResultStatus> = samples
            .iter()
            .map(|s| validate_sample(s).unwrap().unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![ResultStatus::Success, ResultStatus::Failed, ResultStatus::Failed]
        );
    }

    #[test]
    fn sample_step_writes_one_result_per_sample() {
        let store = seeded(&[Some(1.0), Some(2.0), Some(-1.0), Some(4.0), Some(5.0)]);
        let job = sample_job(store.clone(), &config(2)).unwrap();
        let mut step = StepExecution::new(ExecutionId::new(7), "sampleStep");

        let outcome = chunk_runner(&job).run(&scope(SAMPLE_JOB, JobParameters::new()), &mut step, &StepRuntime::detached());

        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!((step.read_count, step.write_count, step.commit_count), (5, 5, 3));
        assert_eq!(step.skip_count(), 0);

        let results = store.results().unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.job_execution_id == ExecutionId::new(7)));
        assert_eq!(results.iter().filter(|r| r.status == ResultStatus::Failed).count(), 1);
        assert!(store.samples().unwrap().iter().all(|s| s.processed));
    }

    #[test]
    fn export_writes_header_and_quoted_fields() {
        let store = Arc::new(SampleStore::new());
        store.insert("plain", None, Some(1.5)).unwrap();
        store.insert("comma, name", Some("say \"hi\"".into()), None).unwrap();

        let dir = std::env::temp_dir().join(format!("forgebatch-export-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("out.csv");
        let params = JobParameters::new().with("outputPath", path.display().to_string());

        let job = file_export_job(store, &config(10)).unwrap();
        let mut step = StepExecution::new(ExecutionId::new(7), "fileExportStep");
        let outcome = chunk_runner(&job).run(&scope(FILE_EXPORT_JOB, params), &mut step, &StepRuntime::detached());
        assert_eq!(outcome, StepOutcome::Completed);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "1,plain,,ACTIVE,1.5,false");
        assert_eq!(lines[2], "2,\"comma, name\",\"say \"\"hi\"\"\",ACTIVE,,false");
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn default_export_path_uses_date() {
        let today = DateTime::parse_from_rfc3339("2024-03-05T10:00:00Z").unwrap().with_timezone(&Utc);
        let path = export_path(&scope(FILE_EXPORT_JOB, JobParameters::new()), today);
        assert_eq!(path, PathBuf::from("./output/sample_export_20240305.csv"));
    }

    #[test]
    fn register_all_adds_four_jobs() {
        let mut catalog = JobCatalog::new();
        register_all(&mut catalog, Arc::new(SampleStore::new()), &BatchConfig::default()).unwrap();
        assert_eq!(
            catalog.names(),
            vec![DATA_CLEANUP_JOB, FILE_EXPORT_JOB, PARTITION_JOB, SAMPLE_JOB]
        );
    }
}
