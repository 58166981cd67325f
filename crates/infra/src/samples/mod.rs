//! Bundled demonstration jobs over an in-memory sample table.
//!
//! | Job | Steps |
//! |-----|-------|
//! | `sampleJob` | `sampleStep`: validate unprocessed ACTIVE samples, record results |
//! | `partitionJob` | `partitionMasterStep` over `partitionWorkerStep`: mark unprocessed samples processed |
//! | `dataCleanupJob` | `cleanupOldDataStep`, `updateStatisticsStep`, `archiveDataStep` |
//! | `fileExportJob` | `fileExportStep`: ACTIVE samples to CSV at `outputPath` |

mod jobs;
mod store;

pub use jobs::{
    CSV_HEADER, CsvSampleWriter, DATA_CLEANUP_JOB, FILE_EXPORT_JOB, MarkProcessedWriter, PARTITION_JOB,
    ProcessedSample, RESULT_RETENTION_DAYS, ResultWriter, SAMPLE_JOB, SampleReader, csv_line, data_cleanup_job,
    export_path, file_export_job, partition_job, register_all, sample_job, validate_sample,
};
pub use store::{NewResult, ResultStatus, Sample, SampleQuery, SampleResult, SampleStatus, SampleStore, StoreError};
