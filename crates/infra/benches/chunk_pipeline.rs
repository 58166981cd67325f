use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use forgebatch_core::{ExecutionId, JobParameters, StepExecution};
use forgebatch_engine::{
    BalancedPartitioner, ChunkRunner, ChunkStep, FaultPolicy, ItemError, JobCatalog, KeyRange,
    PartitionStrategy, StepRuntime, StepScope, StridePartitioner, VecReader,
};
use forgebatch_infra::orchestrator::{Orchestrator, RunRequest};
use forgebatch_infra::samples::{self, SampleStore};
use forgebatch_infra::BatchConfig;
use std::sync::Arc;

const ITEMS: i64 = 10_000;

fn pipeline(chunk_size: usize, policy: FaultPolicy) -> ChunkStep<i64, i64> {
    ChunkStep::new(
        chunk_size,
        |_| Ok(VecReader::new("numbers", (1..=ITEMS).collect())),
        |item: &i64| -> Result<Option<i64>, ItemError> {
            if item % 97 == 0 {
                Err(ItemError::validation("divisible by 97"))
            } else {
                Ok(Some(item * 2))
            }
        },
        |_| Ok(|items: &[i64]| -> Result<(), ItemError> {
            black_box(items);
            Ok(())
        }),
    )
    .with_policy(policy)
}

fn bench_chunk_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_pipeline");
    group.throughput(Throughput::Elements(ITEMS as u64));
    let scope = StepScope::new(ExecutionId::new(1), "benchJob", "benchStep", JobParameters::new());
    let runtime = StepRuntime::detached();

    for chunk_size in [10usize, 100, 1000] {
        let step = pipeline(chunk_size, FaultPolicy::tolerant(ITEMS as u64, 0));
        group.bench_with_input(BenchmarkId::new("tolerant", chunk_size), &chunk_size, |b, _| {
            b.iter(|| {
                let mut execution = StepExecution::new(ExecutionId::new(1), "benchStep");
                black_box(step.run(&scope, &mut execution, &runtime));
            });
        });
    }

    group.finish();
}

fn bench_partition_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_planning");
    let domain = Some(KeyRange::new(1, 50_000_000));

    for grid in [4usize, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("balanced", grid), &grid, |b, &grid| {
            b.iter(|| black_box(BalancedPartitioner.plan(black_box(domain), grid)));
        });
        group.bench_with_input(BenchmarkId::new("stride", grid), &grid, |b, &grid| {
            b.iter(|| black_box(StridePartitioner.plan(black_box(domain), grid)));
        });
    }

    group.finish();
}

fn bench_sample_job(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_job");
    group.sample_size(20);

    group.bench_function("launch_to_completion_1000_samples", |b| {
        b.iter(|| {
            let store = Arc::new(SampleStore::new());
            for i in 0..1000 {
                store.insert(format!("sample-{i}"), None, Some(i as f64)).unwrap();
            }
            let config = BatchConfig {
                chunk_size: 100,
                page_size: 100,
                ..BatchConfig::default()
            };
            let mut catalog = JobCatalog::new();
            samples::register_all(&mut catalog, store, &config).unwrap();
            let orchestrator = Orchestrator::builder(catalog).with_config(config).build().unwrap();
            black_box(
                orchestrator
                    .run(RunRequest::new(samples::SAMPLE_JOB))
                    .unwrap()
                    .wait()
                    .unwrap(),
            );
        });
    });

    group.finish();
}

criterion_group!(benches, bench_chunk_sizes, bench_partition_planning, bench_sample_job);
criterion_main!(benches);
