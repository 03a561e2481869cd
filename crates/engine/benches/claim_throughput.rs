use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{DateTime, Utc};
use objproc_core::{LockOwner, ObjectId, ObjectLock, ProcessableObject, ProcessingState};
use objproc_engine::{
    BackgroundObjectProcessor, ClaimRequest, EngineConfig, Finalization, InMemoryObjectStorage,
    ObjectProcessingResult, ObjectProcessor, ObjectStorage, ProcessingFailure, TransitionMap,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

objproc_core::processing_status! {
    enum JobStatus {
        Ready = "READY" => Pending,
        Working = "WORKING" => Processing,
        Finished = "FINISHED" => Completed,
        Aborted = "ABORTED" => Failed,
    }
}

#[derive(Debug, Clone)]
struct Job {
    id: ObjectId,
    processing: ProcessingState<JobStatus>,
}

impl Job {
    fn ready() -> Self {
        Self {
            id: ObjectId::new(),
            processing: ProcessingState::new(JobStatus::Ready, None),
        }
    }
}

impl ProcessableObject for Job {
    type Id = ObjectId;
    type Status = JobStatus;

    fn id(&self) -> ObjectId {
        self.id
    }
    fn status(&self) -> JobStatus {
        self.processing.status
    }
    fn set_status(&mut self, status: JobStatus) {
        self.processing.status = status;
    }
    fn processing_attempts(&self) -> u32 {
        self.processing.processing_attempts
    }
    fn increment_processing_attempts(&mut self) {
        self.processing.processing_attempts += 1;
    }
    fn next_processed(&self) -> Option<DateTime<Utc>> {
        self.processing.next_processed
    }
    fn set_next_processed(&mut self, at: Option<DateTime<Utc>>) {
        self.processing.next_processed = at;
    }
    fn processing_suspended(&self) -> bool {
        self.processing.processing_suspended
    }
    fn set_processing_suspended(&mut self, suspended: bool) {
        self.processing.processing_suspended = suspended;
    }
    fn lock(&self) -> Option<&ObjectLock> {
        self.processing.lock.as_ref()
    }
    fn set_lock(&mut self, lock: Option<ObjectLock>) {
        self.processing.lock = lock;
    }
}

struct FinishImmediately;

impl ObjectProcessor<Job> for FinishImmediately {
    fn process(&self, _job: &Job) -> anyhow::Result<ObjectProcessingResult<JobStatus>> {
        Ok(ObjectProcessingResult::transition_to(JobStatus::Finished))
    }

    fn pending_statuses(&self) -> HashSet<JobStatus> {
        HashSet::from([JobStatus::Ready])
    }

    fn claim_transitions(&self) -> TransitionMap<JobStatus> {
        HashMap::from([(JobStatus::Ready, JobStatus::Working)])
    }

    fn determine_failure_status(
        &self,
        _job: &Job,
        _current: JobStatus,
        _cause: &ProcessingFailure,
    ) -> JobStatus {
        JobStatus::Aborted
    }
}

fn seeded_storage(count: usize) -> InMemoryObjectStorage<Job> {
    let storage = InMemoryObjectStorage::new();
    for _ in 0..count {
        storage.insert(Job::ready()).unwrap();
    }
    storage
}

fn claim_request(owner: &LockOwner, limit: usize) -> ClaimRequest<JobStatus> {
    ClaimRequest {
        pending_statuses: HashSet::from([JobStatus::Ready]),
        claim_transitions: HashMap::from([(JobStatus::Ready, JobStatus::Working)]),
        stale_reversions: HashMap::from([(JobStatus::Working, JobStatus::Ready)]),
        limit,
        now: Utc::now(),
        owner: owner.clone(),
        lock_timeout: chrono::Duration::minutes(10),
    }
}

fn bench_claim_and_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_and_finalize");
    let owner = LockOwner::generate("bench").unwrap();
    let backlog = 2_000;

    for batch in [1usize, 20, 100] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_with_setup(
                || seeded_storage(backlog),
                |storage| {
                    let done = Finalization::release(JobStatus::Finished, None);
                    loop {
                        let claimed = storage.claim_batch(&claim_request(&owner, batch)).unwrap();
                        if claimed.is_empty() {
                            break;
                        }
                        for c in claimed {
                            let claim = c.object.lock().cloned().unwrap();
                            storage.finalize(c.object.id(), &claim, &done).unwrap();
                        }
                    }
                    black_box(storage.len())
                },
            )
        });
    }

    group.finish();
}

fn bench_engine_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_drain");
    let backlog = 500;

    for threads in [1usize, 4] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter_with_setup(
                || {
                    let config = EngineConfig::default()
                        .with_instance_name("bench")
                        .with_processing_thread_count(threads)
                        .with_maximum_queue_length(64);
                    let engine = BackgroundObjectProcessor::<Job, _, _>::new(
                        config,
                        FinishImmediately,
                        Arc::new(seeded_storage(backlog)),
                    )
                    .unwrap();
                    engine.start().unwrap();
                    engine
                },
                |engine| {
                    let claimed = engine.process_until_idle(Duration::from_secs(60));
                    engine.stop();
                    black_box(claimed)
                },
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_claim_and_finalize, bench_engine_drain);
criterion_main!(benches);
