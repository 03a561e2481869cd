//! The background object processor.
//!
//! One engine instance owns a worker pool, a lock owner identity and a
//! validated copy of its processor's status graph. A single driver (the
//! caller of [`BackgroundObjectProcessor::process_objects`], usually the
//! thread started by [`spawn_driver`](BackgroundObjectProcessor::spawn_driver))
//! claims batches from storage and hands each object to the pool. Workers run
//! `process()` under a best-effort timeout and settle the object through the
//! storage's claim-guarded `finalize`. Every persisted step refreshes the
//! claim, so a chain of steps keeps its lock for as long as it makes progress.
//!
//! Per-object failures never leave the engine: they are logged, counted and
//! turned into retry or permanent-failure transitions. Only setup errors are
//! returned from [`start`](BackgroundObjectProcessor::start).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use objproc_core::{LockOwner, ObjectLock, ProcessableObject, ProcessingPhase, ProcessingStatus};

use crate::config::{ConfigError, EngineConfig};
use crate::driver::{CycleReport, DriverHandle};
use crate::error::{EngineError, ProcessingFailure, StorageError};
use crate::hooks::{LifecycleHooks, NoopHooks};
use crate::pool::WorkerPool;
use crate::processor::{NextStatus, ObjectProcessingResult, ObjectProcessor, ProcessorDeclaration};
use crate::stats::{EngineCounters, EngineStats};
use crate::storage::{ClaimRequest, Claimed, Finalization, ObjectStorage};

/// Claim rounds a single `process_objects` call may run before yielding.
const MAX_CLAIM_ROUNDS_PER_CYCLE: usize = 16;

/// Generic worker-pool engine driving objects of type `O` through processor `P`.
pub struct BackgroundObjectProcessor<O, P, S, H = NoopHooks>
where
    O: ProcessableObject,
{
    inner: Arc<Inner<O, P, S, H>>,
}

impl<O, P, S, H> Clone for BackgroundObjectProcessor<O, P, S, H>
where
    O: ProcessableObject,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<O, P, S, H>
where
    O: ProcessableObject,
{
    config: EngineConfig,
    processor: Arc<P>,
    storage: S,
    hooks: H,
    declaration: ProcessorDeclaration<O::Status>,
    owner: LockOwner,
    max_attempts: u32,
    lock_timeout: chrono::Duration,
    processing_timeout: chrono::Duration,
    running: AtomicBool,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    /// Serializes claim cycles so one instance never races itself.
    cycle: Mutex<()>,
    counters: EngineCounters,
}

impl<O, P, S> BackgroundObjectProcessor<O, P, S, NoopHooks>
where
    O: ProcessableObject,
    P: ObjectProcessor<O> + 'static,
    S: ObjectStorage<O> + 'static,
{
    /// Validate `config` and the processor's status graph.
    pub fn new(config: EngineConfig, processor: P, storage: S) -> Result<Self, ConfigError> {
        Self::with_hooks(config, processor, storage, NoopHooks)
    }
}

impl<O, P, S, H> BackgroundObjectProcessor<O, P, S, H>
where
    O: ProcessableObject,
    P: ObjectProcessor<O> + 'static,
    S: ObjectStorage<O> + 'static,
    H: LifecycleHooks<O> + 'static,
{
    pub fn with_hooks(
        config: EngineConfig,
        processor: P,
        storage: S,
        hooks: H,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let declaration = ProcessorDeclaration::from_processor(&processor)?;

        let max_attempts = processor
            .max_processing_attempts()
            .unwrap_or(config.maximum_processing_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_processing_attempts",
                "processor declares zero attempts",
            ));
        }

        let owner = LockOwner::generate(&config.instance_name)
            .map_err(|e| ConfigError::invalid("instance_name", e.to_string()))?;
        let lock_timeout = chrono::Duration::from_std(config.lock_timeout()).unwrap_or_default();
        let processing_timeout =
            chrono::Duration::from_std(config.processing_timeout()).unwrap_or_default();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                processor: Arc::new(processor),
                storage,
                hooks,
                declaration,
                owner,
                max_attempts,
                lock_timeout,
                processing_timeout,
                running: AtomicBool::new(false),
                pool: Mutex::new(None),
                cycle: Mutex::new(()),
                counters: EngineCounters::default(),
            }),
        })
    }

    /// Recover crashed work (if configured), start the worker pool and begin accepting cycles.
    pub fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut pool = inner.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.is_some() {
            debug!(engine = %inner.config.instance_name, "engine already running");
            return Ok(());
        }

        if inner.config.reset_stale_locks_on_start {
            for (from, to) in &inner.declaration.stale_reversions {
                let reset = inner.storage.reset_stale_locks(*from, *to)?;
                if reset > 0 {
                    info!(
                        engine = %inner.config.instance_name,
                        from_status = %from,
                        to_status = %to,
                        count = reset,
                        "reset objects left in processing"
                    );
                }
            }
        }

        let workers = WorkerPool::new(
            inner.config.instance_name.clone(),
            inner.config.processing_thread_count,
            inner.config.maximum_queue_length,
        )?;
        *pool = Some(Arc::new(workers));
        inner.running.store(true, Ordering::SeqCst);

        info!(
            engine = %inner.config.instance_name,
            owner = %inner.owner,
            threads = inner.config.processing_thread_count,
            queue = inner.config.maximum_queue_length,
            max_attempts = inner.max_attempts,
            "engine started"
        );
        Ok(())
    }

    /// Stop claiming and let in-flight work drain up to the shutdown timeout.
    ///
    /// Returns `false` when workers were abandoned at the deadline; their
    /// objects stay locked until the lock timeout or the next startup reset.
    pub fn stop(&self) -> bool {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);

        // Wait for a claim cycle in progress to finish submitting.
        drop(inner.cycle.lock().unwrap_or_else(PoisonError::into_inner));

        let pool = inner
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pool) = pool else {
            return true;
        };

        let drained = pool.shutdown(inner.config.shutdown_timeout());
        info!(
            engine = %inner.config.instance_name,
            drained,
            stats = ?inner.counters.snapshot(),
            "engine stopped"
        );
        drained
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one claim cycle. Returns the number of objects claimed.
    ///
    /// Storage failures are logged and end the cycle; nothing propagates.
    pub fn process_objects(&self) -> usize {
        self.run_cycle().claimed
    }

    pub(crate) fn run_cycle(&self) -> CycleReport {
        let inner = &self.inner;
        let mut report = CycleReport::default();
        if !self.is_running() {
            return report;
        }

        let _cycle = inner.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pool) = inner.current_pool() else {
            return report;
        };

        for _ in 0..MAX_CLAIM_ROUNDS_PER_CYCLE {
            if !self.is_running() {
                break;
            }
            let capacity = pool.remaining_capacity();
            if capacity == 0 {
                debug!(engine = %inner.config.instance_name, "work queue full; skipping claim");
                break;
            }

            let limit = inner.config.batch_size.min(capacity);
            let request = inner.claim_request(limit);
            let claimed = match inner.storage.claim_batch(&request) {
                Ok(claimed) => claimed,
                Err(e) => {
                    EngineCounters::incr(&inner.counters.claim_errors);
                    error!(engine = %inner.config.instance_name, error = %e, "failed to claim objects");
                    report.claim_failed = true;
                    break;
                }
            };

            let count = claimed.len();
            if count == 0 {
                break;
            }
            EngineCounters::add(&inner.counters.claimed, count as u64);
            report.claimed += count;

            let mut saturated = false;
            for claimed in claimed {
                let id = claimed.object.id();
                let previous_status = claimed.previous_status;
                let claim = claimed.object.lock().cloned();
                debug!(
                    engine = %inner.config.instance_name,
                    object_id = %id,
                    from_status = %previous_status,
                    to_status = %claimed.object.status(),
                    attempt = claimed.object.processing_attempts(),
                    "claimed object"
                );

                let worker = self.inner.clone();
                if let Err(e) = pool.try_submit(move || worker.handle_claimed(claimed)) {
                    saturated = true;
                    warn!(
                        engine = %inner.config.instance_name,
                        object_id = %id,
                        error = %e,
                        "worker queue rejected object; releasing claim"
                    );
                    inner.release_unsubmitted(id, claim.as_ref(), previous_status);
                }
            }

            if saturated || count < limit {
                break;
            }
        }
        report
    }

    /// Whether any claimed object is queued for or running on a worker.
    pub fn has_queued_or_active_objects(&self) -> bool {
        self.inner
            .current_pool()
            .is_some_and(|pool| !pool.is_idle())
    }

    /// Block until no object is queued or active, or `timeout` elapses.
    pub fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.has_queued_or_active_objects() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Alternate claim cycles and idle waits until a cycle claims nothing.
    ///
    /// Objects re-scheduled into the future are left for a later call.
    /// Returns the total number of claims made.
    pub fn process_until_idle(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut total = 0;
        loop {
            let claimed = self.process_objects();
            total += claimed;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.await_idle(remaining) || claimed == 0 || remaining.is_zero() {
                return total;
            }
        }
    }

    /// Start a dedicated driver thread polling every `poll_interval_millis`.
    pub fn spawn_driver(&self) -> Result<DriverHandle, EngineError> {
        let cycle_engine = self.clone();
        let stop_engine = self.clone();
        let handle = DriverHandle::spawn(
            format!("{}-driver", self.inner.config.instance_name),
            self.inner.config.poll_interval(),
            move || cycle_engine.run_cycle(),
            move || {
                stop_engine.stop();
            },
        )?;
        Ok(handle)
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    pub fn owner(&self) -> &LockOwner {
        &self.inner.owner
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub fn max_processing_attempts(&self) -> u32 {
        self.inner.max_attempts
    }
}

impl<O, P, S, H> Inner<O, P, S, H>
where
    O: ProcessableObject,
    P: ObjectProcessor<O> + 'static,
    S: ObjectStorage<O> + 'static,
    H: LifecycleHooks<O> + 'static,
{
    fn current_pool(&self) -> Option<Arc<WorkerPool>> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn claim_request(&self, limit: usize) -> ClaimRequest<O::Status> {
        ClaimRequest {
            pending_statuses: self.declaration.pending_statuses.clone(),
            claim_transitions: self.declaration.claim_transitions.clone(),
            stale_reversions: self.declaration.stale_reversions.clone(),
            limit,
            now: Utc::now(),
            owner: self.owner.clone(),
            lock_timeout: self.lock_timeout,
        }
    }

    /// Hand a claimed-but-unsubmitted object back, immediately eligible again.
    fn release_unsubmitted(&self, id: O::Id, claim: Option<&ObjectLock>, previous_status: O::Status) {
        EngineCounters::incr(&self.counters.released_on_backpressure);
        let release = Finalization::release(previous_status, Some(Utc::now()));
        self.finalize_claim(id, claim, &release);
    }

    /// Worker entry point: drive one claimed object until it settles.
    fn handle_claimed(&self, claimed: Claimed<O>) {
        let started = Instant::now();
        let Claimed {
            mut object,
            previous_status,
        } = claimed;
        let mut steps: u32 = 0;

        loop {
            let current = object.status();
            // Queue wait counts against the lock; refresh it when the next call could outlive it.
            if self.lock_expires_within_call(&object) {
                let heartbeat = Finalization::step(current, Utc::now());
                if !self.finalize(&object, &heartbeat) {
                    return;
                }
                heartbeat.apply_to(&mut object);
            }

            let result = match self.invoke(&object) {
                Ok(result) => result,
                Err(failure) => return self.handle_failure(object, previous_status, current, failure),
            };

            let target = match result.next() {
                NextStatus::To(status) => status,
                NextStatus::Advance => {
                    match self.processor.determine_status_on_success(&object, current) {
                        Some(status) => status,
                        None => {
                            let failure = ProcessingFailure::MissingTransition(current.to_string());
                            return self.handle_failure(object, previous_status, current, failure);
                        }
                    }
                }
            };

            match target.processing_phase() {
                ProcessingPhase::Processing => {
                    steps += 1;
                    if steps > self.config.max_chained_steps {
                        let failure = ProcessingFailure::TooManySteps(self.config.max_chained_steps);
                        return self.handle_failure(object, previous_status, current, failure);
                    }
                    let step = Finalization::step(target, Utc::now());
                    if !self.finalize(&object, &step) {
                        return;
                    }
                    step.apply_to(&mut object);
                    debug!(
                        engine = %self.config.instance_name,
                        object_id = %object.id(),
                        from_status = %current,
                        to_status = %target,
                        "processing step"
                    );
                }
                ProcessingPhase::Pending => {
                    let next = schedule_after(Utc::now(), result.delay().unwrap_or_default());
                    let settle = Finalization::release(target, Some(next));
                    return self.settle_success(object, previous_status, current, settle, started);
                }
                ProcessingPhase::Completed => {
                    let settle = Finalization::release(target, None);
                    return self.settle_success(object, previous_status, current, settle, started);
                }
                ProcessingPhase::Failed => {
                    let failure = ProcessingFailure::Rejected(target.to_string());
                    let settle = Finalization::release(target, None).with_error(failure.to_string());
                    return self.settle_permanent_failure(object, previous_status, current, settle, failure);
                }
            }
        }
    }

    fn settle_success(
        &self,
        mut object: O,
        previous_status: O::Status,
        current: O::Status,
        settle: Finalization<O::Status>,
        started: Instant,
    ) {
        if !self.finalize(&object, &settle) {
            return;
        }
        settle.apply_to(&mut object);
        EngineCounters::incr(&self.counters.succeeded);

        let duration = started.elapsed();
        debug!(
            engine = %self.config.instance_name,
            object_id = %object.id(),
            from_status = %current,
            to_status = %settle.status,
            duration_ms = duration.as_millis() as u64,
            "object processed"
        );
        self.hooks
            .after_success(&object, previous_status, settle.status, duration);
    }

    /// Classify a failed attempt by attempt count: retry or give up.
    fn handle_failure(
        &self,
        object: O,
        previous_status: O::Status,
        current: O::Status,
        failure: ProcessingFailure,
    ) {
        if failure.is_timeout() {
            EngineCounters::incr(&self.counters.timeouts);
        }

        let attempts = object.processing_attempts();
        if attempts < self.max_attempts {
            let handling = self
                .processor
                .determine_retry_handling(&object, current, &failure);
            if handling.next_status.processing_phase() == ProcessingPhase::Pending {
                let delay = handling.delay.resolve(self.config.retry_delay());
                let next = schedule_after(Utc::now(), delay);
                let settle = Finalization::release(handling.next_status, Some(next))
                    .with_error(failure.to_string());
                return self.settle_retry(object, previous_status, current, settle, failure);
            }
            error!(
                engine = %self.config.instance_name,
                object_id = %object.id(),
                from_status = %current,
                to_status = %handling.next_status,
                "retry transition does not target a pending status; failing permanently"
            );
        }

        let status = self
            .processor
            .determine_failure_status(&object, current, &failure);
        let mut settle = Finalization::release(status, None).with_error(failure.to_string());
        if status.processing_phase() != ProcessingPhase::Failed {
            // Unsuspended, the object would be claimed and failed again on every cycle.
            error!(
                engine = %self.config.instance_name,
                object_id = %object.id(),
                to_status = %status,
                phase = %status.processing_phase(),
                "failure status is not in the FAILED phase; suspending object"
            );
            settle = settle.suspended();
        }
        self.settle_permanent_failure(object, previous_status, current, settle, failure);
    }

    fn settle_retry(
        &self,
        mut object: O,
        previous_status: O::Status,
        current: O::Status,
        settle: Finalization<O::Status>,
        failure: ProcessingFailure,
    ) {
        if !self.finalize(&object, &settle) {
            return;
        }
        settle.apply_to(&mut object);
        EngineCounters::incr(&self.counters.retried);

        let next = settle.next_processed.unwrap_or_else(Utc::now);
        warn!(
            engine = %self.config.instance_name,
            object_id = %object.id(),
            from_status = %current,
            to_status = %settle.status,
            attempt = object.processing_attempts(),
            max_attempts = self.max_attempts,
            next_processed = %next,
            error = %failure,
            "processing failed; retry scheduled"
        );
        self.hooks
            .after_retry(&object, previous_status, settle.status, &failure, next);
    }

    fn settle_permanent_failure(
        &self,
        mut object: O,
        previous_status: O::Status,
        current: O::Status,
        settle: Finalization<O::Status>,
        failure: ProcessingFailure,
    ) {
        if !self.finalize(&object, &settle) {
            return;
        }
        settle.apply_to(&mut object);
        EngineCounters::incr(&self.counters.failed_permanently);

        error!(
            engine = %self.config.instance_name,
            object_id = %object.id(),
            from_status = %current,
            to_status = %settle.status,
            attempt = object.processing_attempts(),
            error = %failure,
            "processing failed permanently"
        );
        self.hooks
            .after_permanent_failure(&object, previous_status, settle.status, &failure);
    }

    /// Persist under the claim `object` carries; `false` means storage was left as it was.
    fn finalize(&self, object: &O, finalization: &Finalization<O::Status>) -> bool {
        self.finalize_claim(object.id(), object.lock(), finalization)
    }

    fn finalize_claim(
        &self,
        id: O::Id,
        claim: Option<&ObjectLock>,
        finalization: &Finalization<O::Status>,
    ) -> bool {
        let result = match claim {
            Some(claim) => self.storage.finalize(id, claim, finalization),
            None => Err(StorageError::lock_lost(id, "claimed object carries no lock")),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.report_finalize_error(id, &e);
                false
            }
        }
    }

    /// Whether the lock could go stale before a `process()` call started now times out.
    fn lock_expires_within_call(&self, object: &O) -> bool {
        object
            .lock()
            .is_some_and(|lock| lock.is_stale(Utc::now() + self.processing_timeout, self.lock_timeout))
    }

    fn report_finalize_error(&self, id: O::Id, err: &StorageError) {
        EngineCounters::incr(&self.counters.finalize_errors);
        match err {
            StorageError::LockLost { .. } => warn!(
                engine = %self.config.instance_name,
                object_id = %id,
                error = %err,
                "lock lost before finalize; another owner took over"
            ),
            _ => error!(
                engine = %self.config.instance_name,
                object_id = %id,
                error = %err,
                "failed to finalize object; it stays locked until the lock timeout"
            ),
        }
    }

    /// Run `process()` on a helper thread and wait up to the processing timeout.
    ///
    /// The timeout is best effort: a call that overruns keeps running detached
    /// and its late result is discarded.
    fn invoke(&self, object: &O) -> Result<ObjectProcessingResult<O::Status>, ProcessingFailure> {
        let timeout = self.config.processing_timeout();
        let (tx, rx) = mpsc::sync_channel(1);
        let processor = self.processor.clone();
        let snapshot = object.clone();

        let _detached = thread::Builder::new()
            .name(format!("{}-process", self.config.instance_name))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&snapshot)));
                let _ = tx.send(outcome);
            })
            .map_err(|e| ProcessingFailure::Error(anyhow::Error::new(e).context("spawn processing thread")))?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(ProcessingFailure::Error(e)),
            Ok(Err(payload)) => Err(ProcessingFailure::Panicked(panic_message(payload.as_ref()))),
            Err(RecvTimeoutError::Timeout) => Err(ProcessingFailure::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ProcessingFailure::Panicked(
                "processing thread exited without a result".to_string(),
            )),
        }
    }
}

fn schedule_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
