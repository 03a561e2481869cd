//! Fixtures shared by the engine's unit tests.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use objproc_core::{ObjectId, ObjectLock, ProcessableObject, ProcessingState};

use crate::error::{StorageError, StorageResult};
use crate::storage::{ClaimRequest, Claimed, Finalization, ObjectStorage};

objproc_core::processing_status! {
    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum TaskStatus {
        Queued = "QUEUED" => Pending,
        Running = "RUNNING" => Processing,
        Converting = "CONVERTING" => Processing,
        AwaitingUpload = "AWAITING_UPLOAD" => Pending,
        Uploading = "UPLOADING" => Processing,
        Done = "DONE" => Completed,
        Broken = "BROKEN" => Failed,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestObject {
    pub id: ObjectId,
    pub label: String,
    pub processing: ProcessingState<TaskStatus>,
}

impl TestObject {
    pub fn new(status: TaskStatus, next_processed: Option<DateTime<Utc>>) -> Self {
        Self {
            id: ObjectId::new(),
            label: "fixture".to_string(),
            processing: ProcessingState::new(status, next_processed),
        }
    }

    pub fn queued() -> Self {
        Self::new(TaskStatus::Queued, None)
    }

    pub fn suspended(mut self) -> Self {
        self.processing.processing_suspended = true;
        self
    }
}

impl ProcessableObject for TestObject {
    type Id = ObjectId;
    type Status = TaskStatus;

    fn id(&self) -> ObjectId {
        self.id
    }

    fn status(&self) -> TaskStatus {
        self.processing.status
    }

    fn set_status(&mut self, status: TaskStatus) {
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

    fn last_error(&self) -> Option<&str> {
        self.processing.last_error.as_deref()
    }

    fn set_last_error(&mut self, error: Option<String>) {
        self.processing.last_error = error;
    }
}

/// Wraps a storage and fails claims or finalizes on demand.
pub struct FaultyStorage<S> {
    inner: S,
    fail_claims: AtomicBool,
    fail_finalize: AtomicBool,
}

impl<S> FaultyStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_claims: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
        }
    }

    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub fn fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }
}

impl<S: ObjectStorage<TestObject>> ObjectStorage<TestObject> for FaultyStorage<S> {
    fn insert(&self, object: TestObject) -> StorageResult<()> {
        self.inner.insert(object)
    }

    fn find_by_id(&self, id: ObjectId) -> StorageResult<Option<TestObject>> {
        self.inner.find_by_id(id)
    }

    fn update_unlocked(
        &self,
        id: ObjectId,
        mutate: &mut dyn FnMut(&mut TestObject),
    ) -> StorageResult<TestObject> {
        self.inner.update_unlocked(id, mutate)
    }

    fn claim_batch(&self, request: &ClaimRequest<TaskStatus>) -> StorageResult<Vec<Claimed<TestObject>>> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected claim failure".to_string()));
        }
        self.inner.claim_batch(request)
    }

    fn finalize(
        &self,
        id: ObjectId,
        claim: &ObjectLock,
        finalization: &Finalization<TaskStatus>,
    ) -> StorageResult<()> {
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected finalize failure".to_string()));
        }
        self.inner.finalize(id, claim, finalization)
    }

    fn reset_stale_locks(&self, from: TaskStatus, to: TaskStatus) -> StorageResult<u64> {
        self.inner.reset_stale_locks(from, to)
    }
}
