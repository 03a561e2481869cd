use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use objproc_core::{LockOwner, ObjectLock, ProcessableObject, ProcessingStatus};

use crate::error::StorageResult;

/// Parameters of one atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest<S> {
    /// Statuses eligible for a fresh claim.
    pub pending_statuses: HashSet<S>,
    /// Status stamped at claim time, keyed by the pending status.
    pub claim_transitions: HashMap<S, S>,
    /// PROCESSING -> PENDING edges applied to objects whose lock went stale.
    pub stale_reversions: HashMap<S, S>,
    pub limit: usize,
    pub now: DateTime<Utc>,
    pub owner: LockOwner,
    /// Age after which an existing lock no longer protects the object.
    pub lock_timeout: Duration,
}

impl<S: ProcessingStatus> ClaimRequest<S> {
    /// Whether `object` may be claimed under this request.
    ///
    /// Suspended objects never are. An unlocked object must be in a pending
    /// status and due; an object whose lock went stale is reclaimable right
    /// away when its status is pending or has a stale reversion.
    pub fn is_eligible<O>(&self, object: &O) -> bool
    where
        O: ProcessableObject<Status = S>,
    {
        if object.processing_suspended() {
            return false;
        }
        let status = object.status();
        match object.lock() {
            None => self.pending_statuses.contains(&status) && object.is_due(self.now),
            Some(lock) => {
                lock.is_stale(self.now, self.lock_timeout)
                    && (self.pending_statuses.contains(&status)
                        || self.stale_reversions.contains_key(&status))
            }
        }
    }

    /// Apply the claim to an eligible object; returns the PENDING status it was claimed from.
    pub fn apply<O>(&self, object: &mut O) -> S
    where
        O: ProcessableObject<Status = S>,
    {
        let mut status = object.status();
        if let Some(reverted) = self.stale_reversions.get(&status) {
            status = *reverted;
        }
        let claimed_as = self.claim_transitions.get(&status).copied().unwrap_or(status);

        object.set_status(claimed_as);
        object.increment_processing_attempts();
        object.set_lock(Some(ObjectLock::new(self.owner.clone(), self.now)));
        object.set_next_processed(None);
        status
    }
}

/// A claimed object together with the status it was claimed from.
#[derive(Debug, Clone)]
pub struct Claimed<O: ProcessableObject> {
    pub object: O,
    pub previous_status: O::Status,
}

/// State written by [`ObjectStorage::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalization<S> {
    pub status: S,
    pub next_processed: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// `false` persists an intermediate step and keeps the claim.
    pub release_lock: bool,
    /// New `locked_at` for a kept claim.
    pub heartbeat: Option<DateTime<Utc>>,
    /// Take the object out of processing until someone resumes it.
    pub suspend: bool,
}

impl<S: ProcessingStatus> Finalization<S> {
    /// Settle the object and release the lock.
    pub fn release(status: S, next_processed: Option<DateTime<Utc>>) -> Self {
        Self {
            status,
            next_processed,
            last_error: None,
            release_lock: true,
            heartbeat: None,
            suspend: false,
        }
    }

    /// Persist a step while keeping the lock, refreshed to `at`.
    pub fn step(status: S, at: DateTime<Utc>) -> Self {
        Self {
            status,
            next_processed: None,
            last_error: None,
            release_lock: false,
            heartbeat: Some(at),
            suspend: false,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspend = true;
        self
    }

    pub fn apply_to<O>(&self, object: &mut O)
    where
        O: ProcessableObject<Status = S>,
    {
        object.set_status(self.status);
        object.set_next_processed(self.next_processed);
        object.set_last_error(self.last_error.clone());
        if self.suspend {
            object.set_processing_suspended(true);
        }
        if self.release_lock {
            object.set_lock(None);
        } else if let Some(at) = self.heartbeat {
            let refreshed = object.lock().map(|lock| lock.refreshed(at));
            if refreshed.is_some() {
                object.set_lock(refreshed);
            }
        }
    }

    /// Whether a released finalization with these values already landed on `object`.
    pub fn is_reflected_in<O>(&self, object: &O) -> bool
    where
        O: ProcessableObject<Status = S>,
    {
        self.release_lock
            && object.lock().is_none()
            && object.status() == self.status
            && object.next_processed() == self.next_processed
            && (!self.suspend || object.processing_suspended())
    }
}

/// Persistence collaborator of the engine.
///
/// Implementations must make `claim_batch` atomic per object: no two callers,
/// threads or processes, may claim the same object while its lock is live.
pub trait ObjectStorage<O: ProcessableObject>: Send + Sync {
    fn insert(&self, object: O) -> StorageResult<()>;

    fn find_by_id(&self, id: O::Id) -> StorageResult<Option<O>>;

    fn exists(&self, id: O::Id) -> StorageResult<bool> {
        Ok(self.find_by_id(id)?.is_some())
    }

    /// Read-modify-write by an external caller. Fails with `Locked` while an engine holds the object.
    fn update_unlocked(&self, id: O::Id, mutate: &mut dyn FnMut(&mut O)) -> StorageResult<O>;

    /// Select up to `request.limit` eligible objects, ordered by `next_processed`
    /// (unscheduled first) then id, and lock them for `request.owner`.
    fn claim_batch(&self, request: &ClaimRequest<O::Status>) -> StorageResult<Vec<Claimed<O>>>;

    /// Write the post-processing state if `claim` is still the object's lock.
    ///
    /// A claim superseded by a later one (even by the same owner) gets
    /// `LockLost`. Repeating a released finalization that already landed is a no-op.
    fn finalize(
        &self,
        id: O::Id,
        claim: &ObjectLock,
        finalization: &Finalization<O::Status>,
    ) -> StorageResult<()>;

    /// Move every object in `from` to `to`, clearing locks. Returns the number of objects reset.
    fn reset_stale_locks(&self, from: O::Status, to: O::Status) -> StorageResult<u64>;
}

impl<O, S> ObjectStorage<O> for Arc<S>
where
    O: ProcessableObject,
    S: ObjectStorage<O> + ?Sized,
{
    fn insert(&self, object: O) -> StorageResult<()> {
        (**self).insert(object)
    }

    fn find_by_id(&self, id: O::Id) -> StorageResult<Option<O>> {
        (**self).find_by_id(id)
    }

    fn exists(&self, id: O::Id) -> StorageResult<bool> {
        (**self).exists(id)
    }

    fn update_unlocked(&self, id: O::Id, mutate: &mut dyn FnMut(&mut O)) -> StorageResult<O> {
        (**self).update_unlocked(id, mutate)
    }

    fn claim_batch(&self, request: &ClaimRequest<O::Status>) -> StorageResult<Vec<Claimed<O>>> {
        (**self).claim_batch(request)
    }

    fn finalize(
        &self,
        id: O::Id,
        claim: &ObjectLock,
        finalization: &Finalization<O::Status>,
    ) -> StorageResult<()> {
        (**self).finalize(id, claim, finalization)
    }

    fn reset_stale_locks(&self, from: O::Status, to: O::Status) -> StorageResult<u64> {
        (**self).reset_stale_locks(from, to)
    }
}
