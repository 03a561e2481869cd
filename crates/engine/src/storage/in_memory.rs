//! In-memory storage for tests, benches and single-process embedding.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use objproc_core::{ObjectLock, ProcessableObject};

use super::r#trait::{ClaimRequest, Claimed, Finalization, ObjectStorage};
use crate::error::{StorageError, StorageResult};

/// Objects held in a map behind a single lock; claims are atomic because they
/// run under the write guard.
#[derive(Debug)]
pub struct InMemoryObjectStorage<O: ProcessableObject> {
    objects: RwLock<BTreeMap<O::Id, O>>,
}

impl<O: ProcessableObject> InMemoryObjectStorage<O> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of every stored object, ordered by id.
    pub fn all(&self) -> Vec<O> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<O::Id, O>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<O::Id, O>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<O: ProcessableObject> Default for InMemoryObjectStorage<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: ProcessableObject> ObjectStorage<O> for InMemoryObjectStorage<O> {
    fn insert(&self, object: O) -> StorageResult<()> {
        let mut objects = self.write();
        let id = object.id();
        if objects.contains_key(&id) {
            return Err(StorageError::AlreadyExists(id.to_string()));
        }
        objects.insert(id, object);
        Ok(())
    }

    fn find_by_id(&self, id: O::Id) -> StorageResult<Option<O>> {
        Ok(self.read().get(&id).cloned())
    }

    fn exists(&self, id: O::Id) -> StorageResult<bool> {
        Ok(self.read().contains_key(&id))
    }

    fn update_unlocked(&self, id: O::Id, mutate: &mut dyn FnMut(&mut O)) -> StorageResult<O> {
        let mut objects = self.write();
        let object = objects
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if object.is_locked() {
            return Err(StorageError::Locked(id.to_string()));
        }
        mutate(object);
        Ok(object.clone())
    }

    fn claim_batch(&self, request: &ClaimRequest<O::Status>) -> StorageResult<Vec<Claimed<O>>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut objects = self.write();

        let mut candidates: Vec<(Option<chrono::DateTime<chrono::Utc>>, O::Id)> = objects
            .values()
            .filter(|o| request.is_eligible(*o))
            .map(|o| (o.next_processed(), o.id()))
            .collect();
        // `None` sorts first: unscheduled objects go ahead of scheduled ones.
        candidates.sort();
        candidates.truncate(request.limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(object) = objects.get_mut(&id) {
                let previous_status = request.apply(object);
                claimed.push(Claimed {
                    object: object.clone(),
                    previous_status,
                });
            }
        }
        Ok(claimed)
    }

    fn finalize(
        &self,
        id: O::Id,
        claim: &ObjectLock,
        finalization: &Finalization<O::Status>,
    ) -> StorageResult<()> {
        let mut objects = self.write();
        let object = objects
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if object.lock().is_some_and(|lock| lock.is_same_claim(claim)) {
            finalization.apply_to(object);
            return Ok(());
        }
        if finalization.is_reflected_in(object) {
            return Ok(());
        }
        match object.lock() {
            Some(lock) if lock.is_held_by(&claim.owner) => {
                Err(StorageError::lock_lost(id, "superseded by a newer claim"))
            }
            Some(lock) => Err(StorageError::lock_lost(id, format!("held by {}", lock.owner))),
            None => Err(StorageError::lock_lost(id, "object is not locked")),
        }
    }

    fn reset_stale_locks(&self, from: O::Status, to: O::Status) -> StorageResult<u64> {
        let mut objects = self.write();
        let mut reset = 0;
        for object in objects.values_mut().filter(|o| o.status() == from) {
            object.set_status(to);
            object.set_lock(None);
            reset += 1;
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TaskStatus, TestObject};
    use chrono::{Duration, Utc};
    use objproc_core::{LockOwner, ProcessingStatus};
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    fn owner(name: &str) -> LockOwner {
        LockOwner::new(name).unwrap()
    }

    fn lock_of(claimed: &[Claimed<TestObject>]) -> ObjectLock {
        claimed[0].object.lock().cloned().unwrap()
    }

    fn request(owner: LockOwner, limit: usize, now: chrono::DateTime<Utc>) -> ClaimRequest<TaskStatus> {
        ClaimRequest {
            pending_statuses: HashSet::from([TaskStatus::Queued, TaskStatus::AwaitingUpload]),
            claim_transitions: HashMap::from([
                (TaskStatus::Queued, TaskStatus::Running),
                (TaskStatus::AwaitingUpload, TaskStatus::Uploading),
            ]),
            stale_reversions: HashMap::from([
                (TaskStatus::Running, TaskStatus::Queued),
                (TaskStatus::Converting, TaskStatus::Queued),
                (TaskStatus::Uploading, TaskStatus::AwaitingUpload),
            ]),
            limit,
            now,
            owner,
            lock_timeout: Duration::seconds(60),
        }
    }

    #[test]
    fn insert_rejects_duplicates() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::queued();
        storage.insert(object.clone()).unwrap();

        assert!(matches!(storage.insert(object.clone()), Err(StorageError::AlreadyExists(_))));
        assert!(storage.exists(object.id).unwrap());
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn claim_stamps_lock_attempt_and_processing_status() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::new(TaskStatus::Queued, Some(Utc::now() - Duration::seconds(5)));
        storage.insert(object.clone()).unwrap();

        let now = Utc::now();
        let claimed = storage.claim_batch(&request(owner("node-a"), 10, now)).unwrap();

        assert_eq!(claimed.len(), 1);
        let c = &claimed[0];
        assert_eq!(c.previous_status, TaskStatus::Queued);
        assert_eq!(c.object.status(), TaskStatus::Running);
        assert_eq!(c.object.processing_attempts(), 1);
        assert_eq!(c.object.next_processed(), None);
        assert!(c.object.lock().unwrap().is_held_by(&owner("node-a")));
        assert_eq!(storage.find_by_id(object.id).unwrap().unwrap(), c.object);
    }

    #[test]
    fn claim_skips_future_terminal_and_suspended_objects() {
        let storage = InMemoryObjectStorage::new();
        let now = Utc::now();
        storage
            .insert(TestObject::new(TaskStatus::Queued, Some(now + Duration::minutes(5))))
            .unwrap();
        storage.insert(TestObject::new(TaskStatus::Done, None)).unwrap();
        storage.insert(TestObject::new(TaskStatus::Broken, None)).unwrap();
        storage.insert(TestObject::queued().suspended()).unwrap();

        let claimed = storage.claim_batch(&request(owner("node-a"), 10, now)).unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn claim_orders_unscheduled_first_then_by_schedule() {
        let storage = InMemoryObjectStorage::new();
        let now = Utc::now();
        let late = TestObject::new(TaskStatus::Queued, Some(now - Duration::seconds(1)));
        let early = TestObject::new(TaskStatus::Queued, Some(now - Duration::seconds(30)));
        let unscheduled = TestObject::queued();
        for o in [&late, &early, &unscheduled] {
            storage.insert(o.clone()).unwrap();
        }

        let claimed = storage.claim_batch(&request(owner("node-a"), 2, now)).unwrap();
        let ids: Vec<_> = claimed.iter().map(|c| c.object.id).collect();
        assert_eq!(ids, vec![unscheduled.id, early.id]);
    }

    #[test]
    fn stale_processing_lock_is_reverted_and_reclaimed() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::queued();
        storage.insert(object.clone()).unwrap();

        let t0 = Utc::now();
        let first = lock_of(&storage.claim_batch(&request(owner("node-a"), 1, t0)).unwrap());
        storage
            .finalize(object.id, &first, &Finalization::step(TaskStatus::Converting, t0))
            .unwrap();

        let within = storage
            .claim_batch(&request(owner("node-b"), 1, t0 + Duration::seconds(60)))
            .unwrap();
        assert!(within.is_empty());

        let after = storage
            .claim_batch(&request(owner("node-b"), 1, t0 + Duration::seconds(61)))
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].previous_status, TaskStatus::Queued);
        assert_eq!(after[0].object.status(), TaskStatus::Running);
        assert_eq!(after[0].object.processing_attempts(), 2);

        let err = storage
            .finalize(object.id, &first, &Finalization::release(TaskStatus::Done, None))
            .unwrap_err();
        assert!(matches!(err, StorageError::LockLost { .. }));
    }

    #[test]
    fn step_heartbeat_keeps_the_claim_fresh() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::queued();
        storage.insert(object.clone()).unwrap();

        let t0 = Utc::now();
        let claim = lock_of(&storage.claim_batch(&request(owner("node-a"), 1, t0)).unwrap());
        let t1 = t0 + Duration::seconds(45);
        storage
            .finalize(object.id, &claim, &Finalization::step(TaskStatus::Converting, t1))
            .unwrap();

        let stored = storage.find_by_id(object.id).unwrap().unwrap();
        assert_eq!(stored.lock().map(|l| l.locked_at), Some(t1));
        assert_eq!(stored.lock().map(|l| l.claim), Some(claim.claim));

        let later = storage
            .claim_batch(&request(owner("node-b"), 1, t0 + Duration::seconds(90)))
            .unwrap();
        assert!(later.is_empty());
        storage
            .finalize(object.id, &claim, &Finalization::release(TaskStatus::Done, None))
            .unwrap();
    }

    #[test]
    fn superseded_claim_of_the_same_owner_cannot_finalize() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::queued();
        storage.insert(object.clone()).unwrap();

        let t0 = Utc::now();
        let first = lock_of(&storage.claim_batch(&request(owner("node-a"), 1, t0)).unwrap());
        let second = lock_of(
            &storage
                .claim_batch(&request(owner("node-a"), 1, t0 + Duration::seconds(61)))
                .unwrap(),
        );
        assert_ne!(first.claim, second.claim);

        let err = storage
            .finalize(object.id, &first, &Finalization::release(TaskStatus::Done, None))
            .unwrap_err();
        assert!(matches!(err, StorageError::LockLost { .. }));

        storage
            .finalize(object.id, &second, &Finalization::release(TaskStatus::Done, None))
            .unwrap();
        let stored = storage.find_by_id(object.id).unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Done);
        assert_eq!(stored.processing_attempts(), 2);
    }

    #[test]
    fn finalize_is_idempotent_once_released() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::queued();
        storage.insert(object.clone()).unwrap();
        let claim = lock_of(&storage.claim_batch(&request(owner("node-a"), 1, Utc::now())).unwrap());

        let done = Finalization::release(TaskStatus::Done, None);
        storage.finalize(object.id, &claim, &done).unwrap();
        storage.finalize(object.id, &claim, &done).unwrap();

        let stored = storage.find_by_id(object.id).unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Done);
        assert!(stored.lock().is_none());

        let different = Finalization::release(TaskStatus::Broken, None);
        assert!(storage.finalize(object.id, &claim, &different).is_err());
    }

    #[test]
    fn finalize_records_and_clears_last_error() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::queued();
        storage.insert(object.clone()).unwrap();
        let now = Utc::now();
        let claim = lock_of(&storage.claim_batch(&request(owner("node-a"), 1, now)).unwrap());

        let retry = Finalization::release(TaskStatus::Queued, Some(now)).with_error("upstream 503");
        storage.finalize(object.id, &claim, &retry).unwrap();
        let stored = storage.find_by_id(object.id).unwrap().unwrap();
        assert_eq!(stored.last_error(), Some("upstream 503"));

        let claim = lock_of(&storage.claim_batch(&request(owner("node-a"), 1, now)).unwrap());
        storage
            .finalize(object.id, &claim, &Finalization::release(TaskStatus::Done, None))
            .unwrap();
        let stored = storage.find_by_id(object.id).unwrap().unwrap();
        assert_eq!(stored.last_error(), None);
        assert_eq!(stored.processing_attempts(), 2);
    }

    #[test]
    fn update_unlocked_refuses_locked_objects() {
        let storage = InMemoryObjectStorage::new();
        let object = TestObject::queued();
        storage.insert(object.clone()).unwrap();

        let updated = storage
            .update_unlocked(object.id, &mut |o| o.processing.processing_suspended = true)
            .unwrap();
        assert!(updated.processing_suspended());

        storage
            .update_unlocked(object.id, &mut |o| o.processing.processing_suspended = false)
            .unwrap();
        storage.claim_batch(&request(owner("node-a"), 1, Utc::now())).unwrap();
        let err = storage
            .update_unlocked(object.id, &mut |o| o.label = "renamed".to_string())
            .unwrap_err();
        assert!(matches!(err, StorageError::Locked(_)));
    }

    #[test]
    fn reset_stale_locks_reverts_processing_objects() {
        let storage = InMemoryObjectStorage::new();
        let a = TestObject::queued();
        let b = TestObject::queued();
        storage.insert(a.clone()).unwrap();
        storage.insert(b.clone()).unwrap();
        storage.claim_batch(&request(owner("crashed"), 10, Utc::now())).unwrap();

        let reset = storage.reset_stale_locks(TaskStatus::Running, TaskStatus::Queued).unwrap();
        assert_eq!(reset, 2);
        for id in [a.id, b.id] {
            let o = storage.find_by_id(id).unwrap().unwrap();
            assert_eq!(o.status(), TaskStatus::Queued);
            assert!(o.lock().is_none());
            assert_eq!(o.processing_attempts(), 1);
        }
    }

    fn arb_object() -> impl Strategy<Value = TestObject> {
        let status = prop_oneof![
            Just(TaskStatus::Queued),
            Just(TaskStatus::AwaitingUpload),
            Just(TaskStatus::Running),
            Just(TaskStatus::Done),
            Just(TaskStatus::Broken),
        ];
        (status, any::<bool>(), -120i64..120).prop_map(|(status, suspended, offset)| {
            let next = Some(Utc::now() + Duration::seconds(offset));
            let object = TestObject::new(status, next);
            if suspended { object.suspended() } else { object }
        })
    }

    proptest! {
        // Two owners racing over the same objects never share a live claim.
        #[test]
        fn no_object_is_claimed_twice_while_locked(
            objects in prop::collection::vec(arb_object(), 1..40),
            limit in 1usize..10,
        ) {
            let storage = InMemoryObjectStorage::new();
            for o in &objects {
                storage.insert(o.clone()).unwrap();
            }
            let now = Utc::now();
            let mut seen = HashSet::new();
            for round in 0..20 {
                let who = if round % 2 == 0 { "node-a" } else { "node-b" };
                for c in storage.claim_batch(&request(owner(who), limit, now)).unwrap() {
                    prop_assert!(seen.insert(c.object.id));
                    prop_assert_eq!(c.object.processing_attempts(), 1);
                }
            }
        }

        // Suspended and terminal objects are never handed out and keep zero attempts.
        #[test]
        fn suspended_and_terminal_objects_are_never_claimed(
            objects in prop::collection::vec(arb_object(), 1..40),
        ) {
            let storage = InMemoryObjectStorage::new();
            for o in &objects {
                storage.insert(o.clone()).unwrap();
            }
            let now = Utc::now() + Duration::minutes(5);
            let claimed = storage.claim_batch(&request(owner("node-a"), 100, now)).unwrap();
            for c in &claimed {
                let original = objects.iter().find(|o| o.id == c.object.id).unwrap();
                prop_assert!(!original.processing_suspended());
                prop_assert!(!original.status().is_terminal());
            }
            for o in objects.iter().filter(|o| o.processing_suspended()) {
                let stored = storage.find_by_id(o.id).unwrap().unwrap();
                prop_assert_eq!(stored.processing_attempts(), 0);
                prop_assert_eq!(stored.status(), o.status());
            }
        }

        // Each claim adds exactly one attempt, across release and re-claim cycles.
        #[test]
        fn attempts_grow_by_one_per_claim(cycles in 1u32..8) {
            let storage = InMemoryObjectStorage::new();
            let object = TestObject::queued();
            storage.insert(object.clone()).unwrap();
            let now = Utc::now();
            let mut previous = 0;
            for _ in 0..cycles {
                let claimed = storage.claim_batch(&request(owner("node-a"), 1, now)).unwrap();
                prop_assert_eq!(claimed.len(), 1);
                let attempts = claimed[0].object.processing_attempts();
                prop_assert_eq!(attempts, previous + 1);
                previous = attempts;
                storage
                    .finalize(object.id, &lock_of(&claimed), &Finalization::release(TaskStatus::Queued, Some(now)))
                    .unwrap();
            }
        }
    }
}
