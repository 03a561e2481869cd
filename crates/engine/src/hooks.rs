//! Lifecycle hooks invoked by worker threads after an object settles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use objproc_core::ProcessableObject;

use crate::error::ProcessingFailure;

/// Extension points fired after a claim is finalized.
///
/// Hooks run on worker threads, concurrently across objects, after the new
/// state has been persisted. They cannot influence the transition; a panicking
/// hook is contained by the engine.
///
/// `from` is the PENDING status the object was claimed from; `to` is the status
/// that was persisted.
pub trait LifecycleHooks<O: ProcessableObject>: Send + Sync {
    fn after_success(&self, _object: &O, _from: O::Status, _to: O::Status, _duration: Duration) {}

    fn after_retry(
        &self,
        _object: &O,
        _from: O::Status,
        _to: O::Status,
        _cause: &ProcessingFailure,
        _next_processed: DateTime<Utc>,
    ) {
    }

    fn after_permanent_failure(
        &self,
        _object: &O,
        _from: O::Status,
        _to: O::Status,
        _cause: &ProcessingFailure,
    ) {
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl<O: ProcessableObject> LifecycleHooks<O> for NoopHooks {}

impl<O, H> LifecycleHooks<O> for Arc<H>
where
    O: ProcessableObject,
    H: LifecycleHooks<O> + ?Sized,
{
    fn after_success(&self, object: &O, from: O::Status, to: O::Status, duration: Duration) {
        (**self).after_success(object, from, to, duration)
    }

    fn after_retry(
        &self,
        object: &O,
        from: O::Status,
        to: O::Status,
        cause: &ProcessingFailure,
        next_processed: DateTime<Utc>,
    ) {
        (**self).after_retry(object, from, to, cause, next_processed)
    }

    fn after_permanent_failure(
        &self,
        object: &O,
        from: O::Status,
        to: O::Status,
        cause: &ProcessingFailure,
    ) {
        (**self).after_permanent_failure(object, from, to, cause)
    }
}
