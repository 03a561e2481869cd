//! The capability set a domain entity needs to be driven by the engine.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::ObjectLock;
use crate::phase::ProcessingPhase;
use crate::status::ProcessingStatus;

/// A persisted entity whose status drives background processing.
///
/// No validation lives here; storage backends and the engine program against
/// these accessors. Entities are mutated through this trait only while the
/// engine holds their lock.
pub trait ProcessableObject: Clone + Debug + Send + Sync + 'static {
    type Id: Copy + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static;
    type Status: ProcessingStatus;

    fn id(&self) -> Self::Id;

    fn status(&self) -> Self::Status;
    fn set_status(&mut self, status: Self::Status);

    /// Number of times the object has been claimed. Never decremented.
    fn processing_attempts(&self) -> u32;
    fn increment_processing_attempts(&mut self);

    /// Earliest time the object may be claimed; `None` means "no schedule".
    fn next_processed(&self) -> Option<DateTime<Utc>>;
    fn set_next_processed(&mut self, at: Option<DateTime<Utc>>);

    /// Suspended objects are never claimed.
    fn processing_suspended(&self) -> bool;
    fn set_processing_suspended(&mut self, suspended: bool);

    fn lock(&self) -> Option<&ObjectLock>;
    fn set_lock(&mut self, lock: Option<ObjectLock>);

    /// Cause of the most recent failed attempt, if the entity records one.
    fn last_error(&self) -> Option<&str> {
        None
    }

    fn set_last_error(&mut self, _error: Option<String>) {}

    fn processing_phase(&self) -> ProcessingPhase {
        self.status().processing_phase()
    }

    fn is_locked(&self) -> bool {
        self.lock().is_some()
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_processed().is_none_or(|at| at <= now)
    }
}

/// Processing bookkeeping an entity can embed and delegate to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState<S> {
    pub status: S,
    pub processing_attempts: u32,
    pub next_processed: Option<DateTime<Utc>>,
    pub processing_suspended: bool,
    pub lock: Option<ObjectLock>,
    pub last_error: Option<String>,
}

impl<S: ProcessingStatus> ProcessingState<S> {
    /// Fresh state for a newly created object, eligible from `next_processed`.
    pub fn new(status: S, next_processed: Option<DateTime<Utc>>) -> Self {
        Self {
            status,
            processing_attempts: 0,
            next_processed,
            processing_suspended: false,
            lock: None,
            last_error: None,
        }
    }

    pub fn suspended(mut self) -> Self {
        self.processing_suspended = true;
        self
    }
}
