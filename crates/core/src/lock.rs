//! Lock token stamped on an object while an engine instance owns it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Identity of the engine instance holding a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockOwner(String);

impl LockOwner {
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::InvalidLockOwner("lock owner must not be empty".to_string()));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidLockOwner(format!(
                "lock owner must not contain whitespace: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Unique owner for one engine lifetime: `{instance_name}-{uuid}`.
    pub fn generate(instance_name: &str) -> CoreResult<Self> {
        Self::new(format!("{}-{}", instance_name, Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A held claim on an object.
///
/// `claim` is unique per claim, so an owner that re-claims an object after its
/// own lock went stale holds a different lock than the superseded worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLock {
    pub owner: LockOwner,
    pub claim: Uuid,
    pub locked_at: DateTime<Utc>,
}

impl ObjectLock {
    /// A fresh claim for `owner`.
    pub fn new(owner: LockOwner, locked_at: DateTime<Utc>) -> Self {
        Self {
            owner,
            claim: Uuid::now_v7(),
            locked_at,
        }
    }

    pub fn is_held_by(&self, owner: &LockOwner) -> bool {
        &self.owner == owner
    }

    /// Whether `other` is this very claim (same owner and claim token).
    pub fn is_same_claim(&self, other: &ObjectLock) -> bool {
        self.owner == other.owner && self.claim == other.claim
    }

    /// The same claim with its heartbeat moved to `at`.
    pub fn refreshed(&self, at: DateTime<Utc>) -> Self {
        Self {
            locked_at: at,
            ..self.clone()
        }
    }

    /// A lock older than `timeout` is considered abandoned.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.locked_at > timeout
    }
}
