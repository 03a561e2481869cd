use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use objproc_core::{ObjectId, ObjectLock, ProcessableObject, ProcessingState};

use crate::error::ReportError;
use crate::status::ReportStatus;

/// Report request identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportRequestId(pub ObjectId);

impl ReportRequestId {
    pub fn new() -> Self {
        Self(ObjectId::new())
    }
}

impl Default for ReportRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ReportRequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for ReportRequestId {
    fn from(value: Uuid) -> Self {
        Self(ObjectId::from_uuid(value))
    }
}

impl From<ReportRequestId> for Uuid {
    fn from(value: ReportRequestId) -> Self {
        value.0.into()
    }
}

/// Where a rendered report goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipient(String);

impl Recipient {
    /// Accepts `local@domain` addresses.
    pub fn new(address: impl Into<String>) -> Result<Self, ReportError> {
        let address = address.into();
        let trimmed = address.trim();
        let valid = trimmed
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
            && !trimmed.chars().any(char::is_whitespace);
        if !valid {
            return Err(ReportError::InvalidRecipient(address));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Recipient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to render a named report and deliver it to a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    id: ReportRequestId,
    report_name: String,
    parameters: BTreeMap<String, String>,
    recipient: Recipient,
    requested_at: DateTime<Utc>,
    processing: ProcessingState<ReportStatus>,
}

impl ReportRequest {
    /// New request in `REQUESTED`, eligible immediately.
    pub fn new(
        report_name: impl Into<String>,
        recipient: Recipient,
        parameters: BTreeMap<String, String>,
    ) -> Result<Self, ReportError> {
        let report_name = report_name.into();
        if report_name.trim().is_empty() {
            return Err(ReportError::EmptyReportName);
        }
        let now = Utc::now();
        Ok(Self {
            id: ReportRequestId::new(),
            report_name,
            parameters,
            recipient,
            requested_at: now,
            processing: ProcessingState::new(ReportStatus::Requested, Some(now)),
        })
    }

    /// Defer the first processing attempt.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.processing.next_processed = Some(at);
        self
    }

    /// Create the request on hold; nothing processes it until resumed.
    pub fn on_hold(mut self) -> Self {
        self.processing = self.processing.suspended();
        self
    }

    pub fn set_on_hold(&mut self, on_hold: bool) {
        self.set_processing_suspended(on_hold);
    }

    pub fn report_name(&self) -> &str {
        &self.report_name
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }
}

impl ProcessableObject for ReportRequest {
    type Id = ReportRequestId;
    type Status = ReportStatus;

    fn id(&self) -> ReportRequestId {
        self.id
    }

    fn status(&self) -> ReportStatus {
        self.processing.status
    }

    fn set_status(&mut self, status: ReportStatus) {
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
