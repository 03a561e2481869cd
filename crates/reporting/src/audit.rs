//! Delivery audit trail kept through the engine's lifecycle hooks.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use objproc_core::ProcessableObject;
use objproc_engine::{LifecycleHooks, ProcessingFailure};

use crate::request::{ReportRequest, ReportRequestId};
use crate::status::ReportStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Settled {
        duration_ms: u64,
    },
    Retrying {
        cause: String,
        next_processed: DateTime<Utc>,
    },
    Failed {
        cause: String,
    },
}

/// One settled attempt of a report request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub request_id: ReportRequestId,
    pub report_name: String,
    pub from: ReportStatus,
    pub to: ReportStatus,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Records every settled attempt and logs it.
#[derive(Debug, Default)]
pub struct DeliveryAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl DeliveryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn entries_for(&self, request_id: ReportRequestId) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.request_id == request_id)
            .collect()
    }

    fn record(&self, request: &ReportRequest, from: ReportStatus, to: ReportStatus, outcome: AuditOutcome) {
        let entry = AuditEntry {
            request_id: request.id(),
            report_name: request.report_name().to_string(),
            from,
            to,
            attempts: request.processing_attempts(),
            outcome,
            recorded_at: Utc::now(),
        };
        info!(
            request_id = %entry.request_id,
            report = %entry.report_name,
            from_status = %from,
            to_status = %to,
            attempts = entry.attempts,
            "report request settled"
        );
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

impl LifecycleHooks<ReportRequest> for DeliveryAudit {
    fn after_success(
        &self,
        request: &ReportRequest,
        from: ReportStatus,
        to: ReportStatus,
        duration: Duration,
    ) {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.record(request, from, to, AuditOutcome::Settled { duration_ms });
    }

    fn after_retry(
        &self,
        request: &ReportRequest,
        from: ReportStatus,
        to: ReportStatus,
        cause: &ProcessingFailure,
        next_processed: DateTime<Utc>,
    ) {
        self.record(
            request,
            from,
            to,
            AuditOutcome::Retrying {
                cause: cause.to_string(),
                next_processed,
            },
        );
    }

    fn after_permanent_failure(
        &self,
        request: &ReportRequest,
        from: ReportStatus,
        to: ReportStatus,
        cause: &ProcessingFailure,
    ) {
        self.record(
            request,
            from,
            to,
            AuditOutcome::Failed {
                cause: cause.to_string(),
            },
        );
    }
}
