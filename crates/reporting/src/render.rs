//! Report rendering collaborator.
//!
//! Rendering is two-phase: `initiate` starts a job on the rendering backend and
//! `collect` fetches the finished document. The processor persists the status
//! in between so a crash after `initiate` resumes at `collect`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use objproc_core::ProcessableObject;

use crate::error::ReportError;
use crate::request::{ReportRequest, ReportRequestId};

/// A finished report document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedReport {
    pub request_id: ReportRequestId,
    pub content_type: String,
    pub body: Vec<u8>,
    pub rendered_at: DateTime<Utc>,
}

pub trait ReportRenderer: Send + Sync {
    fn initiate(&self, request: &ReportRequest) -> Result<(), ReportError>;

    fn collect(&self, request_id: ReportRequestId) -> Result<RenderedReport, ReportError>;
}

/// Renders reports as plain text `key=value` documents.
///
/// Can be told to fail a number of `initiate` calls, or all of them, to
/// exercise retry paths.
#[derive(Debug, Default)]
pub struct InMemoryReportRenderer {
    initiated: Mutex<HashMap<ReportRequestId, RenderedReport>>,
    fail_remaining: AtomicU32,
    initiate_calls: AtomicUsize,
}

impl InMemoryReportRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `initiate`.
    pub fn failing(count: u32) -> Self {
        let renderer = Self::default();
        renderer.fail_remaining.store(count, Ordering::SeqCst);
        renderer
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl ReportRenderer for InMemoryReportRenderer {
    fn initiate(&self, request: &ReportRequest) -> Result<(), ReportError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(ReportError::Rendering(format!(
                "renderer unavailable for report {}",
                request.report_name()
            )));
        }

        let mut body = format!("report={}\n", request.report_name());
        for (key, value) in request.parameters() {
            body.push_str(&format!("{key}={value}\n"));
        }
        let report = RenderedReport {
            request_id: request.id(),
            content_type: "text/plain".to_string(),
            body: body.into_bytes(),
            rendered_at: Utc::now(),
        };
        self.initiated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(report.request_id, report);
        Ok(())
    }

    fn collect(&self, request_id: ReportRequestId) -> Result<RenderedReport, ReportError> {
        self.initiated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request_id)
            .cloned()
            .ok_or_else(|| ReportError::Rendering(format!("no rendering job for {request_id}")))
    }
}
