//! Delivery collaborator: hands a rendered report to its recipient.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::ReportError;
use crate::render::RenderedReport;
use crate::request::Recipient;

/// Sends rendered reports.
///
/// Implementations return [`ReportError::DeliveryUnavailable`] for transient
/// problems and [`ReportError::DeliveryRejected`] when the recipient refuses
/// the report for good.
pub trait ReportSender: Send + Sync {
    fn send(&self, recipient: &Recipient, report: &RenderedReport) -> Result<(), ReportError>;
}

/// A sent report as recorded by [`InMemoryReportSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReport {
    pub recipient: Recipient,
    pub report: RenderedReport,
}

/// Records deliveries in an outbox.
#[derive(Debug, Default)]
pub struct InMemoryReportSender {
    outbox: Mutex<Vec<SentReport>>,
    rejected: Mutex<HashSet<Recipient>>,
    unavailable_remaining: AtomicU32,
}

impl InMemoryReportSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the next `count` sends as unavailable.
    pub fn unavailable_for(count: u32) -> Self {
        let sender = Self::default();
        sender.unavailable_remaining.store(count, Ordering::SeqCst);
        sender
    }

    /// Refuse every report addressed to `recipient`.
    pub fn reject(self, recipient: Recipient) -> Self {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recipient);
        self
    }

    pub fn outbox(&self) -> Vec<SentReport> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ReportSender for InMemoryReportSender {
    fn send(&self, recipient: &Recipient, report: &RenderedReport) -> Result<(), ReportError> {
        if self
            .rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(recipient)
        {
            return Err(ReportError::DeliveryRejected(format!(
                "{recipient} does not accept reports"
            )));
        }

        let unavailable = self
            .unavailable_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if unavailable {
            return Err(ReportError::DeliveryUnavailable(format!(
                "mail relay unreachable for {recipient}"
            )));
        }

        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentReport {
                recipient: recipient.clone(),
                report: report.clone(),
            });
        Ok(())
    }
}
