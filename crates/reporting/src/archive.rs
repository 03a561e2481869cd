//! Storage for rendered documents between generation and delivery.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::ReportError;
use crate::render::RenderedReport;
use crate::request::ReportRequestId;

pub trait ReportArchive: Send + Sync {
    /// Store (or replace) the document for its request.
    fn store(&self, report: RenderedReport) -> Result<(), ReportError>;

    fn load(&self, request_id: ReportRequestId) -> Result<Option<RenderedReport>, ReportError>;
}

impl<A: ReportArchive + ?Sized> ReportArchive for Arc<A> {
    fn store(&self, report: RenderedReport) -> Result<(), ReportError> {
        (**self).store(report)
    }

    fn load(&self, request_id: ReportRequestId) -> Result<Option<RenderedReport>, ReportError> {
        (**self).load(request_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReportArchive {
    documents: RwLock<HashMap<ReportRequestId, RenderedReport>>,
}

impl InMemoryReportArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportArchive for InMemoryReportArchive {
    fn store(&self, report: RenderedReport) -> Result<(), ReportError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| ReportError::Rendering("archive lock poisoned".to_string()))?;
        documents.insert(report.request_id, report);
        Ok(())
    }

    fn load(&self, request_id: ReportRequestId) -> Result<Option<RenderedReport>, ReportError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| ReportError::Rendering("archive lock poisoned".to_string()))?;
        Ok(documents.get(&request_id).cloned())
    }
}
