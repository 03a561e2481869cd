//! `objproc-reporting`: report generation and delivery driven by the background engine.
//!
//! A [`ReportRequest`] enters as `REQUESTED`, is rendered, archived and sent to
//! its recipient. The engine owns claiming, retries and failure handling; this
//! crate supplies the status graph, the processor and in-memory collaborators.

pub mod archive;
pub mod audit;
pub mod delivery;
pub mod error;
pub mod processor;
pub mod render;
pub mod request;
pub mod status;

pub use archive::{InMemoryReportArchive, ReportArchive};
pub use audit::{AuditEntry, AuditOutcome, DeliveryAudit};
pub use delivery::{InMemoryReportSender, ReportSender, SentReport};
pub use error::ReportError;
pub use processor::{PROCESSOR_KEY, ReportDeliveryProcessor, register};
pub use render::{InMemoryReportRenderer, RenderedReport, ReportRenderer};
pub use request::{Recipient, ReportRequest, ReportRequestId};
pub use status::ReportStatus;
