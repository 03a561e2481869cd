use thiserror::Error;

/// Errors of the reporting pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("invalid recipient address: {0:?}")]
    InvalidRecipient(String),

    #[error("report name must not be empty")]
    EmptyReportName,

    #[error("report rendering failed: {0}")]
    Rendering(String),

    #[error("rendered document not found for request {0}")]
    DocumentMissing(String),

    /// The receiving side is temporarily unavailable; retrying may succeed.
    #[error("delivery unavailable: {0}")]
    DeliveryUnavailable(String),

    /// The receiving side refused the report; retrying will not help.
    #[error("delivery rejected: {0}")]
    DeliveryRejected(String),
}

impl ReportError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ReportError::DeliveryRejected(_) | ReportError::InvalidRecipient(_)
        )
    }
}
