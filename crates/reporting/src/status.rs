use serde::{Deserialize, Serialize};

objproc_core::processing_status! {
    /// Lifecycle of a report request.
    ///
    /// `REQUESTED` is claimed into `GENERATING` and walks the generation and
    /// delivery steps within one claim. A failed delivery resumes from
    /// `DELIVERY_PENDING` so the document is not rendered twice.
    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum ReportStatus {
        Requested = "REQUESTED" => Pending,
        Generating = "GENERATING" => Processing,
        GenerationInitiated = "GENERATION_INITIATED" => Processing,
        Generated = "GENERATED" => Processing,
        DeliveryPending = "DELIVERY_PENDING" => Pending,
        Delivering = "DELIVERING" => Processing,
        Delivered = "DELIVERED" => Completed,
        GenerationFailed = "GENERATION_FAILED" => Failed,
        DeliveryFailed = "DELIVERY_FAILED" => Failed,
    }
}

impl ReportStatus {
    /// Whether the status belongs to the generation half of the pipeline.
    pub fn is_generation_step(&self) -> bool {
        matches!(
            self,
            ReportStatus::Requested
                | ReportStatus::Generating
                | ReportStatus::GenerationInitiated
                | ReportStatus::Generated
        )
    }
}
