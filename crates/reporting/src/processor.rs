//! The report delivery pipeline as an [`ObjectProcessor`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, warn};

use objproc_core::ProcessableObject;
use objproc_engine::{
    EngineConfig, ObjectProcessingResult, ObjectProcessor, ProcessingFailure, ProcessorRegistry,
    RetryHandling, TransitionMap,
};

use crate::archive::ReportArchive;
use crate::delivery::ReportSender;
use crate::error::ReportError;
use crate::render::ReportRenderer;
use crate::request::ReportRequest;
use crate::status::ReportStatus;

/// Registry key of the delivery processor.
pub const PROCESSOR_KEY: &str = "reports.delivery";

/// Renders a requested report, archives it and delivers it.
///
/// A failed generation starts over from `REQUESTED`. A failed delivery resumes
/// from `DELIVERY_PENDING` using the archived document, so a report is never
/// rendered twice for the same request once it has been archived.
pub struct ReportDeliveryProcessor<R, A, D> {
    renderer: Arc<R>,
    archive: Arc<A>,
    sender: Arc<D>,
    delivery_retry_delay: Option<Duration>,
    max_attempts: Option<u32>,
}

impl<R, A, D> ReportDeliveryProcessor<R, A, D>
where
    R: ReportRenderer,
    A: ReportArchive,
    D: ReportSender,
{
    pub fn new(renderer: Arc<R>, archive: Arc<A>, sender: Arc<D>) -> Self {
        Self {
            renderer,
            archive,
            sender,
            delivery_retry_delay: None,
            max_attempts: None,
        }
    }

    /// Wait `delay` before retrying a failed delivery instead of the engine default.
    pub fn with_delivery_retry_delay(mut self, delay: Duration) -> Self {
        self.delivery_retry_delay = Some(delay);
        self
    }

    /// Override the engine's attempt ceiling for report requests.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    fn deliver(
        &self,
        request: &ReportRequest,
    ) -> anyhow::Result<ObjectProcessingResult<ReportStatus>> {
        let report = self
            .archive
            .load(request.id())?
            .ok_or_else(|| ReportError::DocumentMissing(request.id().to_string()))?;

        match self.sender.send(request.recipient(), &report) {
            Ok(()) => Ok(ObjectProcessingResult::transition_to(ReportStatus::Delivered)),
            Err(e) if e.is_permanent() => {
                warn!(
                    request_id = %request.id(),
                    recipient = %request.recipient(),
                    error = %e,
                    "report delivery rejected"
                );
                Ok(ObjectProcessingResult::transition_to(ReportStatus::DeliveryFailed))
            }
            Err(e) => Err(e).context("delivering report"),
        }
    }
}

impl<R, A, D> ObjectProcessor<ReportRequest> for ReportDeliveryProcessor<R, A, D>
where
    R: ReportRenderer,
    A: ReportArchive,
    D: ReportSender,
{
    fn process(&self, request: &ReportRequest) -> anyhow::Result<ObjectProcessingResult<ReportStatus>> {
        debug!(request_id = %request.id(), status = %request.status(), "report step");
        match request.status() {
            ReportStatus::Generating => {
                self.renderer
                    .initiate(request)
                    .with_context(|| format!("initiating report {}", request.report_name()))?;
                Ok(ObjectProcessingResult::advance())
            }
            ReportStatus::GenerationInitiated => {
                let report = self
                    .renderer
                    .collect(request.id())
                    .context("collecting rendered report")?;
                self.archive.store(report)?;
                Ok(ObjectProcessingResult::advance())
            }
            ReportStatus::Generated => Ok(ObjectProcessingResult::advance()),
            ReportStatus::Delivering => self.deliver(request),
            other => anyhow::bail!("report request is not processable in status {other}"),
        }
    }

    fn pending_statuses(&self) -> HashSet<ReportStatus> {
        HashSet::from([ReportStatus::Requested, ReportStatus::DeliveryPending])
    }

    fn claim_transitions(&self) -> TransitionMap<ReportStatus> {
        HashMap::from([
            (ReportStatus::Requested, ReportStatus::Generating),
            (ReportStatus::DeliveryPending, ReportStatus::Delivering),
        ])
    }

    fn success_transitions(&self) -> TransitionMap<ReportStatus> {
        HashMap::from([
            (ReportStatus::Generating, ReportStatus::GenerationInitiated),
            (ReportStatus::GenerationInitiated, ReportStatus::Generated),
            (ReportStatus::Generated, ReportStatus::Delivering),
        ])
    }

    fn retry_transitions(&self) -> TransitionMap<ReportStatus> {
        HashMap::from([
            (ReportStatus::Generating, ReportStatus::Requested),
            (ReportStatus::GenerationInitiated, ReportStatus::Requested),
            (ReportStatus::Generated, ReportStatus::DeliveryPending),
            (ReportStatus::Delivering, ReportStatus::DeliveryPending),
        ])
    }

    fn determine_retry_handling(
        &self,
        _request: &ReportRequest,
        current: ReportStatus,
        _cause: &ProcessingFailure,
    ) -> RetryHandling<ReportStatus> {
        let next_status = self
            .retry_transitions()
            .get(&current)
            .copied()
            .unwrap_or(ReportStatus::Requested);
        match (next_status, self.delivery_retry_delay) {
            (ReportStatus::DeliveryPending, Some(delay)) => RetryHandling::after(next_status, delay),
            _ => RetryHandling::engine_default(next_status),
        }
    }

    fn determine_failure_status(
        &self,
        _request: &ReportRequest,
        current: ReportStatus,
        _cause: &ProcessingFailure,
    ) -> ReportStatus {
        if current.is_generation_step() {
            ReportStatus::GenerationFailed
        } else {
            ReportStatus::DeliveryFailed
        }
    }

    fn max_processing_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Register the delivery processor under [`PROCESSOR_KEY`].
pub fn register<R, A, D>(
    registry: &mut ProcessorRegistry<ReportRequest>,
    renderer: Arc<R>,
    archive: Arc<A>,
    sender: Arc<D>,
) where
    R: ReportRenderer + 'static,
    A: ReportArchive + 'static,
    D: ReportSender + 'static,
{
    registry.register(PROCESSOR_KEY, move |config: &EngineConfig| {
        let processor = ReportDeliveryProcessor::new(renderer.clone(), archive.clone(), sender.clone())
            .with_delivery_retry_delay(config.retry_delay());
        Arc::new(processor) as Arc<dyn ObjectProcessor<ReportRequest>>
    });
}
