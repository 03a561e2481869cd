use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use objproc_core::{ProcessableObject, ProcessingPhase};
use objproc_engine::{
    BackgroundObjectProcessor, EngineConfig, InMemoryObjectStorage, ObjectStorage,
};
use objproc_reporting::{
    AuditOutcome, DeliveryAudit, InMemoryReportArchive, InMemoryReportRenderer,
    InMemoryReportSender, Recipient, ReportDeliveryProcessor, ReportRequest, ReportStatus,
};

type Storage = Arc<InMemoryObjectStorage<ReportRequest>>;
type Processor =
    ReportDeliveryProcessor<InMemoryReportRenderer, InMemoryReportArchive, InMemoryReportSender>;
type Engine = BackgroundObjectProcessor<ReportRequest, Processor, Storage, Arc<DeliveryAudit>>;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    engine: Engine,
    storage: Storage,
    renderer: Arc<InMemoryReportRenderer>,
    sender: Arc<InMemoryReportSender>,
    audit: Arc<DeliveryAudit>,
}

impl Harness {
    fn new(renderer: InMemoryReportRenderer, sender: InMemoryReportSender) -> Self {
        Self::with_config(renderer, sender, config())
    }

    fn with_config(
        renderer: InMemoryReportRenderer,
        sender: InMemoryReportSender,
        config: EngineConfig,
    ) -> Self {
        objproc_observability::init_with(objproc_observability::LogFormat::Compact);

        let storage: Storage = Arc::new(InMemoryObjectStorage::new());
        let renderer = Arc::new(renderer);
        let sender = Arc::new(sender);
        let audit = Arc::new(DeliveryAudit::new());
        let processor = ReportDeliveryProcessor::new(
            renderer.clone(),
            Arc::new(InMemoryReportArchive::new()),
            sender.clone(),
        );
        let engine: Engine =
            BackgroundObjectProcessor::with_hooks(config, processor, storage.clone(), audit.clone())
                .unwrap();
        engine.start().unwrap();
        Self {
            engine,
            storage,
            renderer,
            sender,
            audit,
        }
    }

    fn submit(&self, request: ReportRequest) -> ReportRequest {
        self.storage.insert(request.clone()).unwrap();
        request
    }

    fn reload(&self, request: &ReportRequest) -> ReportRequest {
        self.storage.find_by_id(request.id()).unwrap().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.engine.stop();
    }
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_instance_name("reports-test")
        .with_processing_thread_count(2)
        .with_maximum_queue_length(8)
        .with_retry_delay(Duration::ZERO)
        .with_processing_timeout(Duration::from_secs(5))
}

fn request(recipient: &str) -> ReportRequest {
    ReportRequest::new(
        "monthly-sales",
        Recipient::new(recipient).unwrap(),
        BTreeMap::from([("month".to_string(), "2026-09".to_string())]),
    )
    .unwrap()
}

#[test]
fn requested_report_is_rendered_and_delivered_in_one_claim() {
    let h = Harness::new(InMemoryReportRenderer::new(), InMemoryReportSender::new());
    let request = h.submit(request("sales@example.com"));

    assert_eq!(h.engine.process_until_idle(IDLE_TIMEOUT), 1);

    let stored = h.reload(&request);
    assert_eq!(stored.status(), ReportStatus::Delivered);
    assert_eq!(stored.processing_phase(), ProcessingPhase::Completed);
    assert_eq!(stored.processing_attempts(), 1);
    assert_eq!(stored.next_processed(), None);
    assert!(!stored.is_locked());

    let outbox = h.sender.outbox();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].recipient.as_str(), "sales@example.com");
    assert!(String::from_utf8_lossy(&outbox[0].report.body).contains("month=2026-09"));

    let entries = h.audit.entries_for(request.id());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].from, ReportStatus::Requested);
    assert_eq!(entries[0].to, ReportStatus::Delivered);
    assert!(matches!(entries[0].outcome, AuditOutcome::Settled { .. }));
}

#[test]
fn broken_renderer_exhausts_attempts_and_fails_generation() {
    let h = Harness::new(
        InMemoryReportRenderer::always_failing(),
        InMemoryReportSender::new(),
    );
    let request = h.submit(request("sales@example.com"));

    h.engine.process_until_idle(IDLE_TIMEOUT);

    let stored = h.reload(&request);
    assert_eq!(stored.status(), ReportStatus::GenerationFailed);
    assert_eq!(stored.processing_phase(), ProcessingPhase::Failed);
    assert_eq!(stored.processing_attempts(), 3);
    assert!(!stored.is_locked());
    assert!(stored.last_error().unwrap().contains("renderer unavailable"));
    assert_eq!(h.renderer.initiate_calls(), 3);
    assert!(h.sender.outbox().is_empty());

    let entries = h.audit.entries_for(request.id());
    let failures = entries
        .iter()
        .filter(|e| matches!(e.outcome, AuditOutcome::Failed { .. }))
        .count();
    let retries = entries
        .iter()
        .filter(|e| matches!(e.outcome, AuditOutcome::Retrying { .. }))
        .count();
    assert_eq!(failures, 1);
    assert_eq!(retries, 2);
    assert_eq!(h.engine.stats().failed_permanently, 1);
}

#[test]
fn suspended_request_is_left_alone() {
    let h = Harness::new(InMemoryReportRenderer::new(), InMemoryReportSender::new());
    let request = h.submit(request("sales@example.com").on_hold());

    assert_eq!(h.engine.process_until_idle(IDLE_TIMEOUT), 0);

    let stored = h.reload(&request);
    assert_eq!(stored.status(), ReportStatus::Requested);
    assert_eq!(stored.processing_attempts(), 0);
    assert_eq!(stored.next_processed(), request.next_processed());
    assert_eq!(h.renderer.initiate_calls(), 0);
}

#[test]
fn resumed_request_is_processed() {
    let h = Harness::new(InMemoryReportRenderer::new(), InMemoryReportSender::new());
    let request = h.submit(request("sales@example.com").on_hold());
    h.engine.process_until_idle(IDLE_TIMEOUT);

    h.storage
        .update_unlocked(request.id(), &mut |r: &mut ReportRequest| r.set_on_hold(false))
        .unwrap();
    assert_eq!(h.engine.process_until_idle(IDLE_TIMEOUT), 1);
    assert_eq!(h.reload(&request).status(), ReportStatus::Delivered);
}

#[test]
fn delivery_retry_reuses_the_archived_document() {
    let h = Harness::new(
        InMemoryReportRenderer::new(),
        InMemoryReportSender::unavailable_for(1),
    );
    let request = h.submit(request("sales@example.com"));

    assert_eq!(h.engine.process_until_idle(IDLE_TIMEOUT), 2);

    let stored = h.reload(&request);
    assert_eq!(stored.status(), ReportStatus::Delivered);
    assert_eq!(stored.processing_attempts(), 2);
    assert_eq!(h.renderer.initiate_calls(), 1);
    assert_eq!(h.sender.outbox().len(), 1);

    let entries = h.audit.entries_for(request.id());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].to, ReportStatus::DeliveryPending);
    assert_eq!(entries[1].from, ReportStatus::DeliveryPending);
    assert_eq!(entries[1].to, ReportStatus::Delivered);
}

#[test]
fn rejected_recipient_fails_delivery_without_retrying() {
    let recipient = Recipient::new("blocked@example.com").unwrap();
    let h = Harness::new(
        InMemoryReportRenderer::new(),
        InMemoryReportSender::new().reject(recipient),
    );
    let request = h.submit(request("blocked@example.com"));

    assert_eq!(h.engine.process_until_idle(IDLE_TIMEOUT), 1);

    let stored = h.reload(&request);
    assert_eq!(stored.status(), ReportStatus::DeliveryFailed);
    assert_eq!(stored.processing_attempts(), 1);
    assert_eq!(h.engine.stats().retried, 0);
}

#[test]
fn scheduled_request_waits_for_its_time() {
    let h = Harness::new(InMemoryReportRenderer::new(), InMemoryReportSender::new());
    let later = Utc::now() + chrono::Duration::hours(1);
    let request = h.submit(request("sales@example.com").scheduled_for(later));

    assert_eq!(h.engine.process_until_idle(IDLE_TIMEOUT), 0);
    assert_eq!(h.reload(&request).status(), ReportStatus::Requested);
}

#[test]
fn driver_thread_delivers_submitted_requests() {
    let h = Harness::with_config(
        InMemoryReportRenderer::new(),
        InMemoryReportSender::new(),
        config().with_poll_interval(Duration::from_millis(20)),
    );
    let driver = h.engine.spawn_driver().unwrap();

    let requests: Vec<_> = (0..5)
        .map(|i| h.submit(request(&format!("user{i}@example.com"))))
        .collect();
    driver.notify();

    let deadline = Instant::now() + IDLE_TIMEOUT;
    while h.sender.outbox().len() < requests.len() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    driver.shutdown();

    assert!(!h.engine.is_running());
    for request in &requests {
        let stored = h.reload(request);
        assert_eq!(stored.status(), ReportStatus::Delivered);
        assert_eq!(stored.processing_attempts(), 1);
    }
}
