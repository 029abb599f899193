//! Audit pipeline integration tests
//!
//! End-to-end tests exercising signing, redaction, dispatch, batching and
//! integrity scans together over the in-memory backends.

use a3s_audit::{
    AllowList, AuditConfig, AuditError, AuditEvent, AuditPipeline, EnvSecret, HealthStatus,
    IntegritySigner, JobPayload, JobQueue, MemoryJobQueue, MemoryKvCache, MemoryRecordStore,
    RecordStore, RemediationGrant, ReportStatus, RequestContext, SignerConfig, StaticSecret,
};
use serde_json::json;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    pipeline: Arc<AuditPipeline>,
    store: Arc<MemoryRecordStore>,
    queue: Arc<MemoryJobQueue>,
}

fn harness_with(mut config: AuditConfig) -> Harness {
    config.retry.max_retries = 0;
    let store = Arc::new(MemoryRecordStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let pipeline = AuditPipeline::new(
        config,
        &StaticSecret::new("secret"),
        store.clone(),
        queue.clone(),
        Arc::new(MemoryKvCache::new()),
    )
    .unwrap();
    Harness {
        pipeline: Arc::new(pipeline),
        store,
        queue,
    }
}

fn harness() -> Harness {
    harness_with(AuditConfig::default())
}

// Set RUST_LOG=a3s_audit=debug to see pipeline logs for a failing test
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ─── Signing ─────────────────────────────────────────────────────

#[test]
fn test_login_description_change_is_detected() {
    init_tracing();
    let signer = IntegritySigner::new("secret", SignerConfig::default()).unwrap();
    let original = json!({
        "type": "login",
        "description": "x",
        "created_at": "2024-01-01T00:00:00Z"
    });

    let signature = signer.sign(&original).unwrap();
    assert_eq!(
        signature,
        "v1:445a9e91e19996ea2d52b87c0aa253081b48d9d13dac8dd49874720a3316167b"
    );

    let mut stored = original.clone();
    stored["signature"] = json!(signature);
    assert!(signer.verify(&stored));

    let mut edited = stored.clone();
    edited["description"] = json!("y");
    assert!(!signer.verify(&edited));

    let requester = RequestContext::new("203.0.113.9", "psql/16");
    assert!(signer.detect_tampering(&edited, &original, &requester));
    let changes = signer.critical_field_changes(&edited, &original).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].field, "description");
    assert_eq!(changes[0].old, json!("x"));
    assert_eq!(changes[0].new, json!("y"));
}

#[test]
fn test_missing_secret_is_fatal() {
    let unset = EnvSecret::new(format!("A3S_AUDIT_IT_UNSET_{}", uuid::Uuid::new_v4().simple()));
    let result = AuditPipeline::new(
        AuditConfig::default(),
        &unset,
        Arc::new(MemoryRecordStore::new()),
        Arc::new(MemoryJobQueue::new()),
        Arc::new(MemoryKvCache::new()),
    );
    assert!(matches!(result, Err(AuditError::Config(_))));

    assert!(matches!(
        IntegritySigner::new("", SignerConfig::default()),
        Err(AuditError::Config(_))
    ));
}

// ─── Record & Dispatch ───────────────────────────────────────────

#[tokio::test]
async fn test_record_persists_signed_and_dispatches_redacted() {
    let h = harness();
    let event = AuditEvent::new("password_changed", "Password changed for ann@example.com")
        .with_actor("user-7")
        .with_property("password", json!("hello"))
        .with_property("plan", json!("pro"))
        .with_request(&RequestContext::new("198.51.100.23", "Mozilla/5.0"));

    let outcome = assert_ok!(h.pipeline.record(event.clone()).await);

    let stored = h.store.get(&event.id).await.unwrap().unwrap();
    assert_eq!(stored, outcome.record);
    assert_eq!(stored.event.properties["password"], "hello");
    assert!(h.pipeline.signer().verify(&stored));

    let job_id = outcome.job_id.unwrap();
    let jobs = h.queue.pending_jobs("audit").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, job_id);
    let JobPayload::Single(copy) = &jobs[0].payload else {
        panic!("expected a single-event job");
    };
    assert_eq!(copy.properties["password"], "hell*");
    assert_eq!(copy.properties["plan"], "pro");
    assert_eq!(copy.description, "Password changed for [EMAIL]");
    assert_eq!(copy.ip_address.as_deref(), Some("198.*********"));
}

#[tokio::test]
async fn test_broker_outage_does_not_block_recording() {
    let h = harness();
    h.queue.set_unavailable(true);

    let outcome = assert_ok!(h.pipeline.record(AuditEvent::new("login", "x")).await);
    assert!(outcome.job_id.is_none());
    assert_eq!(h.store.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_store_outage_propagates() {
    let h = harness();
    h.store.set_unavailable(true);

    assert_err!(h.pipeline.record(AuditEvent::new("login", "x")).await);
    assert_eq!(h.queue.size("audit").await.unwrap(), 0);
}

#[tokio::test]
async fn test_high_risk_routed_to_priority_queue() {
    let h = harness();
    h.pipeline
        .record(AuditEvent::new("role_assigned", "Granted superuser").with_risk_level(9))
        .await
        .unwrap();
    h.pipeline
        .record(AuditEvent::new("unauthorized_access", "Blocked request"))
        .await
        .unwrap();
    h.pipeline.record(AuditEvent::new("page_view", "Viewed settings")).await.unwrap();

    assert_eq!(h.queue.size("audit-high").await.unwrap(), 2);
    assert_eq!(h.queue.size("audit").await.unwrap(), 1);
}

#[tokio::test]
async fn test_batch_jobs_are_ceil_n_over_c() {
    for (n, c) in [(1usize, 100usize), (100, 100), (101, 100), (250, 100), (7, 3)] {
        let mut config = AuditConfig::default();
        config.dispatch.batch_chunk_size = c;
        let h = harness_with(config);
        let events: Vec<AuditEvent> = (0..n).map(|i| AuditEvent::new("export", i.to_string())).collect();

        let ids = h.pipeline.dispatcher().log_batch_async(&events, None).await;

        assert_eq!(ids.len(), (n + c - 1) / c, "n={n} c={c}");
        let jobs = h.queue.pending_jobs("audit-batch").await;
        assert_eq!(jobs.len(), (n + c - 1) / c);
        assert!(jobs.iter().all(|job| job.payload.len() <= c));
        assert_eq!(jobs.iter().map(|job| job.payload.len()).sum::<usize>(), n);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batched_recording_loses_nothing() {
    let mut config = AuditConfig::default();
    config.dispatch.batch_size = 10;
    let h = harness_with(config);

    let mut handles = Vec::new();
    for producer in 0..6 {
        let pipeline = h.pipeline.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..17 {
                let event = AuditEvent::new("page_view", format!("{}-{}", producer, i))
                    .with_property("session_token", json!("abcdef123456"));
                pipeline.record_batched(event).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    h.pipeline.dispatcher().flush_batch().await;

    let jobs = h.queue.pending_jobs("audit-batch").await;
    let events: Vec<&AuditEvent> = jobs.iter().flat_map(|job| job.payload.events()).collect();
    assert_eq!(events.len(), 102);
    assert!(jobs.iter().all(|job| job.payload.len() <= 10));
    assert!(events.iter().all(|e| e.properties["session_token"] == "abcd********"));
    assert_eq!(h.store.count(None).await.unwrap(), 102);
}

#[tokio::test]
async fn test_batched_events_survive_broker_outage() {
    let mut config = AuditConfig::default();
    config.dispatch.batch_size = 3;
    let h = harness_with(config);
    h.queue.set_unavailable(true);

    for i in 0..3 {
        assert_ok!(h.pipeline.record_batched(AuditEvent::new("page_view", i.to_string())).await);
    }
    assert_eq!(h.store.count(None).await.unwrap(), 3);
    assert_eq!(h.pipeline.dispatcher().pending_batch_events().await.unwrap(), 3);

    h.queue.set_unavailable(false);
    let flushed = h.pipeline.dispatcher().flush_batch().await;
    assert_eq!(flushed.len(), 1);
    let jobs = h.queue.pending_jobs("audit-batch").await;
    assert_eq!(jobs.iter().map(|job| job.payload.len()).sum::<usize>(), 3);
}

#[tokio::test]
async fn test_deep_queue_reports_warning() {
    let mut config = AuditConfig::default();
    config.health.queue_depth_warning = 5;
    let h = harness_with(config);

    for i in 0..6 {
        h.pipeline.record(AuditEvent::new("login", i.to_string())).await.unwrap();
    }

    let report = h.pipeline.dispatcher().monitor_queue_health().await;
    assert_eq!(report.status, HealthStatus::Warning);
    assert!(report.issues.iter().any(|issue| issue.contains("'audit'")));
    assert!(!report.recommendations.is_empty());
    assert_eq!(report.stats.total_dispatched, 6);
}

// ─── Integrity Scan ──────────────────────────────────────────────

#[tokio::test]
async fn test_k_tampered_of_r_reported_for_any_batch_size() {
    const R: usize = 20;
    const K: usize = 5;
    init_tracing();

    let h = harness();
    let mut ids = Vec::new();
    for i in 0..R {
        let at = format!("2024-01-01T00:{:02}:00Z", i).parse().unwrap();
        let outcome = h
            .pipeline
            .record(AuditEvent::new("login", format!("login {}", i)).with_actor("user-1").at(at))
            .await
            .unwrap();
        ids.push(outcome.record.event.id);
    }
    for id in ids.iter().step_by(R / K) {
        h.store
            .modify_raw(id, |r| r.event.actor_id = Some("intruder".to_string()))
            .await
            .unwrap();
    }

    for batch_size in [1, 2, 3, 7, 19, R] {
        let report = h
            .pipeline
            .auditor()
            .perform_integrity_check(None, Some(batch_size))
            .await
            .unwrap();

        assert_eq!(report.total_checked, R, "batch_size={batch_size}");
        assert_eq!(report.invalid, K, "batch_size={batch_size}");
        assert_eq!(report.valid + report.invalid + report.missing_signature, R);
        assert_eq!(report.status, ReportStatus::CorruptionDetected);
        assert!(report.corrupted.iter().all(|c| c.actor_id.as_deref() == Some("intruder")));
    }
}

#[tokio::test]
async fn test_scan_ignores_records_written_after_start() {
    let h = harness();
    let future = chrono::Utc::now() + chrono::Duration::hours(1);
    h.pipeline.record(AuditEvent::new("login", "now")).await.unwrap();
    h.pipeline
        .record(AuditEvent::new("login", "later").at(future))
        .await
        .unwrap();

    let report = h.pipeline.auditor().perform_integrity_check(None, None).await.unwrap();
    assert_eq!(report.total_checked, 1);
    assert!(report.is_clean());
}

// ─── Remediation ─────────────────────────────────────────────────

#[tokio::test]
async fn test_resigning_requires_configured_operator() {
    init_tracing();
    let mut config = AuditConfig::default();
    config.auditor.remediation_operators = vec!["ops-lead".to_string()];
    let h = harness_with(config);

    let outcome = h.pipeline.record(AuditEvent::new("login", "x")).await.unwrap();
    let id = outcome.record.event.id.clone();
    h.store
        .modify_raw(&id, |r| r.event.description = "y".to_string())
        .await
        .unwrap();

    let forged = RemediationGrant::issue(&AllowList::new(["intruder"]), "intruder", "hide edit").unwrap();
    assert!(matches!(
        h.pipeline.auditor().regenerate_signature(&id, &forged).await,
        Err(AuditError::Authorization(_))
    ));
    assert!(matches!(
        h.pipeline.auditor().issue_grant("intruder", "hide edit"),
        Err(AuditError::Authorization(_))
    ));
    let report = h.pipeline.auditor().perform_integrity_check(None, None).await.unwrap();
    assert_eq!(report.invalid, 1);

    let grant = h.pipeline.auditor().issue_grant("ops-lead", "approved correction").unwrap();
    assert_ok!(h.pipeline.auditor().regenerate_signature(&id, &grant).await);
    let report = h.pipeline.auditor().perform_integrity_check(None, None).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.total_checked, 2);
}
