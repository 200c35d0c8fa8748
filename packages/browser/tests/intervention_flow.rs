//! End-to-end intervention lifecycle over a shared queue file.

use std::sync::Arc;
use std::time::Duration;

use browser::{BlockerKind, InterventionBroker, PageSnapshot, SessionRegistry, SessionStatus};

fn make_broker(dir: &std::path::Path, registry: Arc<SessionRegistry>) -> InterventionBroker {
    InterventionBroker::new(dir.join("captcha_queue.json"), None, registry)
        .with_poll_interval(Duration::from_millis(25))
}

#[tokio::test]
async fn captcha_on_search_page_pauses_and_resumes_session() {
    // A recaptcha marker on the page fires detection at high confidence.
    let body = r#"<html><body><div class="g-recaptcha" data-sitekey="k"></div></body></html>"#;
    let detection = browser::detect_blocker(&PageSnapshot {
        url: "https://www.google.com/search?q=laptops",
        content: body,
        status_code: Some(200),
    })
    .expect("recaptcha should be detected");
    assert_eq!(detection.kind, BlockerKind::Recaptcha);
    assert!(detection.confidence >= 0.9);

    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    registry.register("user1_research");
    let broker = Arc::new(make_broker(dir.path(), registry.clone()));

    // Filing the intervention persists it and pauses the session.
    let intervention = broker
        .request_intervention(
            detection.kind,
            "https://www.google.com/search?q=laptops",
            None,
            "user1_research",
            None,
        )
        .unwrap();

    let paused = registry.get("user1_research").unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    assert_eq!(paused.intervention_id.as_deref(), Some(intervention.id.as_str()));
    assert_eq!(broker.list_pending().len(), 1);

    // A waiter parked on the intervention returns promptly after resolve.
    let waiter = {
        let broker = broker.clone();
        let id = intervention.id.clone();
        tokio::spawn(async move { broker.wait_for_resolution(&id, Duration::from_secs(4)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.resolve(&intervention.id, true, None).unwrap();
    assert!(waiter.await.unwrap());

    // Resolution resumed the session and drained the queue.
    assert_eq!(
        registry.get("user1_research").unwrap().status,
        SessionStatus::Active
    );
    assert!(broker.list_pending().is_empty());
}

#[tokio::test]
async fn resolution_is_visible_across_broker_instances() {
    let dir = tempfile::tempdir().unwrap();
    let registry_a = Arc::new(SessionRegistry::new());
    let registry_b = Arc::new(SessionRegistry::new());

    // Two brokers over the same file stand in for two processes.
    let worker = make_broker(dir.path(), registry_a);
    let gateway = make_broker(dir.path(), registry_b);

    let intervention = worker
        .request_intervention(
            BlockerKind::Cloudflare,
            "https://shop.example/deals",
            None,
            "s1",
            None,
        )
        .unwrap();

    // The gateway sees the record purely through the file.
    let seen = gateway.get(&intervention.id).expect("hydrated from file");
    assert_eq!(seen.domain, "shop.example");
    assert_eq!(gateway.list_pending().len(), 1);

    // The gateway resolves; the worker's waiter observes the removal.
    gateway.resolve(&intervention.id, true, None).unwrap();
    assert!(
        worker
            .wait_for_resolution(&intervention.id, Duration::from_secs(2))
            .await
    );

    // Resolve is idempotent from either side.
    let again = gateway.resolve(&intervention.id, true, None).unwrap();
    assert!(again.is_success());
}

#[tokio::test]
async fn skipped_intervention_reports_failure_to_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    registry.register("s1");
    let broker = make_broker(dir.path(), registry.clone());

    let intervention = broker
        .request_intervention(BlockerKind::RateLimit, "https://shop.example/x", None, "s1", None)
        .unwrap();
    broker
        .resolve(&intervention.id, false, Some("could not solve".to_string()))
        .unwrap();

    assert!(
        !broker
            .wait_for_resolution(&intervention.id, Duration::from_millis(200))
            .await
    );
    // A failed resolution closes rather than resumes the session.
    assert_eq!(registry.get("s1").unwrap().status, SessionStatus::Closed);
}
