use super::*;
use crate::bus::{Channel, Notification, StatusBus};
use crate::config::{RequestConfig, SessionConfig};
use crate::error::ErrorKind;
use crate::session::{LinkSlot, Outbox, SessionStatus};
use serde_json::{json, Map};
use tokio::sync::{mpsc, watch};

const TIMEOUT: Duration = Duration::from_millis(500);

fn ack_for(request_id: &str) -> AckEnvelope {
    AckEnvelope::from_frame(json!({
        "type": "server:ack",
        "meta": {"clientMeta": {"requestId": request_id}},
        "ok": true
    }))
}

struct Harness {
    publisher: MutationPublisher,
    correlator: RequestCorrelator,
    status: watch::Sender<SessionStatus>,
    sent: mpsc::UnboundedReceiver<String>,
    bus: Arc<StatusBus>,
}

fn harness(status: SessionStatus) -> Harness {
    let bus = Arc::new(StatusBus::new());
    let (status_tx, status_rx) = watch::channel(status);
    let (link_tx, sent) = mpsc::unbounded_channel();
    let slot: LinkSlot = Arc::new(Mutex::new(Some(link_tx)));
    let correlator = RequestCorrelator::new(TIMEOUT);
    let requests = RequestConfig {
        timeout_ms: 500,
        ..RequestConfig::default()
    };
    let publisher = MutationPublisher::new(
        &SessionConfig::default(),
        &requests,
        correlator.clone(),
        Outbox::new(status_rx, slot, bus.clone()),
    );
    Harness {
        publisher,
        correlator,
        status: status_tx,
        sent,
        bus,
    }
}

fn sent_frame(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

// ============================================================================
// Correlator
// ============================================================================

#[tokio::test]
async fn test_ack_fulfils_and_clears_pending() {
    let correlator = RequestCorrelator::new(TIMEOUT);
    let ack = correlator.register("r1");
    assert!(correlator.is_pending("r1"));

    assert!(correlator.resolve(&ack_for("r1")));

    let ack = ack.await.unwrap();
    assert_eq!(ack.request_id, "r1");
    assert_eq!(ack.payload["ok"], true);
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_rejects_and_clears_pending() {
    let correlator = RequestCorrelator::new(TIMEOUT);
    let started = Instant::now();

    let err = correlator.register("r1").await.unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() >= TIMEOUT);
    assert!(!correlator.is_pending("r1"));
}

#[tokio::test(start_paused = true)]
async fn test_late_ack_is_ignored() {
    let correlator = RequestCorrelator::new(TIMEOUT);
    let ack = correlator.register("r1");
    assert!(ack.await.unwrap_err().is_timeout());

    assert!(!correlator.resolve(&ack_for("r1")));
}

#[tokio::test(start_paused = true)]
async fn test_ack_cancels_timer() {
    let correlator = RequestCorrelator::new(TIMEOUT);
    let ack = correlator.register("r1");
    correlator.resolve(&ack_for("r1"));
    tokio::time::sleep(TIMEOUT * 2).await;

    assert!(ack.await.is_ok());
}

#[tokio::test]
async fn test_ack_without_id_or_unknown_id() {
    let correlator = RequestCorrelator::new(TIMEOUT);
    let _ack = correlator.register("r1");

    assert!(!correlator.resolve(&AckEnvelope::from_frame(json!({"type": "server:ack"}))));
    assert!(!correlator.resolve(&ack_for("other")));
    assert_eq!(correlator.pending_ids(), vec!["r1".to_string()]);
}

#[tokio::test]
async fn test_pending_ids_sorted() {
    let correlator = RequestCorrelator::new(TIMEOUT);
    let _b = correlator.register("b");
    let _a = correlator.register("a");
    assert_eq!(correlator.pending_ids(), vec!["a".to_string(), "b".to_string()]);
}

// ============================================================================
// Publisher
// ============================================================================

#[tokio::test]
async fn test_insert_sends_publish_frame() {
    let mut h = harness(SessionStatus::Ready);
    let mut meta = Map::new();
    meta.insert("source".to_string(), json!("till-1"));

    let _ack = h
        .publisher
        .insert("order_header", json!({"id": "o1"}), Some(meta))
        .unwrap();

    let frame = sent_frame(&h.sent.recv().await.unwrap());
    assert_eq!(frame["type"], "client:publish");
    assert_eq!(frame["action"], "module:insert");
    assert_eq!(frame["table"], "order_header");
    assert_eq!(frame["branchId"], "main");
    assert_eq!(frame["moduleId"], "pos");
    assert_eq!(frame["meta"]["source"], "till-1");
    assert_eq!(frame["meta"]["requestId"], frame["requestId"]);
    assert!(h
        .correlator
        .is_pending(frame["requestId"].as_str().unwrap()));
}

#[tokio::test]
async fn test_each_action_maps_to_wire_action() {
    let mut h = harness(SessionStatus::Open);
    let record = || json!({"id": "o1", "version": 3});

    let _a = h.publisher.merge("t", record(), None).unwrap();
    let _b = h.publisher.save("t", record(), None).unwrap();
    let _c = h.publisher.remove("t", json!({"id": "o1"}), None).unwrap();
    let _d = h.publisher.update("t", record(), None).unwrap();

    let mut actions = Vec::new();
    for _ in 0..4 {
        actions.push(sent_frame(&h.sent.recv().await.unwrap())["action"].clone());
    }
    actions.sort_by_key(|a| a.as_str().unwrap_or_default().to_string());
    assert_eq!(
        actions,
        vec![
            json!("module:delete"),
            json!("module:merge"),
            json!("module:save"),
            json!("module:update")
        ]
    );
}

#[tokio::test]
async fn test_validation_rejects_before_send() {
    let mut h = harness(SessionStatus::Ready);

    let missing_table = h.publisher.insert("  ", json!({"id": 1}), None);
    let missing_record = h.publisher.insert("t", Value::Null, None);
    let bad_ref = h.publisher.remove("t", json!({"name": "x"}), None);
    let missing_ref = h.publisher.remove("t", json!("o1"), None);

    for result in [missing_table, missing_record, bad_ref, missing_ref] {
        assert!(result.err().unwrap().is_validation());
    }
    tokio::task::yield_now().await;
    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_version_gate_rejects_synchronously() {
    let mut h = harness(SessionStatus::Ready);

    let result = h
        .publisher
        .update("order_header", json!({"id": "o1", "status": "paid"}), None);

    match result {
        Err(SyncError::MissingVersion { table }) => assert_eq!(table, "order_header"),
        other => panic!("expected MissingVersion, got {:?}", other.map(|_| ())),
    }
    tokio::task::yield_now().await;
    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_version_gate_requires_numeric_version() {
    let h = harness(SessionStatus::Ready);
    assert!(h
        .publisher
        .update("order_header", json!({"id": "o1", "version": "2"}), None)
        .is_err());
    assert!(h
        .publisher
        .update("order_header", json!({"id": "o1", "version": 2}), None)
        .is_ok());
    assert!(h
        .publisher
        .update("other_table", json!({"id": "o1"}), None)
        .is_ok());
}

#[tokio::test]
async fn test_send_waits_for_open_transport() {
    let mut h = harness(SessionStatus::Connecting);
    let _ack = h.publisher.insert("t", json!({"id": 1}), None).unwrap();

    tokio::task::yield_now().await;
    assert!(h.sent.try_recv().is_err());

    h.status.send_replace(SessionStatus::Open);
    let frame = sent_frame(&h.sent.recv().await.unwrap());
    assert_eq!(frame["type"], "client:publish");
}

#[tokio::test(start_paused = true)]
async fn test_send_on_closed_transport_is_abandoned_but_still_times_out() {
    let mut h = harness(SessionStatus::Closed);
    let (report_tx, mut reports) = mpsc::unbounded_channel();
    h.bus.on(Channel::Error, move |n| {
        if let Notification::Error(report) = n {
            let _ = report_tx.send(report.clone());
        }
        Ok(())
    });

    let ack = h.publisher.insert("t", json!({"id": 1}), None).unwrap();

    let report = reports.recv().await.unwrap();
    assert_eq!(report.kind, ErrorKind::SendError);
    assert_eq!(h.correlator.pending_count(), 1);
    assert!(h.sent.try_recv().is_err());

    assert!(ack.await.unwrap_err().is_timeout());
    assert_eq!(h.correlator.pending_count(), 0);
}
