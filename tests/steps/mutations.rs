//! Mutation and acknowledgement step definitions.

use std::time::Duration;

use cucumber::{given, then, when, World};
use realtime_store::{Ack, SyncError};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::harness::{pos_snapshot, Harness, STEP_TIMEOUT};

/// Test context for mutation scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct MutationWorld {
    harness: Harness,
    pending: Option<JoinHandle<realtime_store::Result<Ack>>>,
    rejected: Option<SyncError>,
    request_id: Option<String>,
}

impl MutationWorld {
    fn new() -> Self {
        Self {
            harness: Harness::new(),
            pending: None,
            rejected: None,
            request_id: None,
        }
    }

    fn submit(&mut self, submitted: realtime_store::Result<realtime_store::AckFuture>) {
        match submitted {
            Ok(ack) => self.pending = Some(tokio::spawn(ack)),
            Err(e) => self.rejected = Some(e),
        }
    }

    async fn outcome(&mut self) -> realtime_store::Result<Ack> {
        let pending = self.pending.take().expect("no mutation in flight");
        tokio::time::timeout(STEP_TIMEOUT, pending)
            .await
            .expect("mutation never settled")
            .expect("mutation task panicked")
    }
}

// --- Given steps ---

#[given("the session is ready with the pos snapshot")]
async fn given_ready(world: &mut MutationWorld) {
    world
        .harness
        .connect_with(pos_snapshot())
        .await
        .expect("connect failed");
}

// --- When steps ---

#[when(expr = "the client updates record {string} of {string} to version {int} with status {string}")]
async fn when_update(world: &mut MutationWorld, id: String, table: String, version: i64, status: String) {
    let submitted = world.harness.session().update(
        &table,
        json!({"id": id, "version": version, "status": status}),
        None,
    );
    world.submit(submitted);
}

#[when(expr = "the client updates record {string} of {string} without a version")]
async fn when_update_unversioned(world: &mut MutationWorld, id: String, table: String) {
    let submitted = world
        .harness
        .session()
        .update(&table, json!({"id": id, "status": "paid"}), None);
    world.submit(submitted);
}

#[when(expr = "the client removes a record without identifiers from {string}")]
async fn when_remove_unidentified(world: &mut MutationWorld, table: String) {
    let submitted = world
        .harness
        .session()
        .remove(&table, json!({"status": "paid"}), None);
    world.submit(submitted);
}

#[when(expr = "the client inserts record {string} into {string}")]
async fn when_insert(world: &mut MutationWorld, id: String, table: String) {
    let submitted = world
        .harness
        .session()
        .insert(&table, json!({"id": id, "version": 1}), None);
    world.submit(submitted);
}

#[when("the server acknowledges the request")]
async fn when_ack(world: &mut MutationWorld) {
    let request_id = world.request_id.clone().expect("no publish seen");
    world.harness.link().send(json!({
        "type": "server:ack",
        "meta": {"clientMeta": {"requestId": request_id}},
        "status": "accepted"
    }));
}

#[when("the server does not acknowledge within the request window")]
async fn when_no_ack(world: &mut MutationWorld) {
    let window = world.harness.config.requests.timeout();
    tokio::time::sleep(window + Duration::from_millis(100)).await;
}

// --- Then steps ---

#[then(expr = "the server receives a {string} publish for {string}")]
async fn then_publish(world: &mut MutationWorld, action: String, table: String) {
    let frame: Value = tokio::time::timeout(STEP_TIMEOUT, world.harness.link().recv_message())
        .await
        .expect("nothing published")
        .expect("link closed");
    assert_eq!(frame["type"], "client:publish");
    assert_eq!(frame["action"], action.as_str());
    assert_eq!(frame["table"], table.as_str());
    let request_id = frame["requestId"].as_str().expect("publish without requestId");
    assert_eq!(frame["meta"]["requestId"], request_id);
    world.request_id = Some(request_id.to_string());
}

#[then("the mutation resolves with the acknowledgement payload")]
async fn then_resolves(world: &mut MutationWorld) {
    let ack = world.outcome().await.expect("mutation failed");
    assert_eq!(Some(&ack.request_id), world.request_id.as_ref());
    assert_eq!(ack.payload["status"], "accepted");
}

#[then("the mutation is rejected as a validation error")]
async fn then_rejected(world: &mut MutationWorld) {
    let err = world.rejected.as_ref().expect("mutation was not rejected");
    assert!(err.is_validation(), "unexpected error: {err}");
    assert!(world.pending.is_none());
}

#[then("the mutation fails with a timeout")]
async fn then_timeout(world: &mut MutationWorld) {
    let err = world.outcome().await.expect_err("mutation resolved");
    assert!(err.is_timeout(), "unexpected error: {err}");
}

#[then("no request is pending")]
async fn then_nothing_pending(world: &mut MutationWorld) {
    assert_eq!(world.harness.session().correlator().pending_count(), 0);
}
