//! Session lifecycle step definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use cucumber::{given, then, when, World};
use realtime_store::state::ModuleState;
use realtime_store::SyncError;
use tokio::time::Instant;

use super::harness::{parse_status, pos_snapshot, Harness};

/// Test context for connection scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct ConnectionWorld {
    harness: Harness,
    modules: Option<BTreeMap<String, ModuleState>>,
    connect_error: Option<SyncError>,
}

impl ConnectionWorld {
    fn new() -> Self {
        Self {
            harness: Harness::new(),
            modules: None,
            connect_error: None,
        }
    }

    async fn connect(&mut self) {
        let session = self.harness.session();
        self.harness
            .connect_with(pos_snapshot())
            .await
            .expect("connect failed");
        self.modules = Some(session.projection().modules());
    }
}

// --- Given steps ---

#[given(expr = "a store for branch {string} and module {string}")]
async fn given_store(world: &mut ConnectionWorld, branch_id: String, module_id: String) {
    world.harness.config.session.branch_id = branch_id;
    world.harness.config.session.module_id = module_id;
}

#[given(expr = "the session role is {string}")]
async fn given_role(world: &mut ConnectionWorld, role: String) {
    world.harness.config.session.role = role;
}

#[given("auto-reconnect is disabled")]
async fn given_no_reconnect(world: &mut ConnectionWorld) {
    world.harness.config.session.auto_reconnect = false;
}

#[given("the session is ready")]
async fn given_ready(world: &mut ConnectionWorld) {
    world.connect().await;
}

#[given(expr = "the server refuses the next {int} connection attempts")]
async fn given_refusals(world: &mut ConnectionWorld, count: usize) {
    world.harness.server().refuse_next(count);
}

// --- When steps ---

#[when("the session connects and the server sends the pos snapshot")]
async fn when_connects(world: &mut ConnectionWorld) {
    world.connect().await;
}

#[when("the session connects to a refusing server")]
async fn when_connects_refused(world: &mut ConnectionWorld) {
    let session = world.harness.session();
    world.connect_error = session.connect().await.err();
}

#[when("the connection drops")]
async fn when_connection_drops(world: &mut ConnectionWorld) {
    world.harness.closed_at = Some(Instant::now());
    world.harness.take_link().close();
}

#[when("the client disconnects")]
async fn when_disconnects(world: &mut ConnectionWorld) {
    world.harness.session().disconnect().await;
}

// --- Then steps ---

#[then(expr = "connect resolves with module {string}")]
async fn then_connect_resolves(world: &mut ConnectionWorld, module_id: String) {
    let modules = world.modules.as_ref().expect("connect did not resolve");
    assert!(modules.contains_key(&module_id), "missing module {module_id}");
}

#[then("connect fails with a transport error")]
async fn then_connect_fails(world: &mut ConnectionWorld) {
    let err = world.connect_error.as_ref().expect("connect did not fail");
    assert!(matches!(err, SyncError::Transport(_)), "unexpected error: {err}");
    assert!(err.is_connection_error());
}

#[then(expr = "module {string} has version {int}")]
async fn then_module_version(world: &mut ConnectionWorld, module_id: String, version: i64) {
    let module = world
        .harness
        .session()
        .snapshot(Some(&module_id))
        .expect("module not projected");
    assert_eq!(module.version, Some(version));
}

#[then(expr = "table {string} lists record {string}")]
async fn then_table_lists(world: &mut ConnectionWorld, table: String, id: String) {
    let rows = world.harness.session().list_table(&table, None);
    assert!(
        rows.iter().any(|row| row["id"] == id.as_str()),
        "record {id} not in {table}: {rows:?}"
    );
}

#[then(expr = "the session status is {string}")]
async fn then_status_is(world: &mut ConnectionWorld, status: String) {
    assert_eq!(world.harness.session().status(), parse_status(&status));
}

#[then(expr = "the session status becomes {string}")]
async fn then_status_becomes(world: &mut ConnectionWorld, status: String) {
    world.harness.wait_for_status(parse_status(&status)).await;
}

#[then(expr = "the handshake names branch {string} and role {string}")]
async fn then_handshake_names(world: &mut ConnectionWorld, branch_id: String, role: String) {
    let hello = world.harness.handshake.as_ref().expect("no handshake seen");
    assert_eq!(hello["branchId"], branch_id.as_str());
    assert_eq!(hello["role"], role.as_str());
}

#[then("the handshake requests a snapshot")]
async fn then_handshake_requests_snapshot(world: &mut ConnectionWorld) {
    let hello = world.harness.handshake.clone().expect("no handshake seen");
    assert_eq!(hello["requestSnapshot"], true);
    let sent = world
        .harness
        .session()
        .last_handshake()
        .expect("handshake not recorded");
    assert_eq!(hello["requestId"], sent.request_id.as_str());
}

#[then("the server accepts a new connection")]
async fn then_server_accepts(world: &mut ConnectionWorld) {
    world.harness.accept().await;
}

#[then(expr = "the first reconnect attempt waited at least {int} ms")]
async fn then_first_gap(world: &mut ConnectionWorld, millis: u64) {
    let closed_at = world.harness.closed_at.expect("connection never dropped");
    let attempts = world.harness.server().attempts();
    assert!(attempts.len() >= 2, "no reconnect attempt: {attempts:?}");
    assert!(attempts[1] - closed_at >= Duration::from_millis(millis));
}

#[then(expr = "the second reconnect attempt waited at least {int} ms")]
async fn then_second_gap(world: &mut ConnectionWorld, millis: u64) {
    let attempts = world.harness.server().attempts();
    assert!(attempts.len() >= 3, "no second reconnect attempt: {attempts:?}");
    assert!(attempts[2] - attempts[1] >= Duration::from_millis(millis));
}

#[then(expr = "no reconnect attempt is made within {int} ms")]
async fn then_no_reconnect(world: &mut ConnectionWorld, millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    assert_eq!(world.harness.server().attempt_count(), 1);
    assert_eq!(world.harness.session().reconnect_delay(), None);
}
