//! Projection step definitions.

use cucumber::{given, then, when, World};
use realtime_store::Filter;
use serde_json::{json, Map, Value};

use super::harness::{pos_snapshot, Harness};

/// Test context for projection scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct ProjectionWorld {
    harness: Harness,
    sequence: u64,
}

impl ProjectionWorld {
    fn new() -> Self {
        Self {
            harness: Harness::new(),
            sequence: 0,
        }
    }

    async fn push(&mut self, mut frame: Value) {
        self.sequence += 1;
        frame["type"] = json!("server:event");
        frame["sequence"] = json!(self.sequence);
        self.harness.push_event(frame).await;
    }

    fn row(&mut self, table: &str, id: &str) -> Value {
        self.harness
            .session()
            .read(table, &json!(id), None)
            .expect("read failed")
            .unwrap_or_else(|| panic!("record {id} not in {table}"))
    }
}

// --- Given steps ---

#[given("the session is ready with the pos snapshot")]
async fn given_ready(world: &mut ProjectionWorld) {
    world
        .harness
        .connect_with(pos_snapshot())
        .await
        .expect("connect failed");
}

// --- When steps ---

#[when(expr = "the server merges status {string} into record {string} of {string}")]
async fn when_merge(world: &mut ProjectionWorld, status: String, id: String, table: String) {
    world
        .push(json!({
            "table": table,
            "action": "module:merge",
            "recordRef": {"id": id},
            "record": {"status": status}
        }))
        .await;
}

#[when(expr = "the server inserts record {string} into {string}")]
async fn when_insert(world: &mut ProjectionWorld, id: String, table: String) {
    world
        .push(json!({
            "table": table,
            "action": "module:insert",
            "record": {"id": id, "version": 1, "status": "open"}
        }))
        .await;
}

#[when(expr = "the server inserts record {string} into {string} of module {string}")]
async fn when_insert_module(world: &mut ProjectionWorld, id: String, table: String, module_id: String) {
    world
        .push(json!({
            "moduleId": module_id,
            "table": table,
            "action": "module:insert",
            "record": {"id": id}
        }))
        .await;
}

#[when(expr = "the server deletes record {string} from {string}")]
async fn when_delete(world: &mut ProjectionWorld, id: String, table: String) {
    world
        .push(json!({
            "table": table,
            "action": "module:delete",
            "recordRef": {"id": id}
        }))
        .await;
}

// --- Then steps ---

#[then(expr = "record {string} of {string} has status {string}")]
async fn then_status(world: &mut ProjectionWorld, id: String, table: String, status: String) {
    assert_eq!(world.row(&table, &id)["status"], status.as_str());
}

#[then(expr = "record {string} of {string} has version {int}")]
async fn then_version(world: &mut ProjectionWorld, id: String, table: String, version: i64) {
    assert_eq!(world.row(&table, &id)["version"], version);
}

#[then(expr = "table {string} has {int} records")]
async fn then_count(world: &mut ProjectionWorld, table: String, count: usize) {
    assert_eq!(world.harness.session().list_table(&table, None).len(), count);
}

#[then(expr = "module {string} table {string} has {int} records")]
async fn then_module_count(world: &mut ProjectionWorld, module_id: String, table: String, count: usize) {
    let rows = world.harness.session().list_table(&table, Some(&module_id));
    assert_eq!(rows.len(), count);
}

#[then(expr = "reading record {string} of {string} finds nothing")]
async fn then_read_nothing(world: &mut ProjectionWorld, id: String, table: String) {
    let found = world
        .harness
        .session()
        .read(&table, &json!(id), None)
        .expect("read failed");
    assert!(found.is_none(), "unexpected row {found:?}");
}

#[then(expr = "querying {string} for status {string} returns {int} records")]
async fn then_query(world: &mut ProjectionWorld, table: String, status: String, count: usize) {
    let mut fields = Map::new();
    fields.insert("status".to_string(), json!(status));
    let rows = world
        .harness
        .session()
        .query(&table, &Filter::Fields(fields), None)
        .expect("query failed");
    assert_eq!(rows.len(), count);
}
