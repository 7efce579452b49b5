//! Mutation methods: `insert`, `merge`, `save`, `remove`, `update`.
//!
//! Each call validates locally, registers a pending request, and hands the
//! `client:publish` frame to the outbox in the background. Validation errors
//! are returned before anything is registered or sent.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::{AckFuture, RequestCorrelator};
use crate::config::{RequestConfig, SessionConfig};
use crate::error::{Result, SyncError};
use crate::identity::RecordRef;
use crate::protocol::{Action, ClientMessage, PublishRequest};
use crate::session::Outbox;

/// Issues mutations for one session.
#[derive(Clone)]
pub struct MutationPublisher {
    branch_id: Arc<str>,
    module_id: Arc<str>,
    version_controlled: Arc<BTreeSet<String>>,
    send_wait: Duration,
    correlator: RequestCorrelator,
    outbox: Outbox,
}

impl MutationPublisher {
    pub(crate) fn new(
        session: &SessionConfig,
        requests: &RequestConfig,
        correlator: RequestCorrelator,
        outbox: Outbox,
    ) -> Self {
        Self {
            branch_id: Arc::from(session.branch_id.as_str()),
            module_id: Arc::from(session.module_id.as_str()),
            version_controlled: Arc::new(requests.version_controlled_tables.clone()),
            send_wait: requests.send_wait(),
            correlator,
            outbox,
        }
    }

    pub fn insert(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.publish(Action::Insert, table, record, meta)
    }

    pub fn merge(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.publish(Action::Merge, table, record, meta)
    }

    pub fn save(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.publish(Action::Save, table, record, meta)
    }

    /// Delete the row identified by `record_ref` (`{id}`, `{key}`,
    /// `{recordKey}`, `{primaryKey: {..}}` or `{primary: {..}}`).
    pub fn remove(&self, table: &str, record_ref: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        if record_ref.is_object() && RecordRef::from_value(&record_ref).is_none() {
            return Err(SyncError::InvalidArgument(
                "record reference needs an id, key, recordKey or primary key".to_string(),
            ));
        }
        self.publish(Action::Delete, table, record_ref, meta)
    }

    /// Update a row. On version-controlled tables the record must carry a
    /// numeric `version`.
    pub fn update(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        if self.is_version_controlled(table) && !record.get("version").is_some_and(Value::is_number) {
            return Err(SyncError::MissingVersion {
                table: table.to_string(),
            });
        }
        self.publish(Action::Update, table, record, meta)
    }

    /// Publish any action. `record` must be an object.
    ///
    /// Must be called within a Tokio runtime; delivery and the ack timeout
    /// run as tasks.
    pub fn publish(
        &self,
        action: Action,
        table: &str,
        record: Value,
        meta: Option<Map<String, Value>>,
    ) -> Result<AckFuture> {
        if table.trim().is_empty() {
            return Err(SyncError::InvalidArgument("table name is required".to_string()));
        }
        if !record.is_object() {
            let what = if action.is_delete() { "record reference" } else { "record" };
            return Err(SyncError::InvalidArgument(format!("{what} object is required")));
        }

        let request_id = Uuid::new_v4().to_string();
        let mut meta = meta.unwrap_or_default();
        meta.insert("requestId".to_string(), Value::String(request_id.clone()));

        let message = ClientMessage::Publish(PublishRequest {
            branch_id: self.branch_id.to_string(),
            module_id: self.module_id.to_string(),
            table: table.to_string(),
            action,
            record,
            meta,
            include_record: true,
            request_id: request_id.clone(),
        });

        let ack = self.correlator.register(&request_id);
        debug!(request_id = %request_id, table = %table, "Mutation submitted");

        let outbox = self.outbox.clone();
        let wait = self.send_wait;
        tokio::spawn(async move {
            outbox.deliver(&message, wait).await;
        });

        Ok(ack)
    }

    pub fn is_version_controlled(&self, table: &str) -> bool {
        self.version_controlled.contains(table)
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }
}

impl std::fmt::Debug for MutationPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationPublisher")
            .field("branch_id", &self.branch_id)
            .field("module_id", &self.module_id)
            .field("version_controlled", &self.version_controlled)
            .finish()
    }
}
