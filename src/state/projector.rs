//! Applies snapshot and event frames to the module/table projection.
//!
//! The projector is a plain state machine: it owns its module map, copies
//! every payload it stores, and reports what changed. Publishing is left to
//! the [`Projection`](super::Projection) handle.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::module::{LastEvent, ModuleState};
use crate::bus::StateChange;
use crate::config::{ProjectionConfig, VersionPolicy};
use crate::identity::resolve_index;
use crate::protocol::{EventEnvelope, SnapshotEnvelope};

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied(StateChange),
    /// Dropped by the version policy.
    Ignored,
}

/// In-memory module/table projection.
#[derive(Debug, Default)]
pub struct StateProjector {
    modules: BTreeMap<String, ModuleState>,
    snapshot_meta: Option<Value>,
    policy: VersionPolicy,
    stamp_identity: bool,
}

impl StateProjector {
    pub fn new(config: &ProjectionConfig) -> Self {
        Self {
            modules: BTreeMap::new(),
            snapshot_meta: None,
            policy: config.version_policy,
            stamp_identity: config.stamp_identity,
        }
    }

    /// Replace every module named in the envelope. Modules the envelope does
    /// not name are kept.
    pub fn apply_snapshot(&mut self, envelope: &SnapshotEnvelope) -> StateChange {
        for (module_id, payload) in &envelope.modules {
            self.modules
                .insert(module_id.clone(), ModuleState::from_payload(module_id, payload));
        }
        self.snapshot_meta = envelope.meta.clone();
        debug!(modules = envelope.modules.len(), "Snapshot applied");
        StateChange::snapshot()
    }

    /// Apply one incremental change. Events without `moduleId` target
    /// `default_module`.
    pub fn apply_event(&mut self, event: &EventEnvelope, default_module: &str) -> EventOutcome {
        let module_id = event.module_id.as_deref().unwrap_or(default_module);

        if self.is_stale(module_id, event.version) {
            debug!(
                module_id = %module_id,
                table = %event.table,
                version = ?event.version,
                "Stale event ignored"
            );
            return EventOutcome::Ignored;
        }

        let module = self
            .modules
            .entry(module_id.to_string())
            .or_insert_with(|| ModuleState::new(module_id));
        let rows = module.tables.entry(event.table.clone()).or_default();

        let identity = event.identity();
        let index = identity.as_ref().and_then(|id| resolve_index(rows, id));

        if event.action.is_delete() {
            if let Some(index) = index {
                rows.remove(index);
            }
        } else if let Some(payload) = event.payload() {
            match index {
                Some(index) if event.action.is_merge() => match rows[index].as_object_mut() {
                    Some(row) => row.extend(payload.clone()),
                    None => rows[index] = Value::Object(payload.clone()),
                },
                Some(index) => rows[index] = Value::Object(payload.clone()),
                None => {
                    let mut record = payload.clone();
                    if self.stamp_identity {
                        if let Some(identity) = &identity {
                            identity.stamp_onto(&mut record);
                        }
                    }
                    rows.push(Value::Object(record));
                }
            }
        }

        if let Some(version) = event.version {
            module.version = Some(version);
        }
        module.last_event = Some(LastEvent {
            event_id: event.event_id.clone(),
            action: event.action.clone(),
            table: event.table.clone(),
            sequence: event.sequence,
            received_at: Utc::now(),
        });

        EventOutcome::Applied(StateChange::event(module_id, event.table.clone()))
    }

    /// Seed a module from a cached payload.
    pub fn hydrate(&mut self, module_id: &str, payload: &Value) -> StateChange {
        self.modules
            .insert(module_id.to_string(), ModuleState::from_payload(module_id, payload));
        StateChange::cache(module_id)
    }

    pub fn module(&self, module_id: &str) -> Option<&ModuleState> {
        self.modules.get(module_id)
    }

    pub fn modules(&self) -> &BTreeMap<String, ModuleState> {
        &self.modules
    }

    /// `meta` of the most recent snapshot.
    pub fn snapshot_meta(&self) -> Option<&Value> {
        self.snapshot_meta.as_ref()
    }

    fn is_stale(&self, module_id: &str, version: Option<i64>) -> bool {
        if self.policy != VersionPolicy::Monotonic {
            return false;
        }
        let current = self.modules.get(module_id).and_then(|m| m.version);
        matches!((version, current), (Some(incoming), Some(current)) if incoming <= current)
    }
}
