//! Session projection: per-module, per-table row state.
//!
//! [`StateProjector`] applies frames; [`Projection`] is the shared handle a
//! session and its readers hold. The handle releases the projector lock
//! before publishing `state:change`, so subscribers may read the projection
//! from inside their handler.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::bus::{Notification, StatusBus};
use crate::config::ProjectionConfig;
use crate::protocol::{EventEnvelope, SnapshotEnvelope};

pub mod module;
pub mod projector;

pub use module::{LastEvent, ModuleState, Tables};
pub use projector::{EventOutcome, StateProjector};

/// Shared handle over one session's projector.
#[derive(Clone)]
pub struct Projection {
    projector: Arc<Mutex<StateProjector>>,
    bus: Arc<StatusBus>,
    default_module: Arc<str>,
}

impl Projection {
    pub fn new(config: &ProjectionConfig, default_module: &str, bus: Arc<StatusBus>) -> Self {
        Self {
            projector: Arc::new(Mutex::new(StateProjector::new(config))),
            bus,
            default_module: Arc::from(default_module),
        }
    }

    /// Module used when a read or event names none.
    pub fn default_module(&self) -> &str {
        &self.default_module
    }

    pub fn apply_snapshot(&self, envelope: &SnapshotEnvelope) {
        let change = self.lock().apply_snapshot(envelope);
        self.bus.publish(Notification::StateChange(change));
    }

    /// Apply an event. Returns false when the version policy dropped it.
    pub fn apply_event(&self, event: &EventEnvelope) -> bool {
        let outcome = self.lock().apply_event(event, &self.default_module);
        match outcome {
            EventOutcome::Applied(change) => {
                self.bus.publish(Notification::StateChange(change));
                true
            }
            EventOutcome::Ignored => false,
        }
    }

    pub fn hydrate(&self, module_id: &str, payload: &Value) {
        let change = self.lock().hydrate(module_id, payload);
        self.bus.publish(Notification::StateChange(change));
    }

    /// Copy of every module.
    pub fn modules(&self) -> BTreeMap<String, ModuleState> {
        self.lock().modules().clone()
    }

    /// `meta` of the most recent snapshot.
    pub fn snapshot_meta(&self) -> Option<Value> {
        self.lock().snapshot_meta().cloned()
    }

    pub(crate) fn with_projector<R>(&self, read: impl FnOnce(&StateProjector) -> R) -> R {
        read(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, StateProjector> {
        self.projector.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("default_module", &self.default_module)
            .field("modules", &self.lock().modules().len())
            .finish()
    }
}
