//! Per-module projection state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::protocol::{numeric_i64, Action};

/// Table name to ordered rows.
pub type Tables = BTreeMap<String, Vec<Value>>;

/// Bookkeeping for the most recently applied event.
#[derive(Debug, Clone, PartialEq)]
pub struct LastEvent {
    pub event_id: Option<String>,
    pub action: Action,
    pub table: String,
    pub sequence: Option<u64>,
    pub received_at: DateTime<Utc>,
}

/// How `tables` looked in the payload a module was built from.
#[derive(Debug, Clone, PartialEq, Default)]
enum TablesField {
    #[default]
    Object,
    Missing,
    /// Not an object; kept verbatim.
    Other(Value),
}

/// Projection of one module: versioned collection of tables.
///
/// A module built from a payload converts back to an equal payload: the
/// received `version` value and any `tables` entries that are not row arrays
/// are kept as they arrived.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModuleState {
    pub module_id: String,
    pub version: Option<i64>,
    pub tables: Tables,
    /// Payload fields outside `version`/`tables`, kept verbatim.
    pub extra: Map<String, Value>,
    pub last_event: Option<LastEvent>,
    version_wire: Option<Value>,
    foreign_tables: Map<String, Value>,
    tables_field: TablesField,
}

impl ModuleState {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            ..Self::default()
        }
    }

    /// Build from a ModuleState-shaped payload (`{version, tables, ..}`).
    ///
    /// `version` is parsed leniently (integers, integral floats, numeric
    /// strings). A payload that is not an object yields an empty module.
    pub fn from_payload(module_id: &str, payload: &Value) -> Self {
        let mut state = Self::new(module_id);
        let Some(object) = payload.as_object() else {
            warn!(module_id = %module_id, "Module payload is not an object");
            return state;
        };

        state.tables_field = TablesField::Missing;
        for (field, value) in object {
            match field.as_str() {
                "version" => {
                    state.version = numeric_i64(value);
                    state.version_wire = Some(value.clone());
                }
                "tables" => {
                    let Some(tables) = value.as_object() else {
                        warn!(module_id = %module_id, "Module `tables` is not an object");
                        state.tables_field = TablesField::Other(value.clone());
                        continue;
                    };
                    state.tables_field = TablesField::Object;
                    for (table, rows) in tables {
                        match rows.as_array() {
                            Some(rows) => {
                                state.tables.insert(table.clone(), rows.clone());
                            }
                            None => {
                                warn!(module_id = %module_id, table = %table, "Table rows are not an array");
                                state.foreign_tables.insert(table.clone(), rows.clone());
                            }
                        }
                    }
                }
                _ => {
                    state.extra.insert(field.clone(), value.clone());
                }
            }
        }
        state
    }

    /// ModuleState-shaped payload, as persisted to the cache.
    pub fn to_payload(&self) -> Value {
        let mut payload = self.extra.clone();

        // The received value stands while it still parses to the current version.
        match &self.version_wire {
            Some(wire) if numeric_i64(wire) == self.version => {
                payload.insert("version".to_string(), wire.clone());
            }
            _ => {
                if let Some(version) = self.version {
                    payload.insert("version".to_string(), Value::from(version));
                }
            }
        }

        let untouched = self.tables.is_empty() && self.foreign_tables.is_empty();
        match &self.tables_field {
            TablesField::Missing if untouched => {}
            TablesField::Other(wire) if untouched => {
                payload.insert("tables".to_string(), wire.clone());
            }
            _ => {
                let mut tables = self.foreign_tables.clone();
                for (table, rows) in &self.tables {
                    tables.insert(table.clone(), Value::Array(rows.clone()));
                }
                payload.insert("tables".to_string(), Value::Object(tables));
            }
        }
        Value::Object(payload)
    }

    /// Rows of `table`, empty when unseen.
    pub fn rows(&self, table: &str) -> &[Value] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }
}
