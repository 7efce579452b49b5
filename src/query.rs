//! Synchronous reads over a session's projection.
//!
//! Every read returns owned copies; callers can mutate results freely without
//! affecting the projection. Reads never touch the network. A `None` module
//! means the projection's default module.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Result, SyncError};
use crate::identity::row_has_identifier;
use crate::state::{ModuleState, Projection, Tables};

type RowPredicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Row filter for [`Projection::query`].
#[derive(Default)]
pub enum Filter {
    /// Every row.
    #[default]
    All,
    /// Rows for which the predicate holds.
    Predicate(RowPredicate),
    /// Rows whose fields equal every given field.
    Fields(Map<String, Value>),
}

impl Filter {
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Filter::Predicate(Box::new(predicate))
    }

    /// Decode a JSON filter: `null` matches all rows and an object matches by
    /// field equality. Any other shape is rejected.
    pub fn from_value(filter: &Value) -> Result<Self> {
        match filter {
            Value::Null => Ok(Filter::All),
            Value::Object(fields) => Ok(Filter::Fields(fields.clone())),
            other => Err(SyncError::InvalidArgument(format!(
                "filter must be omitted, a predicate or a field object, got {}",
                json_type(other)
            ))),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Predicate(predicate) => predicate(row),
            Filter::Fields(fields) => fields
                .iter()
                .all(|(field, expected)| row.get(field) == Some(expected)),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => f.write_str("All"),
            Filter::Predicate(_) => f.write_str("Predicate(..)"),
            Filter::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
        }
    }
}

impl Projection {
    fn module_or_default<'a>(&'a self, module_id: Option<&'a str>) -> &'a str {
        module_id.unwrap_or_else(|| self.default_module())
    }

    /// Copy of one module's full state.
    pub fn snapshot(&self, module_id: Option<&str>) -> Option<ModuleState> {
        let module_id = self.module_or_default(module_id);
        self.with_projector(|projector| projector.module(module_id).cloned())
    }

    /// Copy of one module's table map; empty when the module is unseen.
    pub fn tables(&self, module_id: Option<&str>) -> Tables {
        let module_id = self.module_or_default(module_id);
        self.with_projector(|projector| {
            projector
                .module(module_id)
                .map(|module| module.tables.clone())
                .unwrap_or_default()
        })
    }

    /// Copy of one table's rows; empty when unseen.
    pub fn list_table(&self, table: &str, module_id: Option<&str>) -> Vec<Value> {
        let module_id = self.module_or_default(module_id);
        self.with_projector(|projector| {
            projector
                .module(module_id)
                .map(|module| module.rows(table).to_vec())
                .unwrap_or_default()
        })
    }

    /// First row whose `id`, `key` or `recordKey` equals `id`.
    pub fn read(&self, table: &str, id: &Value, module_id: Option<&str>) -> Result<Option<Value>> {
        require_table(table)?;
        let missing_id = match id {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if missing_id {
            return Err(SyncError::InvalidArgument("record id is required".to_string()));
        }

        let module_id = self.module_or_default(module_id);
        Ok(self.with_projector(|projector| {
            projector.module(module_id).and_then(|module| {
                module
                    .rows(table)
                    .iter()
                    .find(|row| row_has_identifier(row, id))
                    .cloned()
            })
        }))
    }

    /// Rows of `table` accepted by `filter`.
    pub fn query(&self, table: &str, filter: &Filter, module_id: Option<&str>) -> Result<Vec<Value>> {
        require_table(table)?;
        // Filter outside the lock; predicates may read the projection.
        let mut rows = self.list_table(table, module_id);
        rows.retain(|row| filter.matches(row));
        Ok(rows)
    }
}

fn require_table(table: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(SyncError::InvalidArgument("table name is required".to_string()));
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
