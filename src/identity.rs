//! Record identity resolution.
//!
//! Rows are opaque JSON objects. A row is located through a [`RecordRef`], an
//! explicit identity descriptor decoded from the wire shape
//! `{id} | {key} | {recordKey} | {primaryKey: {..}} | {primary: {..}}`.
//!
//! Precedence when decoding (first satisfied field wins):
//! 1. `id`
//! 2. `key`
//! 3. `recordKey`
//! 4. `primaryKey` (non-empty object)
//! 5. `primary` (non-empty object)

use serde_json::{Map, Value};

/// A structured row.
pub type Record = Map<String, Value>;

/// Identity descriptor used to locate a row without structural equality.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordRef {
    /// Row whose `id` equals the value.
    ById(Value),
    /// Row whose `key` or `recordKey` equals the value.
    ByKey(Value),
    /// Row whose fields all equal the given field set (composite key).
    ByPrimaryFields(Map<String, Value>),
}

impl RecordRef {
    /// Decode a wire identity descriptor. Returns `None` when no identity
    /// field is present.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if let Some(id) = present(object, "id") {
            return Some(RecordRef::ById(id.clone()));
        }
        if let Some(key) = present(object, "key").or_else(|| present(object, "recordKey")) {
            return Some(RecordRef::ByKey(key.clone()));
        }
        ["primaryKey", "primary"]
            .iter()
            .filter_map(|field| object.get(*field).and_then(Value::as_object))
            .find(|fields| !fields.is_empty())
            .map(|fields| RecordRef::ByPrimaryFields(fields.clone()))
    }

    /// Identity carried directly on a payload record (bare `id`, `key` or
    /// `recordKey`).
    pub fn from_record(record: &Record) -> Option<Self> {
        if let Some(id) = present(record, "id") {
            return Some(RecordRef::ById(id.clone()));
        }
        present(record, "key")
            .or_else(|| present(record, "recordKey"))
            .map(|key| RecordRef::ByKey(key.clone()))
    }

    /// Whether `row` carries this identity.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(row) = row.as_object() else {
            return false;
        };
        match self {
            RecordRef::ById(id) => row.get("id").is_some_and(|v| identifiers_equal(v, id)),
            RecordRef::ByKey(key) => ["key", "recordKey"]
                .iter()
                .any(|field| row.get(*field).is_some_and(|v| identifiers_equal(v, key))),
            RecordRef::ByPrimaryFields(fields) => fields
                .iter()
                .all(|(field, expected)| row.get(field).is_some_and(|v| v == expected)),
        }
    }

    /// Copy identity fields onto `record` where it lacks them.
    pub fn stamp_onto(&self, record: &mut Record) {
        match self {
            RecordRef::ById(id) => {
                if present(record, "id").is_none() {
                    record.insert("id".to_string(), id.clone());
                }
            }
            RecordRef::ByKey(key) => {
                if present(record, "key").is_none() && present(record, "recordKey").is_none() {
                    record.insert("key".to_string(), key.clone());
                }
            }
            RecordRef::ByPrimaryFields(fields) => {
                for (field, value) in fields {
                    if present(record, field).is_none() {
                        record.insert(field.clone(), value.clone());
                    }
                }
            }
        }
    }
}

/// Index of the first row in `rows` carrying `identity`.
pub fn resolve_index(rows: &[Value], identity: &RecordRef) -> Option<usize> {
    rows.iter().position(|row| identity.matches(row))
}

/// Whether `row` has an `id`, `key` or `recordKey` equal to `identifier`.
pub fn row_has_identifier(row: &Value, identifier: &Value) -> bool {
    RecordRef::ById(identifier.clone()).matches(row)
        || RecordRef::ByKey(identifier.clone()).matches(row)
}

/// Identifier comparison. Strings and numbers compare by their textual form so
/// `"7"` and `7` name the same row; `null` never matches.
pub fn identifiers_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            *a == b.to_string()
        }
        _ => left == right,
    }
}

fn present<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    object.get(field).filter(|value| !value.is_null())
}
