//! Structured event model shared by the host pipeline and the sandbox.
//!
//! An event carries a fixed header (uuid, timestamp, type, logger, severity,
//! payload, env_version, pid, hostname) plus an ordered, heterogeneous field
//! list. Field names need not be unique; duplicates are distinct entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity assigned to events that do not carry one on the wire.
pub const DEFAULT_SEVERITY: i32 = 7;

/// Typed value list backing one field entry. Arrays are uniform-typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Str(Vec<String>),
    Bytes(Vec<Vec<u8>>),
    Int(Vec<i64>),
    Double(Vec<f64>),
    Bool(Vec<bool>),
}

impl FieldValue {
    /// Wire enum for the value type (0 string, 1 bytes, 2 integer,
    /// 3 double, 4 boolean).
    pub fn type_tag(&self) -> u64 {
        match self {
            FieldValue::Str(_) => 0,
            FieldValue::Bytes(_) => 1,
            FieldValue::Int(_) => 2,
            FieldValue::Double(_) => 3,
            FieldValue::Bool(_) => 4,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FieldValue::Str(v) => v.len(),
            FieldValue::Bytes(v) => v.len(),
            FieldValue::Int(v) => v.len(),
            FieldValue::Double(v) => v.len(),
            FieldValue::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(vec![v])
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(vec![v.to_string()])
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(vec![v])
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(vec![v])
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(vec![v])
    }
}

/// One named field entry: name, optional representation hint, typed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub representation: String,
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            representation: String::new(),
            value,
        }
    }
}

/// A structured pipeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uuid: Uuid,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub event_type: String,
    pub logger: String,
    pub severity: i32,
    pub payload: String,
    pub env_version: String,
    pub pid: i32,
    pub hostname: String,
    pub fields: Vec<Field>,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            timestamp: 0,
            event_type: String::new(),
            logger: String::new(),
            severity: DEFAULT_SEVERITY,
            payload: String::new(),
            env_version: String::new(),
            pid: 0,
            hostname: String::new(),
            fields: Vec::new(),
        }
    }
}

impl Event {
    /// Build a fresh event with a type-4 uuid, the current timestamp, and
    /// the local hostname/pid filled in.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            timestamp: now_ns(),
            event_type: event_type.into(),
            hostname: local_hostname(),
            pid: std::process::id() as i32,
            ..Default::default()
        }
    }

    /// Append a field entry in insertion order.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        value: FieldValue,
        representation: impl Into<String>,
    ) {
        self.fields.push(Field {
            name: name.into(),
            representation: representation.into(),
            value,
        });
    }

    /// The `idx`-th field entry named `name` (duplicates are distinct).
    pub fn field(&self, name: &str, idx: usize) -> Option<&Field> {
        self.fields.iter().filter(|f| f.name == name).nth(idx)
    }

    pub fn field_mut(&mut self, name: &str, idx: usize) -> Option<&mut Field> {
        self.fields.iter_mut().filter(|f| f.name == name).nth(idx)
    }

    /// Remove the `idx`-th field entry named `name`. Returns false when
    /// no such entry exists.
    pub fn remove_field(&mut self, name: &str, idx: usize) -> bool {
        let mut seen = 0;
        for (pos, f) in self.fields.iter().enumerate() {
            if f.name == name {
                if seen == idx {
                    self.fields.remove(pos);
                    return true;
                }
                seen += 1;
            }
        }
        false
    }
}

/// Current wall clock in nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_has_v4_uuid_and_type() {
        let ev = Event::new("test.input");
        assert_eq!(ev.uuid.get_version_num(), 4);
        assert_eq!(ev.event_type, "test.input");
        assert_eq!(ev.severity, DEFAULT_SEVERITY);
        assert!(ev.timestamp > 0);
    }

    #[test]
    fn duplicate_field_names_are_distinct_entries() {
        let mut ev = Event::default();
        ev.add_field("k", FieldValue::from("a"), "");
        ev.add_field("k", FieldValue::from("b"), "");
        assert_eq!(
            ev.field("k", 0).map(|f| &f.value),
            Some(&FieldValue::Str(vec!["a".into()]))
        );
        assert_eq!(
            ev.field("k", 1).map(|f| &f.value),
            Some(&FieldValue::Str(vec!["b".into()]))
        );
        assert!(ev.field("k", 2).is_none());

        assert!(ev.remove_field("k", 1));
        assert!(ev.field("k", 1).is_none());
        assert!(!ev.remove_field("k", 1));
    }
}
