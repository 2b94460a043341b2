//! Storage-agnostic records
//!
//! A [`Record`] is an ordered map of field name to [`Value`]. Types that are
//! persisted implement [`Document`] to map themselves onto a collection.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::StoreError;

/// Name of the storage-assigned key field in every collection
pub const KEY_FIELD: &str = "key";

/// A single field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
    Uuid(Uuid),
    Map(BTreeMap<String, String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Compare two values of the same kind. Values of different kinds, and
    /// maps, are not ordered. Null orders after everything else.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Greater),
            (_, Self::Null) => Some(Ordering::Less),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Time(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::Map(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Time(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(v: BTreeMap<String, String>) -> Self {
        Self::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A persisted record: field name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Field value; a missing field reads as `Value::Null`
    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.0.get(field).unwrap_or(&NULL)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn key(&self) -> Option<Uuid> {
        self.get(KEY_FIELD).as_uuid()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    // Typed accessors used by Document implementations

    pub fn require_text(&self, field: &str) -> Result<String, StoreError> {
        self.get(field)
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| missing(field, "text"))
    }

    pub fn require_int(&self, field: &str) -> Result<i64, StoreError> {
        self.get(field).as_int().ok_or_else(|| missing(field, "int"))
    }

    pub fn require_time(&self, field: &str) -> Result<DateTime<Utc>, StoreError> {
        self.get(field).as_time().ok_or_else(|| missing(field, "time"))
    }

    pub fn optional_time(&self, field: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.get(field) {
            Value::Null => Ok(None),
            Value::Time(t) => Ok(Some(*t)),
            _ => Err(missing(field, "time")),
        }
    }

    pub fn optional_text(&self, field: &str) -> Result<Option<String>, StoreError> {
        match self.get(field) {
            Value::Null => Ok(None),
            Value::Text(t) => Ok(Some(t.clone())),
            _ => Err(missing(field, "text")),
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

fn missing(field: &str, kind: &str) -> StoreError {
    StoreError::Serialization(format!("field {field:?}: expected {kind} value"))
}

/// Mapping between a Rust type and a stored record
pub trait Document: Sized + Send {
    /// Collection (table) name
    const COLLECTION: &'static str;

    /// Convert to a record. The key field is `Value::Null` until the value has
    /// been persisted.
    fn to_record(&self) -> Record;

    /// Rebuild from a stored record
    fn from_record(record: Record) -> Result<Self, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_reads_null() {
        let record = Record::new().with("a", 1i64);
        assert_eq!(record.get("a"), &Value::Int(1));
        assert!(record.get("b").is_null());
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_compare_orders_null_last() {
        assert_eq!(Value::Int(1).compare(&Value::Int(2)), Some(Ordering::Less));
        assert_eq!(Value::Null.compare(&Value::Int(2)), Some(Ordering::Greater));
        assert_eq!(Value::Int(1).compare(&Value::Text("1".into())), None);
    }

    #[test]
    fn test_require_typed_fields() {
        let now = Utc::now();
        let record = Record::new()
            .with("name", "task")
            .with("at", now)
            .with("gone", Value::Null);

        assert_eq!(record.require_text("name").unwrap(), "task");
        assert_eq!(record.require_time("at").unwrap(), now);
        assert_eq!(record.optional_time("gone").unwrap(), None);
        assert!(matches!(
            record.require_int("name"),
            Err(StoreError::Serialization(_))
        ));
    }
}
