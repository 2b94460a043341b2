//! Filters and sort orders
//!
//! Adapters either evaluate these directly ([`Filter::matches`],
//! [`Sort::compare`]) or compile them to their own query language.

use std::cmp::Ordering;

use uuid::Uuid;

use super::record::{Record, Value, KEY_FIELD};

/// One predicate over a single field, or a disjunction of predicates
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    IsNull(String),
    NotNull(String),
    /// Matches when any nested condition matches
    Any(Vec<Condition>),
}

impl Condition {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Eq(field, value) => {
                let actual = record.get(field);
                if value.is_null() {
                    actual.is_null()
                } else {
                    actual == value
                }
            }
            Self::Ne(field, value) => {
                let actual = record.get(field);
                if value.is_null() {
                    !actual.is_null()
                } else {
                    !actual.is_null() && actual != value
                }
            }
            Self::Lt(field, value) => ordered(record.get(field), value, |o| o.is_lt()),
            Self::Lte(field, value) => ordered(record.get(field), value, |o| o.is_le()),
            Self::Gt(field, value) => ordered(record.get(field), value, |o| o.is_gt()),
            Self::Gte(field, value) => ordered(record.get(field), value, |o| o.is_ge()),
            Self::IsNull(field) => record.get(field).is_null(),
            Self::NotNull(field) => !record.get(field).is_null(),
            Self::Any(conditions) => conditions.iter().any(|c| c.matches(record)),
        }
    }

    /// Every field name referenced by this condition
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Eq(f, _)
            | Self::Ne(f, _)
            | Self::Lt(f, _)
            | Self::Lte(f, _)
            | Self::Gt(f, _)
            | Self::Gte(f, _)
            | Self::IsNull(f)
            | Self::NotNull(f) => vec![f.as_str()],
            Self::Any(conditions) => conditions.iter().flat_map(|c| c.fields()).collect(),
        }
    }
}

// Comparisons against null never match, same as SQL.
fn ordered(actual: &Value, expected: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    if actual.is_null() || expected.is_null() {
        return false;
    }
    actual.compare(expected).is_some_and(pred)
}

/// Conjunction of conditions. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single record by key
    pub fn key(key: Uuid) -> Self {
        Self::new().eq(KEY_FIELD, key)
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Condition::Eq(field.into(), value.into()))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Condition::Ne(field.into(), value.into()))
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Condition::Lt(field.into(), value.into()))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Condition::Lte(field.into(), value.into()))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Condition::Gt(field.into(), value.into()))
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Condition::Gte(field.into(), value.into()))
    }

    pub fn is_null(self, field: impl Into<String>) -> Self {
        self.with(Condition::IsNull(field.into()))
    }

    pub fn not_null(self, field: impl Into<String>) -> Self {
        self.with(Condition::NotNull(field.into()))
    }

    /// Add a disjunction of every condition in `alternatives`
    pub fn any(self, alternatives: Filter) -> Self {
        self.with(Condition::Any(alternatives.conditions))
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Ordered list of sort fields plus an optional row limit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sort {
    fields: Vec<(String, Direction)>,
    limit: Option<u64>,
}

impl Sort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), Direction::Asc));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), Direction::Desc));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn fields(&self) -> &[(String, Direction)] {
        &self.fields
    }

    pub fn max_rows(&self) -> Option<u64> {
        self.limit
    }

    /// Compare two records by the sort fields. Ties fall back to the record
    /// key so results are deterministic.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for (field, direction) in &self.fields {
            let ord = a
                .get(field)
                .compare(b.get(field))
                .unwrap_or(Ordering::Equal);
            let ord = match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.key().cmp(&b.key())
    }

    /// Sort and truncate `records` in place
    pub fn apply(&self, records: &mut Vec<Record>) {
        records.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            records.truncate(limit as usize);
        }
    }
}
