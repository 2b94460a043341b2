//! Typed task tags
//!
//! Reserved tag names map onto the task's typed fields; every other name is a
//! free-form string tag stored in the task's tag map.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

static CUSTOM_TAG_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]+$").expect("static pattern compiles"));

/// Tag identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagType {
    /// Higher is served first (integer)
    Priority,
    /// Construction time (read-only)
    CreatedAt,
    /// Earliest claim time
    ScheduledAt,
    /// Hard deadline after which the task is not retried
    ExpiresAt,
    /// Time since creation (derived, read-only)
    Age,
    /// Failed releases so far (read-only)
    RetryCount,
    /// Description of the last failure
    LastError,
    /// Free-form string tag
    Custom(String),
}

impl TagType {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Priority => "priority",
            Self::CreatedAt => "created_at",
            Self::ScheduledAt => "scheduled_at",
            Self::ExpiresAt => "expires_at",
            Self::Age => "age",
            Self::RetryCount => "retry_count",
            Self::LastError => "last_error",
            Self::Custom(name) => name,
        }
    }

    /// Maintained by the queue; callers can read but never set these
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::CreatedAt | Self::Age | Self::RetryCount)
    }

    /// Whether a custom tag name is acceptable: a letter followed by at
    /// least one letter, digit or underscore
    pub fn is_valid_custom_name(name: &str) -> bool {
        CUSTOM_TAG_NAME.is_match(name)
    }
}

impl From<&str> for TagType {
    fn from(name: &str) -> Self {
        match name {
            "priority" => Self::Priority,
            "created_at" => Self::CreatedAt,
            "scheduled_at" => Self::ScheduledAt,
            "expires_at" => Self::ExpiresAt,
            "age" => Self::Age,
            "retry_count" => Self::RetryCount,
            "last_error" => Self::LastError,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tag value
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Int(i64),
    Time(DateTime<Utc>),
    Duration(Duration),
    Text(String),
}

impl TagValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Time(_) => "time",
            Self::Duration(_) => "duration",
            Self::Text(_) => "text",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Duration(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{:?}", v.to_rfc3339()),
            Self::Duration(v) => write!(f, "{v:?}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for TagValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<DateTime<Utc>> for TagValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Time(v)
    }
}

impl From<Duration> for TagValue {
    fn from(v: Duration) -> Self {
        Self::Duration(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// A tag type paired with a value; `None` clears the tag
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub kind: TagType,
    pub value: Option<TagValue>,
}

impl Tag {
    pub fn new(kind: TagType, value: impl Into<TagValue>) -> Self {
        Self {
            kind,
            value: Some(value.into()),
        }
    }

    /// A tag that clears `kind`
    pub fn clear(kind: TagType) -> Self {
        Self { kind, value: None }
    }

    pub fn priority(priority: i64) -> Self {
        Self::new(TagType::Priority, priority)
    }

    pub fn scheduled_at(at: DateTime<Utc>) -> Self {
        Self::new(TagType::ScheduledAt, at)
    }

    pub fn expires_at(at: DateTime<Utc>) -> Self {
        Self::new(TagType::ExpiresAt, at)
    }

    pub fn last_error(message: impl Into<String>) -> Self {
        Self::new(TagType::LastError, message.into())
    }

    pub fn custom(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(TagType::Custom(name.into()), value.into())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.kind, value),
            None => write!(f, "{}=nil", self.kind),
        }
    }
}
