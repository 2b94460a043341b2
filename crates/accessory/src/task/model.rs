//! Task entity

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::tag::{Tag, TagType, TagValue};
use crate::error::{Error, Errors};
use crate::storage::{Document, Record, StoreError, Value, KEY_FIELD};

/// Stored field names of the `tasks` collection
pub mod fields {
    pub const KEY: &str = super::KEY_FIELD;
    pub const NAMESPACE: &str = "namespace";
    pub const PRIORITY: &str = "priority";
    pub const CREATED_AT: &str = "created_at";
    pub const SCHEDULED_AT: &str = "scheduled_at";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const CLAIMED_AT: &str = "claimed_at";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const LAST_ERROR: &str = "last_error";
    pub const TAGS: &str = "tags";
}

/// One unit of schedulable work
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    key: Option<Uuid>,
    namespace: String,
    priority: i64,
    created_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    retry_count: u32,
    last_error: Option<String>,
    tags: BTreeMap<String, String>,
}

impl Task {
    /// Build an unsaved task in `namespace` and apply `tags`
    ///
    /// Every tag is applied even after a failure, so the returned error lists
    /// every invalid tag at once.
    pub fn new(
        namespace: impl Into<String>,
        tags: impl IntoIterator<Item = Tag>,
    ) -> Result<Self, Error> {
        let mut task = Self {
            key: None,
            namespace: namespace.into(),
            priority: 0,
            created_at: Utc::now(),
            scheduled_at: None,
            expires_at: None,
            claimed_at: None,
            retry_count: 0,
            last_error: None,
            tags: BTreeMap::new(),
        };

        let mut errors = Errors::new();
        for tag in tags {
            if let Err(e) = task.set(&tag.kind, tag.value) {
                errors.push(e);
            }
        }
        errors.into_result()?;
        Ok(task)
    }

    /// Storage key, once persisted
    pub fn key(&self) -> Option<Uuid> {
        self.key
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// When the task was claimed, while a worker holds it
    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Value of a custom tag
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Time since creation, truncated to milliseconds
    pub fn age(&self) -> Duration {
        let elapsed = (Utc::now() - self.created_at).to_std().unwrap_or_default();
        Duration::from_millis(elapsed.as_millis() as u64)
    }

    /// Read any tag
    pub fn get(&self, kind: &TagType) -> Option<TagValue> {
        match kind {
            TagType::Priority => Some(TagValue::Int(self.priority)),
            TagType::CreatedAt => Some(TagValue::Time(self.created_at)),
            TagType::ScheduledAt => self.scheduled_at.map(TagValue::Time),
            TagType::ExpiresAt => self.expires_at.map(TagValue::Time),
            TagType::Age => Some(TagValue::Duration(self.age())),
            TagType::RetryCount => Some(TagValue::Int(self.retry_count as i64)),
            TagType::LastError => self.last_error.clone().map(TagValue::Text),
            TagType::Custom(name) => self.tags.get(name).cloned().map(TagValue::Text),
        }
    }

    /// Every set tag: non-default typed fields first, then custom tags
    pub fn tags(&self) -> Vec<Tag> {
        let mut tags = Vec::new();
        if self.priority != 0 {
            tags.push(Tag::priority(self.priority));
        }
        tags.push(Tag::new(TagType::Age, self.age()));
        if let Some(at) = self.scheduled_at {
            tags.push(Tag::scheduled_at(at));
        }
        if let Some(at) = self.expires_at {
            tags.push(Tag::expires_at(at));
        }
        if self.retry_count != 0 {
            tags.push(Tag::new(TagType::RetryCount, self.retry_count as i64));
        }
        if let Some(err) = &self.last_error {
            tags.push(Tag::last_error(err.clone()));
        }
        for (name, value) in &self.tags {
            tags.push(Tag::custom(name.clone(), value.clone()));
        }
        tags
    }

    /// Write a tag. Read-only tags and mistyped values are rejected.
    pub(crate) fn set(&mut self, kind: &TagType, value: Option<TagValue>) -> Result<(), Error> {
        match (kind, value) {
            (TagType::Priority, Some(TagValue::Int(v))) => self.priority = v,
            (TagType::Priority, _) => {
                return Err(Error::bad_parameter("priority must be an int value"))
            }
            (TagType::ScheduledAt, None) => self.scheduled_at = None,
            (TagType::ScheduledAt, Some(TagValue::Time(at))) => self.scheduled_at = Some(at),
            (TagType::ScheduledAt, Some(_)) => {
                return Err(Error::bad_parameter("scheduled_at must be a time value"))
            }
            (TagType::ExpiresAt, None) => self.expires_at = None,
            (TagType::ExpiresAt, Some(TagValue::Time(at))) => self.expires_at = Some(at),
            (TagType::ExpiresAt, Some(_)) => {
                return Err(Error::bad_parameter("expires_at must be a time value"))
            }
            (TagType::LastError, None) => self.last_error = None,
            (TagType::LastError, Some(TagValue::Text(msg))) => self.last_error = Some(msg),
            (TagType::LastError, Some(_)) => {
                return Err(Error::bad_parameter("last_error must be a text value"))
            }
            (TagType::RetryCount | TagType::CreatedAt | TagType::Age, _) => {
                return Err(Error::bad_parameter(format!(
                    "cannot set read-only tag {kind}"
                )))
            }
            (TagType::Custom(name), value) => {
                // Reserved names keep their typed rules
                let reserved = TagType::from(name.as_str());
                if !matches!(reserved, TagType::Custom(_)) {
                    return self.set(&reserved, value);
                }
                if !TagType::is_valid_custom_name(name) {
                    return Err(Error::bad_parameter(format!("invalid tag name {name:?}")));
                }
                match value {
                    None => {
                        self.tags.remove(name);
                    }
                    Some(TagValue::Text(text)) => {
                        self.tags.insert(name.clone(), text);
                    }
                    Some(other) => {
                        return Err(Error::bad_parameter(format!(
                            "tag {name:?} must be a text value, got {}",
                            other.kind()
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn set_key(&mut self, key: Uuid) {
        self.key = Some(key);
    }

    pub(crate) fn mark_claimed(&mut self, at: DateTime<Utc>) {
        self.claimed_at = Some(at);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<task")?;
        if let Some(key) = self.key {
            write!(f, " key={key}")?;
        }
        if !self.namespace.is_empty() {
            write!(f, " namespace={:?}", self.namespace)?;
        }
        for tag in self.tags() {
            write!(f, " {tag}")?;
        }
        f.write_str(">")
    }
}

impl Document for Task {
    const COLLECTION: &'static str = "tasks";

    fn to_record(&self) -> Record {
        Record::new()
            .with(fields::KEY, self.key)
            .with(fields::NAMESPACE, self.namespace.as_str())
            .with(fields::PRIORITY, self.priority)
            .with(fields::CREATED_AT, self.created_at)
            .with(fields::SCHEDULED_AT, self.scheduled_at)
            .with(fields::EXPIRES_AT, self.expires_at)
            .with(fields::CLAIMED_AT, self.claimed_at)
            .with(fields::RETRY_COUNT, self.retry_count)
            .with(fields::LAST_ERROR, self.last_error.clone())
            .with(fields::TAGS, self.tags.clone())
    }

    fn from_record(record: Record) -> Result<Self, StoreError> {
        let retry_count = record.require_int(fields::RETRY_COUNT)?;
        let retry_count = u32::try_from(retry_count).map_err(|_| {
            StoreError::Serialization(format!("retry_count out of range: {retry_count}"))
        })?;
        let tags = match record.get(fields::TAGS) {
            Value::Null => BTreeMap::new(),
            Value::Map(map) => map.clone(),
            _ => {
                return Err(StoreError::Serialization(
                    "field \"tags\": expected map value".into(),
                ))
            }
        };

        Ok(Self {
            key: record.key(),
            namespace: record.require_text(fields::NAMESPACE)?,
            priority: record.require_int(fields::PRIORITY)?,
            created_at: record.require_time(fields::CREATED_AT)?,
            scheduled_at: record.optional_time(fields::SCHEDULED_AT)?,
            expires_at: record.optional_time(fields::EXPIRES_AT)?,
            claimed_at: record.optional_time(fields::CLAIMED_AT)?,
            retry_count,
            last_error: record.optional_text(fields::LAST_ERROR)?,
            tags,
        })
    }
}
