//! Audit event types
//!
//! `EventRecord` is the persisted shape of an event, one item in the table.
//! `AuditEvent` is what callers emit and get back from searches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AuditError, AuditResult};
use crate::utils::{format_date, from_unix};

/// Event payload: field name to arbitrary structured value
pub type EventFields = serde_json::Map<String, Value>;

/// A raw store item: attribute name to value
pub type Item = serde_json::Map<String, Value>;

/// Namespace used when the caller does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Event type of session end events, searched by `search_session_events`
pub const SESSION_END_EVENT: &str = "session.end";

/// Attribute names of the stored record
pub mod attr {
    pub const SESSION_ID: &str = "SessionID";
    pub const EVENT_INDEX: &str = "EventIndex";
    pub const EVENT_TYPE: &str = "EventType";
    pub const CREATED_AT: &str = "CreatedAt";
    pub const CREATED_AT_DATE: &str = "CreatedAtDate";
    pub const EVENT_NAMESPACE: &str = "EventNamespace";
    pub const FIELDS: &str = "Fields";
    pub const FIELDS_MAP: &str = "FieldsMap";
    pub const EXPIRES: &str = "Expires";
}

/// Result ordering by `CreatedAt`, ties broken by `EventIndex`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::Ascending => write!(f, "ascending"),
            Order::Descending => write!(f, "descending"),
        }
    }
}

impl FromStr for Order {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Order::Ascending),
            "desc" | "descending" => Ok(Order::Descending),
            other => Err(AuditError::BadParameter(format!(
                "unknown order {:?}, expected asc or desc",
                other
            ))),
        }
    }
}

/// Primary key of a stored record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "EventIndex")]
    pub event_index: i64,
}

impl ItemKey {
    pub fn new(session_id: impl Into<String>, event_index: i64) -> Self {
        Self {
            session_id: session_id.into(),
            event_index,
        }
    }

    /// Extract the key attributes from a raw item
    pub fn from_item(item: &Item) -> Option<Self> {
        let session_id = item.get(attr::SESSION_ID)?.as_str()?;
        let event_index = item.get(attr::EVENT_INDEX)?.as_i64()?;
        Some(Self::new(session_id, event_index))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.event_index)
    }
}

/// A stored audit event
///
/// Records written by this crate always carry `CreatedAtDate` and
/// `FieldsMap`. Older records may lack the date or still hold their payload
/// as a JSON string in `Fields`; the migrations rewrite those in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "SessionID")]
    pub session_id: String,

    #[serde(rename = "EventIndex")]
    pub event_index: i64,

    #[serde(rename = "EventType")]
    pub event_type: String,

    /// Unix timestamp (seconds, UTC)
    #[serde(rename = "CreatedAt")]
    pub created_at: i64,

    /// `YYYY-MM-DD` day of `created_at`, hash key of the time search index
    #[serde(rename = "CreatedAtDate", default, skip_serializing_if = "Option::is_none")]
    pub created_at_date: Option<String>,

    #[serde(rename = "EventNamespace")]
    pub event_namespace: String,

    #[serde(rename = "FieldsMap", default, skip_serializing_if = "Option::is_none")]
    pub fields_map: Option<EventFields>,

    /// Legacy JSON-encoded payload
    #[serde(rename = "Fields", default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,

    #[serde(rename = "Expires", default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl EventRecord {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.session_id.clone(), self.event_index)
    }

    /// The partition key `created_at` maps to
    pub fn expected_date(&self) -> Option<String> {
        format_date(self.created_at)
    }

    /// `CreatedAtDate` is present and agrees with `CreatedAt`
    pub fn is_date_migrated(&self) -> bool {
        match (&self.created_at_date, self.expected_date()) {
            (Some(actual), Some(expected)) => *actual == expected,
            _ => false,
        }
    }

    /// The payload lives in `FieldsMap` and no legacy `Fields` remains
    pub fn is_migrated(&self) -> bool {
        self.fields_map.is_some() && self.fields.is_none()
    }

    /// The authoritative payload of the record
    pub fn payload(&self) -> AuditResult<EventFields> {
        if let Some(map) = &self.fields_map {
            return Ok(map.clone());
        }
        match &self.fields {
            Some(raw) => self.parse_legacy_fields(raw),
            None => Ok(EventFields::new()),
        }
    }

    /// Parse a legacy `Fields` string into a payload map
    pub fn parse_legacy_fields(&self, raw: &str) -> AuditResult<EventFields> {
        serde_json::from_str(raw).map_err(|source| AuditError::MalformedLegacyPayload {
            session_id: self.session_id.clone(),
            event_index: self.event_index,
            source,
        })
    }

    /// Serialize to a raw store item
    pub fn to_item(&self) -> AuditResult<Item> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(AuditError::BadParameter(format!(
                "event record serialized to non-object {}",
                other
            ))),
        }
    }

    /// Deserialize from a raw store item
    pub fn from_item(item: &Item) -> AuditResult<Self> {
        Ok(serde_json::from_value(Value::Object(item.clone()))?)
    }

    /// Serialize to JSON string (for JSONL dumps)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An audit event as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,

    /// Empty means "assign a fresh id on emission"
    #[serde(default)]
    pub session_id: String,

    #[serde(default)]
    pub index: i64,

    /// Empty means "now" on emission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub fields: EventFields,
}

impl AuditEvent {
    /// Create an event of the given type with no payload
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: String::new(),
            index: 0,
            time: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            fields: EventFields::new(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_index(mut self, index: i64) -> Self {
        self.index = index;
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set one payload field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Rebuild the caller-facing event from a stored record
    pub fn from_record(record: &EventRecord) -> AuditResult<Self> {
        Ok(Self {
            event_type: record.event_type.clone(),
            session_id: record.session_id.clone(),
            index: record.event_index,
            time: from_unix(record.created_at),
            namespace: record.event_namespace.clone(),
            fields: record.payload()?,
        })
    }
}
