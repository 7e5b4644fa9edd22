//! Core change-event types for Tributary.
//!
//! A [`ChangeEvent`] is one entry of the source's ordered commit stream.
//! Events are read once by the supervisor, never mutated afterwards, and
//! shared with the owning worker behind an `Arc`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Opaque position in the change stream.
///
/// Opening the source at a marker resumes *after* the event that carried it.
///
/// Markers are not ordered as strings (`"1000-10"` sorts before `"1000-7"`);
/// compare the parsed [`StreamPosition`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeMarker(String);

impl ResumeMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric position, when the marker is a `<millis>-<seq>` entry ID.
    pub fn position(&self) -> Option<StreamPosition> {
        self.0.parse().ok()
    }
}

/// Totally ordered `<millis>-<seq>` stream entry ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamPosition {
    pub millis: u64,
    pub seq: u64,
}

impl StreamPosition {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl FromStr for StreamPosition {
    type Err = ParseIntError;

    /// A bare `<millis>` reads as sequence 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis.parse()?, seq.parse()?),
            None => (s.parse()?, 0),
        };
        Ok(Self { millis, seq })
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl fmt::Display for ResumeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of mutation recorded by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    /// Anything else the source reports (replace, delete, ...), kept verbatim
    Other(String),
}

impl OperationKind {
    /// Parse an operation label, case-insensitively.
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "insert" => Self::Insert,
            "update" => Self::Update,
            _ => Self::Other(label.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Other(label) => label,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business identifier used for partitioning and aggregate lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusinessKey {
    Int(i64),
    Str(String),
}

impl BusinessKey {
    /// Extract a key from a payload value.
    ///
    /// Only integral numbers and non-empty strings are usable keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) if !s.is_empty() => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// Canonical text form fed to the partition hash and used in storage keys.
    pub fn canonical(&self) -> Cow<'_, str> {
        match self {
            Self::Int(n) => Cow::Owned(n.to_string()),
            Self::Str(s) => Cow::Borrowed(s),
        }
    }

    /// Type-tagged form for storage keys: `5` and `"5"` are different documents.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Int(n) => format!("i:{n}"),
            Self::Str(s) => format!("s:{s}"),
        }
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<i64> for BusinessKey {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for BusinessKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

/// One change read from the source.
///
/// # Fields
///
/// - `commit_position`: source-assigned position of the commit
/// - `cluster_timestamp`: source clock at commit time, used for lag
/// - `operation`: insert / update / other
/// - `payload`: the changed document, field name to value
/// - `resume_marker`: token that resumes the stream after this event
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub commit_position: String,
    pub cluster_timestamp: DateTime<Utc>,
    pub operation: OperationKind,
    pub payload: Map<String, Value>,
    pub resume_marker: ResumeMarker,
}

impl ChangeEvent {
    /// Create an event whose commit position doubles as its resume marker.
    pub fn new(
        position: impl Into<String>,
        cluster_timestamp: DateTime<Utc>,
        operation: OperationKind,
        payload: Map<String, Value>,
    ) -> Self {
        let position = position.into();
        Self {
            resume_marker: ResumeMarker::new(position.clone()),
            commit_position: position,
            cluster_timestamp,
            operation,
            payload,
        }
    }

    /// Build an event from a JSON object payload; non-objects become empty payloads.
    pub fn from_json(
        position: impl Into<String>,
        cluster_timestamp: DateTime<Utc>,
        operation: OperationKind,
        payload: Value,
    ) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(position, cluster_timestamp, operation, payload)
    }

    /// Override the resume marker.
    pub fn with_resume_marker(mut self, marker: ResumeMarker) -> Self {
        self.resume_marker = marker;
        self
    }

    /// Look up a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Extract the business key stored under `field`.
    pub fn business_key(&self, field: &str) -> Option<BusinessKey> {
        self.payload.get(field).and_then(BusinessKey::from_value)
    }
}

/// Parse a payload date.
///
/// Accepts RFC 3339 strings, integer epoch milliseconds, and extended-JSON
/// `{"$date": ...}` wrappers around either.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(map) => map.get("$date").and_then(|inner| match inner {
            Value::Object(_) => inner
                .get("$numberLong")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            other => parse_date(other),
        }),
        _ => None,
    }
}
