//! State normalization.
//!
//! Converts tracker payloads, canonical mappings and local entities into
//! [`NormalizedSnapshot`]s. Every operation here is total: input that
//! cannot be understood becomes [`Normalized::Absent`] with a reason, and a
//! diagnostic event is emitted.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{canonical_labels, LocalEntity, NormalizedSnapshot};
use crate::remote::RawRemoteRecord;
use crate::sync::events::{SharedSink, SyncEvent};
use crate::validate::{canonical_status, normalize_status};

/// Why a value could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    /// The field or record was not there.
    Missing,
    /// Empty mapping or `null` payload.
    Empty,
    /// The value had a shape we do not read (number, array, ...).
    UnsupportedShape,
    /// A string that does not parse.
    Unparseable,
    /// A record without an `id`/`number`.
    MissingId,
}

impl DegradeReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Empty => "empty",
            Self::UnsupportedShape => "unsupported_shape",
            Self::Unparseable => "unparseable",
            Self::MissingId => "missing_id",
        }
    }
}

/// A degraded result with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degraded {
    pub reason: DegradeReason,
    pub detail: String,
}

impl std::fmt::Display for Degraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason.as_str(), self.detail)
    }
}

/// Result of a normalization step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized<T> {
    Present(T),
    Absent(Degraded),
}

impl<T> Normalized<T> {
    fn absent(reason: DegradeReason, detail: impl Into<String>) -> Self {
        Self::Absent(Degraded {
            reason,
            detail: detail.into(),
        })
    }

    #[must_use]
    pub fn present(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Absent(_) => None,
        }
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Raw shape of a timestamp field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTimestamp {
    Time(DateTime<Utc>),
    Text(String),
    Missing,
    /// Anything else, named by its shape.
    Other(&'static str),
}

/// Anything a timestamp can be read from.
pub trait TimestampSource {
    fn raw_timestamp(&self, field: &str) -> RawTimestamp;
}

impl TimestampSource for Map<String, Value> {
    fn raw_timestamp(&self, field: &str) -> RawTimestamp {
        match self.get(field) {
            None | Some(Value::Null) => RawTimestamp::Missing,
            Some(Value::String(s)) => RawTimestamp::Text(s.clone()),
            Some(Value::Number(_)) => RawTimestamp::Other("number"),
            Some(Value::Bool(_)) => RawTimestamp::Other("bool"),
            Some(Value::Array(_)) => RawTimestamp::Other("array"),
            Some(Value::Object(_)) => RawTimestamp::Other("object"),
        }
    }
}

impl TimestampSource for Value {
    fn raw_timestamp(&self, field: &str) -> RawTimestamp {
        match self {
            Self::Object(map) => map.raw_timestamp(field),
            _ => RawTimestamp::Missing,
        }
    }
}

impl TimestampSource for LocalEntity {
    fn raw_timestamp(&self, field: &str) -> RawTimestamp {
        if field != "updated_at" {
            return RawTimestamp::Missing;
        }
        Utc.timestamp_millis_opt(self.updated_at)
            .single()
            .map_or(RawTimestamp::Other("out-of-range millis"), RawTimestamp::Time)
    }
}

impl TimestampSource for NormalizedSnapshot {
    fn raw_timestamp(&self, field: &str) -> RawTimestamp {
        match (field, self.updated_at) {
            ("updated_at", Some(ts)) => RawTimestamp::Time(ts),
            _ => RawTimestamp::Missing,
        }
    }
}

/// Converts raw representations to canonical snapshots.
pub struct StateNormalizer {
    sink: SharedSink,
}

impl StateNormalizer {
    #[must_use]
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }

    /// Read a timestamp field.
    ///
    /// Strings with a trailing `Z` are read as `+00:00`; naive date-times
    /// are taken as UTC. Unsupported shapes and parse failures emit a
    /// [`SyncEvent::TimestampDegraded`]. A missing field is silent.
    pub fn extract_timestamp<S: TimestampSource + ?Sized>(
        &self,
        source: &S,
        field: &str,
    ) -> Normalized<DateTime<Utc>> {
        let result = match source.raw_timestamp(field) {
            RawTimestamp::Time(ts) => return Normalized::Present(ts),
            RawTimestamp::Missing => {
                return Normalized::absent(DegradeReason::Missing, field.to_string());
            }
            RawTimestamp::Text(text) => match parse_timestamp(&text) {
                Some(ts) => return Normalized::Present(ts),
                None => Normalized::absent(DegradeReason::Unparseable, text),
            },
            RawTimestamp::Other(shape) => Normalized::absent(DegradeReason::UnsupportedShape, shape),
        };

        if let Normalized::Absent(degraded) = &result {
            self.sink.emit(SyncEvent::TimestampDegraded {
                field: field.to_string(),
                reason: degraded.to_string(),
            });
        }
        result
    }

    /// Normalize one raw remote record.
    pub fn normalize(&self, raw: &RawRemoteRecord) -> Normalized<NormalizedSnapshot> {
        let result = match raw {
            RawRemoteRecord::Mapping(map) => self.normalize_mapping(map),
            RawRemoteRecord::Payload(Value::Null) => {
                Normalized::absent(DegradeReason::Empty, "null payload")
            }
            RawRemoteRecord::Payload(Value::Object(map)) => self.project_payload(map),
            RawRemoteRecord::Payload(_) => {
                Normalized::absent(DegradeReason::UnsupportedShape, "payload is not an object")
            }
        };

        if let Normalized::Absent(degraded) = &result {
            self.sink.emit(SyncEvent::NormalizationFailed {
                reason: degraded.to_string(),
            });
        }
        result
    }

    /// Normalize the local copy of an entity.
    #[must_use]
    pub fn normalize_local(&self, entity: &LocalEntity) -> NormalizedSnapshot {
        NormalizedSnapshot {
            id: entity.id.clone(),
            title: Some(entity.title.clone()),
            status: Some(entity.status.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(|s| self.status(s)),
            assignee: entity.assignee.clone(),
            milestone: entity.milestone.clone(),
            description: entity.description.clone(),
            labels: entity.labels.clone(),
            updated_at: self.extract_timestamp(entity, "updated_at").present(),
        }
        .canonicalize()
    }

    fn normalize_mapping(&self, map: &Map<String, Value>) -> Normalized<NormalizedSnapshot> {
        if map.is_empty() {
            return Normalized::absent(DegradeReason::Empty, "empty mapping");
        }

        let mut fields = map.clone();
        fields.remove("updated_at");
        let mut snapshot: NormalizedSnapshot = match serde_json::from_value(Value::Object(fields)) {
            Ok(snapshot) => snapshot,
            Err(e) => return Normalized::absent(DegradeReason::Unparseable, e.to_string()),
        };
        if snapshot.id.is_empty() {
            return Normalized::absent(DegradeReason::MissingId, "mapping without id");
        }
        snapshot.updated_at = self.extract_timestamp(map, "updated_at").present();
        Normalized::Present(snapshot.canonicalize())
    }

    fn project_payload(&self, map: &Map<String, Value>) -> Normalized<NormalizedSnapshot> {
        let Some(id) = RawRemoteRecord::Payload(Value::Object(map.clone())).remote_id() else {
            return Normalized::absent(DegradeReason::MissingId, "payload without id or number");
        };

        let status = string_at(map, "status")
            .or_else(|| string_at(map, "state"))
            .map(|s| self.status(&s));

        let updated_at = if map.get("updated_at").is_some_and(|v| !v.is_null()) {
            self.extract_timestamp(map, "updated_at")
        } else {
            self.extract_timestamp(map, "modified_at")
        };

        Normalized::Present(
            NormalizedSnapshot {
                id,
                title: string_at(map, "title"),
                status,
                assignee: person_at(map, "assignee"),
                milestone: named_at(map, "milestone", "title"),
                description: ["headline", "description", "body"]
                    .iter()
                    .find_map(|key| string_at(map, key).filter(|s| !s.is_empty())),
                labels: labels_at(map),
                updated_at: updated_at.present(),
            }
            .canonicalize(),
        )
    }

    fn status(&self, raw: &str) -> String {
        if let Err((value, suggestion)) = normalize_status(raw) {
            self.sink.emit(SyncEvent::UnknownStatus { value, suggestion });
        }
        canonical_status(raw)
    }
}

/// Parse an ISO-8601 / RFC 3339 timestamp.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let text = text
        .strip_suffix('Z')
        .or_else(|| text.strip_suffix('z'))
        .map_or_else(|| text.to_string(), |rest| format!("{rest}+00:00"));

    if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn string_at(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// A string, or an object carrying `name_key`.
fn named_at(map: &Map<String, Value>, key: &str, name_key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(inner) => string_at(inner, name_key),
        _ => None,
    }
}

/// A login string, or a user object (`login`, then `name`).
fn person_at(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(inner) => string_at(inner, "login").or_else(|| string_at(inner, "name")),
        _ => None,
    }
}

fn labels_at(map: &Map<String, Value>) -> Vec<String> {
    let Some(Value::Array(items)) = map.get("labels") else {
        return Vec::new();
    };
    canonical_labels(
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(inner) => string_at(inner, "name"),
                _ => None,
            })
            .collect(),
    )
}
