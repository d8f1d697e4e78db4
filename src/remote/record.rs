//! Raw records at the adapter boundary.

use serde_json::{Map, Value};

/// An unprocessed remote item.
///
/// Tagged once, where the data enters the crate; everything downstream
/// works on [`crate::model::NormalizedSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawRemoteRecord {
    /// Already in canonical snapshot shape (e.g. replayed from a cache dump).
    Mapping(Map<String, Value>),
    /// Tracker JSON as received on the wire.
    Payload(Value),
}

impl RawRemoteRecord {
    /// Best-effort remote id, read before normalization for logging.
    #[must_use]
    pub fn remote_id(&self) -> Option<String> {
        let map = match self {
            Self::Mapping(map) => map,
            Self::Payload(Value::Object(map)) => map,
            Self::Payload(_) => return None,
        };
        ["id", "number"].iter().find_map(|key| match map.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }
}
