use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Last-known server-side representation of a task list or task.
///
/// The payload is kept whole so fields this crate does not understand survive
/// a round trip through the document on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteObject(Map<String, Value>);

impl RemoteObject {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn id(&self) -> Option<&str> {
        self.str("id")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// RFC 3339 timestamp field; missing or unparseable values read as `None`.
    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.str(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Servers mark some objects as deleted instead of dropping them from listings.
    pub fn is_deleted(&self) -> bool {
        self.0.get("deleted").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for RemoteObject {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for RemoteObject {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

impl From<RemoteObject> for Value {
    fn from(object: RemoteObject) -> Self {
        Value::Object(object.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_known_fields() {
        let object = RemoteObject::try_from(json!({
            "id": "L1",
            "title": "Groceries",
            "updated": "2026-03-01T10:00:00.000Z",
            "etag": "\"abc\""
        }))
        .unwrap();

        assert_eq!(object.id(), Some("L1"));
        assert_eq!(object.str("title"), Some("Groceries"));
        assert_eq!(
            object.timestamp("updated").unwrap().to_rfc3339(),
            "2026-03-01T10:00:00+00:00"
        );
        assert!(!object.is_deleted());
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(RemoteObject::try_from(json!(["L1"])).is_err());
    }
}
