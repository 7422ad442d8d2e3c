//! Typed entities held by the cache registry.
//!
//! Fields the client does not interpret are kept in `extra` so a snapshot
//! written back to the channel loses nothing the server sent.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use timekeep_protocol::EntityKind;

pub trait Entity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);
}

/// Client-side id for a create that the server has not acknowledged yet.
pub fn provisional_id() -> String {
    format!("tmp-{}", ulid::Ulid::new())
}

macro_rules! impl_entity {
    ($ty:ty, $kind:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }
        }
    };
}

/// Servers disagree on whether ids are strings or integers.
fn string_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or integer id, got {}",
            other
        ))),
    }
}

fn optional_string_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or integer id, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default, deserialize_with = "string_id")]
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "optional_string_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, deserialize_with = "string_id")]
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "optional_string_id", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    #[serde(default, deserialize_with = "string_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Start and end times stay as the server's raw strings; they go through
/// [`crate::clock::ClockNormalizer`] before any arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    #[serde(default, deserialize_with = "string_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "optional_string_id", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "optional_string_id", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    #[serde(default, deserialize_with = "string_id")]
    pub id: String,
    #[serde(default, deserialize_with = "optional_string_id", skip_serializing_if = "Option::is_none")]
    pub time_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub const SETTINGS_ID: &str = "settings";

fn settings_id() -> String {
    SETTINGS_ID.to_string()
}

/// Singleton entity; the cache holds at most one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "settings_id")]
    pub id: String,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            id: settings_id(),
            values: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default, deserialize_with = "string_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_entity!(Project, EntityKind::Projects);
impl_entity!(Task, EntityKind::Tasks);
impl_entity!(Client, EntityKind::Clients);
impl_entity!(TimeEntry, EntityKind::TimeEntries);
impl_entity!(Screenshot, EntityKind::Screenshots);
impl_entity!(Settings, EntityKind::Settings);
impl_entity!(Organization, EntityKind::Organizations);

/// Strips a `{"data": ...}` envelope if the server used one.
pub fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Items of a collection response. Accepts a bare array, an envelope, or a
/// single object (the settings endpoint).
pub fn collection_items(kind: EntityKind, value: Value) -> Option<Vec<Value>> {
    match unwrap_envelope(value) {
        Value::Array(items) => Some(items),
        Value::Null => Some(Vec::new()),
        Value::Object(mut map) => {
            if let Some(Value::Array(items)) = map.remove(kind.as_str()) {
                return Some(items);
            }
            if let Some(Value::Array(items)) = map.remove("items") {
                return Some(items);
            }
            Some(vec![Value::Object(map)])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_become_strings() {
        let project: Project =
            serde_json::from_value(json!({"id": 42, "name": "Atlas", "client_id": 7}))
                .expect("project");
        assert_eq!(project.id(), "42");
        assert_eq!(project.client_id.as_deref(), Some("7"));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = json!({"id": "t1", "name": "Review", "priority": "high"});
        let task: Task = serde_json::from_value(raw.clone()).expect("task");
        assert_eq!(serde_json::to_value(&task).expect("value")["priority"], "high");
    }

    #[test]
    fn collection_items_accepts_common_shapes() {
        let kind = EntityKind::Projects;
        assert_eq!(collection_items(kind, json!([{"id": 1}])).map(|v| v.len()), Some(1));
        assert_eq!(
            collection_items(kind, json!({"data": [{"id": 1}, {"id": 2}]})).map(|v| v.len()),
            Some(2)
        );
        assert_eq!(
            collection_items(kind, json!({"projects": [], "total": 0})).map(|v| v.len()),
            Some(0)
        );
        let settings = collection_items(EntityKind::Settings, json!({"theme": "dark"}))
            .expect("settings object");
        let parsed: Settings = serde_json::from_value(settings[0].clone()).expect("settings");
        assert_eq!(parsed.id(), SETTINGS_ID);
        assert!(collection_items(kind, json!("nope")).is_none());
    }

    #[test]
    fn provisional_ids_are_recognisable() {
        let id = provisional_id();
        assert!(id.starts_with("tmp-"));
        assert_ne!(id, provisional_id());
    }
}
