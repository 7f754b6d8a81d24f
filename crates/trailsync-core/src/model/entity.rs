use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Loosely-shaped entity attributes (title, color, geometry, ...).
pub type Payload = Map<String, Value>;

/// The two mission entity families the queue can mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Poi,
    Zone,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Poi => "poi",
            Self::Zone => "zone",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation verb of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// A POI or zone as held in the local cache: id plus opaque attributes.
///
/// The id is either server-assigned or a local placeholder (see
/// [`crate::model::ids`]). Document stores name it `_id`; both spellings are
/// accepted on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: Payload,
}

impl Entity {
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Payload) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// String attribute lookup, mostly for logs and tests.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Shallow merge: every key in `patch` overwrites the same key in `base`.
pub fn merge_payload(base: &mut Payload, patch: &Payload) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn merge_overwrites_and_keeps_untouched_keys() {
        let mut base = payload(json!({"title": "A", "color": "#00ff00"}));
        merge_payload(&mut base, &payload(json!({"title": "B", "icon": "flag"})));
        assert_eq!(
            Value::Object(base),
            json!({"title": "B", "color": "#00ff00", "icon": "flag"})
        );
    }

    #[test]
    fn entity_accepts_document_store_id() {
        let entity: Entity =
            serde_json::from_value(json!({"_id": "6650a1", "title": "Ravine"})).expect("decode");
        assert_eq!(entity.id, "6650a1");
        assert_eq!(entity.str_field("title"), Some("Ravine"));
    }

    #[test]
    fn entity_serializes_flat() {
        let entity = Entity::new("p1", payload(json!({"title": "Hut"})));
        assert_eq!(
            serde_json::to_value(&entity).expect("encode"),
            json!({"id": "p1", "title": "Hut"})
        );
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(serde_json::to_value(EntityKind::Zone).expect("encode"), json!("zone"));
        assert_eq!(Op::Delete.to_string(), "delete");
    }
}
