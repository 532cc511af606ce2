//! The session document model.
//!
//! A `Session` owns its patches, each patch owns its objects and
//! connections, and each object owns its parameters. Entities refer to each
//! other only by string id; a connection may name objects that do not
//! exist. Collections are kept in `BTreeMap`s keyed by id and serialize as
//! arrays in ascending id order, so two equal models always produce the
//! same document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::clock::Timestamp;
use crate::error::StateError;

/// Key of the aggregate timestamp inside the global settings document.
pub const SETTINGS_TIMESTAMP_KEY: &str = "lastModifiedTime";

/// Entities that live in an id-keyed collection.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// (De)serializes an id-keyed map as a plain array of its values.
mod keyed_seq {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Keyed;

    pub fn serialize<S, T>(map: &BTreeMap<String, T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Keyed,
    {
        let items = Vec::<T>::deserialize(deserializer)?;
        Ok(items
            .into_iter()
            .map(|item| (item.key().to_string(), item))
            .collect())
    }
}

fn default_param_type() -> String {
    "any".to_string()
}

/// A named, typed value on an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    pub value: Value,
    #[serde(rename = "type", default = "default_param_type")]
    pub value_type: String,
    #[serde(default)]
    pub is_read_only: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            value_type: default_param_type(),
            is_read_only: false,
        }
    }

    pub fn with_type(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = value_type.into();
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = read_only;
        self
    }

    pub fn set_value(&mut self, value: Value) -> Result<(), StateError> {
        if self.is_read_only {
            return Err(StateError::ReadOnly(self.name.clone()));
        }
        self.value = value;
        Ok(())
    }
}

impl Keyed for Parameter {
    fn key(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

/// A node in a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxObject {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub inlets: u32,
    #[serde(default)]
    pub outlets: u32,
    #[serde(default)]
    pub last_modified_time: Timestamp,
    #[serde(with = "keyed_seq", default)]
    pub parameters: BTreeMap<String, Parameter>,
}

impl MaxObject {
    pub fn new(id: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            position: Position::default(),
            size: Size::default(),
            inlets: 0,
            outlets: 0,
            last_modified_time: 0,
            parameters: BTreeMap::new(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn add_parameter(&mut self, param: Parameter) {
        self.parameters.insert(param.name.clone(), param);
    }
}

impl Keyed for MaxObject {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A directed link from an outlet of one object to an inlet of another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_id: String,
    pub source_outlet: u32,
    pub destination_id: String,
    pub destination_inlet: u32,
    #[serde(default)]
    pub last_modified_time: Timestamp,
}

impl Keyed for Connection {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A named sub-document holding objects and connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub is_modified: bool,
    #[serde(default)]
    pub last_modified_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Number>,
    #[serde(with = "keyed_seq", default)]
    pub objects: BTreeMap<String, MaxObject>,
    #[serde(with = "keyed_seq", default)]
    pub connections: BTreeMap<String, Connection>,
}

impl Patch {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            is_modified: false,
            last_modified_time: 0,
            priority: None,
            objects: BTreeMap::new(),
            connections: BTreeMap::new(),
        }
    }

    pub fn object(&self, id: &str) -> Option<&MaxObject> {
        self.objects.get(id)
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Record that something inside this patch changed.
    pub fn touch(&mut self, now: Timestamp) {
        self.is_modified = true;
        self.last_modified_time = now;
    }
}

impl Keyed for Patch {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Session-wide settings with a single timestamp covering every key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(rename = "lastModifiedTime", default)]
    pub last_modified_time: Timestamp,
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
}

impl GlobalSettings {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value, now: Timestamp) {
        self.values.insert(name.into(), value);
        self.last_modified_time = now;
    }
}

/// The root of one editing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub creation_time: Timestamp,
    #[serde(default)]
    pub last_modified_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Number>,
    #[serde(with = "keyed_seq", default)]
    pub patches: BTreeMap<String, Patch>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl Session {
    pub fn new(id: impl Into<String>, name: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            creation_time: now,
            last_modified_time: now,
            priority: None,
            patches: BTreeMap::new(),
            global_settings: GlobalSettings::default(),
        }
    }

    pub fn patch(&self, id: &str) -> Option<&Patch> {
        self.patches.get(id)
    }

    pub fn patch_mut(&mut self, id: &str) -> Option<&mut Patch> {
        self.patches.get_mut(id)
    }

    /// Find an object by id in whichever patch holds it.
    pub fn find_object(&self, object_id: &str) -> Option<(&Patch, &MaxObject)> {
        self.patches
            .values()
            .find_map(|p| p.object(object_id).map(|o| (p, o)))
    }

    pub fn find_connection(&self, connection_id: &str) -> Option<(&Patch, &Connection)> {
        self.patches
            .values()
            .find_map(|p| p.connection(connection_id).map(|c| (p, c)))
    }

    pub fn to_document(&self) -> Result<Value, StateError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: &Value) -> Result<Self, StateError> {
        Session::deserialize(doc).map_err(|e| StateError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_session() -> Session {
        let mut session = Session::new("session-1", "Test Session", 10);
        let mut patch = Patch::new("patch-1", "Test Patch", "~/patches/test.maxpat");

        let mut osc = MaxObject::new("obj-1", "cycle~");
        osc.position = Position { x: 100, y: 150 };
        osc.size = Size { width: 64, height: 64 };
        osc.inlets = 1;
        osc.outlets = 1;
        osc.add_parameter(Parameter::new("frequency", json!(440.0)).with_type("float"));

        let mut gain = MaxObject::new("obj-2", "gain~");
        gain.add_parameter(Parameter::new("level", json!(0.5)).with_type("float"));

        patch.objects.insert(osc.id.clone(), osc);
        patch.objects.insert(gain.id.clone(), gain);
        patch.connections.insert(
            "conn-1".into(),
            Connection {
                id: "conn-1".into(),
                source_id: "obj-1".into(),
                source_outlet: 0,
                destination_id: "obj-2".into(),
                destination_inlet: 0,
                last_modified_time: 0,
            },
        );
        session.patches.insert(patch.id.clone(), patch);
        session.global_settings.set("oscPort", json!(7400), 11);
        session
    }

    #[test]
    fn test_document_shape() {
        let j = sample_session().to_document().unwrap();
        assert_eq!(j["id"], "session-1");
        assert_eq!(j["name"], "Test Session");
        assert_eq!(j["patches"].as_array().unwrap().len(), 1);
        assert_eq!(j["patches"][0]["id"], "patch-1");
        assert_eq!(j["patches"][0]["objects"].as_array().unwrap().len(), 2);
        assert_eq!(j["patches"][0]["objects"][0]["id"], "obj-1");
        assert_eq!(j["patches"][0]["objects"][0]["position"]["x"], 100);
        assert_eq!(j["patches"][0]["objects"][0]["size"]["width"], 64);
        assert_eq!(j["patches"][0]["connections"][0]["sourceId"], "obj-1");
        assert_eq!(j["globalSettings"]["oscPort"], 7400);
        assert_eq!(j["globalSettings"][SETTINGS_TIMESTAMP_KEY], 11);
        assert!(j.get("priority").is_none());
    }

    #[test]
    fn test_document_restores_equal_session() {
        let session = sample_session();
        let restored = Session::from_document(&session.to_document().unwrap()).unwrap();
        assert_eq!(restored, session);

        let obj = restored.patch("patch-1").unwrap().object("obj-1").unwrap();
        assert_eq!(obj.object_type, "cycle~");
        assert_eq!(obj.parameter("frequency").unwrap().value, json!(440.0));
    }

    #[test]
    fn test_optional_fields_default_on_load() {
        let doc = json!({
            "id": "s",
            "name": "n",
            "patches": [{
                "id": "p",
                "name": "P",
                "objects": [{"id": "o", "type": "toggle", "parameters": [{"name": "v", "value": 1}]}]
            }],
            "__metadata": {"format": "mcp_state"}
        });
        let session = Session::from_document(&doc).unwrap();
        let obj = session.patch("p").unwrap().object("o").unwrap();
        assert_eq!(obj.position, Position::default());
        let param = obj.parameter("v").unwrap();
        assert_eq!(param.value_type, "any");
        assert!(!param.is_read_only);
    }

    #[test]
    fn test_priority_keeps_its_number_form() {
        let mut doc = sample_session().to_document().unwrap();
        doc["priority"] = json!(5);
        doc["patches"][0]["priority"] = json!(2.5);
        let restored = Session::from_document(&doc).unwrap().to_document().unwrap();
        assert_eq!(restored, doc);
        assert!(restored["priority"].is_u64());
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let doc = json!({"name": "no id"});
        assert!(matches!(
            Session::from_document(&doc),
            Err(StateError::ParseError(_))
        ));
    }

    #[test]
    fn test_read_only_parameter_rejects_write() {
        let mut param = Parameter::new("gain", json!(1)).read_only(true);
        assert_eq!(
            param.set_value(json!(2)),
            Err(StateError::ReadOnly("gain".into()))
        );
        assert_eq!(param.value, json!(1));
    }

    #[test]
    fn test_find_object_across_patches() {
        let session = sample_session();
        let (patch, obj) = session.find_object("obj-2").unwrap();
        assert_eq!(patch.id, "patch-1");
        assert_eq!(obj.object_type, "gain~");
        assert!(session.find_object("missing").is_none());
    }
}
