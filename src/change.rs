//! Typed change descriptors.
//!
//! The transport hands us `(category, event kind, target id, payload)` with a
//! loosely typed JSON payload. `Change::parse` validates the payload against
//! the schema for that category/kind pair once, up front, so the applier only
//! ever sees well-formed operations.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::StateError;
use crate::event::{Category, EventKind};
use crate::model::{Parameter, Position, Session, Size};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOp {
    /// Rename; a payload without `name` is accepted and changes nothing.
    Update { name: Option<String> },
    /// Replace the whole session with an embedded document.
    Replace { state: Box<Session> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Create {
        name: String,
        path: Option<String>,
    },
    Update {
        name: Option<String>,
        path: Option<String>,
        is_modified: Option<bool>,
    },
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectOp {
    Create {
        object_type: String,
        position: Option<Position>,
        size: Option<Size>,
        inlets: Option<u32>,
        outlets: Option<u32>,
        parameters: Vec<Parameter>,
    },
    Update {
        position: Option<Position>,
        size: Option<Size>,
        inlets: Option<u32>,
        outlets: Option<u32>,
    },
    Delete,
    Move(Position),
    Resize(Size),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterWrite {
    pub name: String,
    pub value: Value,
    /// Only used when the parameter does not exist yet.
    pub value_type: Option<String>,
    pub is_read_only: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOp {
    Connect {
        source_id: String,
        source_outlet: u32,
        destination_id: String,
        destination_inlet: u32,
    },
    Disconnect,
}

/// A validated operation, tagged by category.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    Session(SessionOp),
    Patch(PatchOp),
    Object { patch_id: String, op: ObjectOp },
    Parameter {
        patch_id: String,
        object_id: String,
        write: ParameterWrite,
    },
    Connection { patch_id: String, op: ConnectionOp },
    GlobalSetting { value: Value },
}

/// A change descriptor after validation. Keeps the original payload so the
/// resulting `StateEvent` can carry it verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub category: Category,
    pub kind: EventKind,
    pub target_id: String,
    pub payload: Value,
    pub op: ChangeOp,
}

impl Change {
    /// Validate a descriptor given as strings, the way the transport delivers it.
    pub fn parse_str(
        category: &str,
        kind: &str,
        target_id: &str,
        payload: Value,
    ) -> Result<Self, StateError> {
        Self::parse(category.parse()?, kind.parse()?, target_id, payload)
    }

    pub fn parse(
        category: Category,
        kind: EventKind,
        target_id: &str,
        payload: Value,
    ) -> Result<Self, StateError> {
        let empty = Map::new();
        let fields = match &payload {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(StateError::ParseError(format!(
                    "payload must be an object, got {}",
                    type_name(other)
                )))
            }
        };
        if target_id.is_empty() {
            return Err(StateError::MissingField("targetId".into()));
        }

        let unsupported = || StateError::UnsupportedEventKind { category, kind };

        let op = match category {
            Category::Session => match kind {
                EventKind::Updated => ChangeOp::Session(SessionOp::Update {
                    name: optional(fields, "name")?,
                }),
                EventKind::StateChanged => {
                    let state = fields
                        .get("state")
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| StateError::MissingField("state".into()))?;
                    ChangeOp::Session(SessionOp::Replace {
                        state: Box::new(Session::from_document(state)?),
                    })
                }
                _ => return Err(unsupported()),
            },
            Category::Patch => match kind {
                EventKind::Created => ChangeOp::Patch(PatchOp::Create {
                    name: required(fields, "name")?,
                    path: optional(fields, "path")?,
                }),
                EventKind::Updated => ChangeOp::Patch(PatchOp::Update {
                    name: optional(fields, "name")?,
                    path: optional(fields, "path")?,
                    is_modified: optional(fields, "isModified")?,
                }),
                EventKind::Deleted => ChangeOp::Patch(PatchOp::Delete),
                _ => return Err(unsupported()),
            },
            Category::Object => {
                let patch_id = required(fields, "patchId")?;
                let op = match kind {
                    EventKind::Created => ObjectOp::Create {
                        object_type: required(fields, "type")?,
                        position: optional(fields, "position")?,
                        size: optional(fields, "size")?,
                        inlets: optional(fields, "inlets")?,
                        outlets: optional(fields, "outlets")?,
                        parameters: optional(fields, "parameters")?.unwrap_or_default(),
                    },
                    EventKind::Updated => ObjectOp::Update {
                        position: optional(fields, "position")?,
                        size: optional(fields, "size")?,
                        inlets: optional(fields, "inlets")?,
                        outlets: optional(fields, "outlets")?,
                    },
                    EventKind::Deleted => ObjectOp::Delete,
                    EventKind::Moved => ObjectOp::Move(required(fields, "position")?),
                    EventKind::Resized => ObjectOp::Resize(required(fields, "size")?),
                    _ => return Err(unsupported()),
                };
                ChangeOp::Object { patch_id, op }
            }
            Category::Parameter => match kind {
                EventKind::ParamChanged => ChangeOp::Parameter {
                    patch_id: required(fields, "patchId")?,
                    object_id: required(fields, "objectId")?,
                    write: ParameterWrite {
                        name: required(fields, "name")?,
                        value: fields
                            .get("value")
                            .cloned()
                            .ok_or_else(|| StateError::MissingField("value".into()))?,
                        value_type: optional(fields, "type")?,
                        is_read_only: optional(fields, "isReadOnly")?,
                    },
                },
                _ => return Err(unsupported()),
            },
            Category::Connection => {
                let patch_id = required(fields, "patchId")?;
                let op = match kind {
                    EventKind::Connected => ConnectionOp::Connect {
                        source_id: required(fields, "sourceId")?,
                        source_outlet: required(fields, "sourceOutlet")?,
                        destination_id: required(fields, "destinationId")?,
                        destination_inlet: required(fields, "destinationInlet")?,
                    },
                    EventKind::Disconnected => ConnectionOp::Disconnect,
                    _ => return Err(unsupported()),
                };
                ChangeOp::Connection { patch_id, op }
            }
            Category::GlobalSetting => match kind {
                EventKind::Updated => ChangeOp::GlobalSetting {
                    value: fields
                        .get("value")
                        .cloned()
                        .ok_or_else(|| StateError::MissingField("value".into()))?,
                },
                _ => return Err(unsupported()),
            },
        };

        Ok(Self {
            category,
            kind,
            target_id: target_id.to_string(),
            payload,
            op,
        })
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required<T: DeserializeOwned>(fields: &Map<String, Value>, name: &str) -> Result<T, StateError> {
    optional(fields, name)?.ok_or_else(|| StateError::MissingField(name.to_string()))
}

/// A `null` field counts as absent.
fn optional<T: DeserializeOwned>(
    fields: &Map<String, Value>,
    name: &str,
) -> Result<Option<T>, StateError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| StateError::ParseError(format!("field '{}': {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_create_requires_name() {
        let err = Change::parse(Category::Patch, EventKind::Created, "p1", json!({})).unwrap_err();
        assert_eq!(err, StateError::MissingField("name".into()));

        let change = Change::parse(
            Category::Patch,
            EventKind::Created,
            "p1",
            json!({"name": "Test"}),
        )
        .unwrap();
        assert_eq!(
            change.op,
            ChangeOp::Patch(PatchOp::Create {
                name: "Test".into(),
                path: None
            })
        );
    }

    #[test]
    fn test_object_move_requires_position() {
        let err = Change::parse_str("Object", "Moved", "O1", json!({"patchId": "P1"})).unwrap_err();
        assert_eq!(err, StateError::MissingField("position".into()));
    }

    #[test]
    fn test_object_requires_patch_id() {
        let err = Change::parse_str(
            "object",
            "moved",
            "O1",
            json!({"position": {"x": 1, "y": 2}}),
        )
        .unwrap_err();
        assert_eq!(err, StateError::MissingField("patchId".into()));
    }

    #[test]
    fn test_unsupported_kinds() {
        let err = Change::parse(Category::Session, EventKind::Deleted, "s", Value::Null).unwrap_err();
        assert_eq!(
            err,
            StateError::UnsupportedEventKind {
                category: Category::Session,
                kind: EventKind::Deleted
            }
        );
        assert!(matches!(
            Change::parse(Category::GlobalSetting, EventKind::Created, "k", json!({"value": 1})),
            Err(StateError::UnsupportedEventKind { .. })
        ));
        assert!(matches!(
            Change::parse(
                Category::Object,
                EventKind::Connected,
                "o",
                json!({"patchId": "p"})
            ),
            Err(StateError::UnsupportedEventKind { .. })
        ));
    }

    #[test]
    fn test_wrong_field_type_is_parse_error() {
        let err = Change::parse(
            Category::Patch,
            EventKind::Created,
            "p1",
            json!({"name": 12}),
        )
        .unwrap_err();
        assert!(matches!(err, StateError::ParseError(_)));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = Change::parse(Category::Patch, EventKind::Deleted, "p1", json!([1, 2])).unwrap_err();
        assert!(matches!(err, StateError::ParseError(_)));
    }

    #[test]
    fn test_parameter_defaults_left_unset() {
        let change = Change::parse(
            Category::Parameter,
            EventKind::ParamChanged,
            "level",
            json!({"patchId": "P1", "objectId": "O1", "name": "level", "value": 0.75}),
        )
        .unwrap();
        match change.op {
            ChangeOp::Parameter { write, .. } => {
                assert_eq!(write.value, json!(0.75));
                assert_eq!(write.value_type, None);
                assert_eq!(write.is_read_only, None);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_parameter_null_value_is_kept() {
        let change = Change::parse(
            Category::Parameter,
            EventKind::ParamChanged,
            "x",
            json!({"patchId": "P1", "objectId": "O1", "name": "x", "value": null}),
        )
        .unwrap();
        assert!(matches!(
            change.op,
            ChangeOp::Parameter { ref write, .. } if write.value.is_null()
        ));
    }

    #[test]
    fn test_connection_requires_all_endpoints() {
        let err = Change::parse(
            Category::Connection,
            EventKind::Connected,
            "c1",
            json!({"patchId": "P1", "sourceId": "a", "sourceOutlet": 0, "destinationId": "b"}),
        )
        .unwrap_err();
        assert_eq!(err, StateError::MissingField("destinationInlet".into()));
    }

    #[test]
    fn test_session_state_changed_parses_embedded_session() {
        let change = Change::parse(
            Category::Session,
            EventKind::StateChanged,
            "s1",
            json!({"state": {"id": "s1", "name": "Imported", "patches": []}}),
        )
        .unwrap();
        match change.op {
            ChangeOp::Session(SessionOp::Replace { state }) => assert_eq!(state.name, "Imported"),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_empty_target_rejected() {
        let err = Change::parse(Category::Patch, EventKind::Deleted, "", Value::Null).unwrap_err();
        assert_eq!(err, StateError::MissingField("targetId".into()));
    }
}
