//! Answers pull requests: full snapshots by category/target, and
//! differential snapshots since a timestamp.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::clock::{Timestamp, NANOS_PER_SECOND};
use crate::error::StateError;
use crate::event::Category;
use crate::model::{Parameter, Session};

/// Deltas older than this are answered with a full snapshot.
pub const DEFAULT_STALENESS_NANOS: i64 = 24 * 60 * 60 * NANOS_PER_SECOND;

/// One entity modified after the requested timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub category: Category,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub last_modified: Timestamp,
    pub data: Value,
}

/// Answer to a differential sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaResponse {
    Full {
        timestamp: Timestamp,
        state: Value,
    },
    #[serde(rename_all = "camelCase")]
    Differential {
        base_timestamp: Timestamp,
        current_timestamp: Timestamp,
        change_count: usize,
        changes: Vec<ChangeRecord>,
    },
}

impl DeltaResponse {
    pub fn is_full(&self) -> bool {
        matches!(self, DeltaResponse::Full { .. })
    }

    /// The change records of a differential answer; empty for a full one.
    pub fn changes(&self) -> &[ChangeRecord] {
        match self {
            DeltaResponse::Full { .. } => &[],
            DeltaResponse::Differential { changes, .. } => changes,
        }
    }
}

fn with_type(doc: Value, tag: &str) -> Value {
    with_fields(doc, &[("type", json!(tag))])
}

fn with_fields(doc: Value, fields: &[(&str, Value)]) -> Value {
    let mut map = match doc {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    };
    for (k, v) in fields {
        map.insert((*k).to_string(), v.clone());
    }
    Value::Object(map)
}

/// A parameter with its owners attached. The declared value type moves to
/// `valueType` because `type` carries the response tag.
fn parameter_document(param: &Parameter, object_id: &str, patch_id: &str, tag: &str) -> Value {
    json!({
        "name": param.name,
        "value": param.value,
        "valueType": param.value_type,
        "isReadOnly": param.is_read_only,
        "objectId": object_id,
        "patchId": patch_id,
        "type": tag,
    })
}


/// Split `objectId.paramName`. Exactly one separator, not at either end.
pub fn split_parameter_id(target: &str) -> Result<(&str, &str), StateError> {
    let invalid = || {
        StateError::InvalidFormat(format!(
            "expected 'objectId.paramName', got '{}'",
            target
        ))
    };
    if target.matches('.').count() != 1 {
        return Err(invalid());
    }
    match target.split_once('.') {
        Some((object_id, name)) if !object_id.is_empty() && !name.is_empty() => Ok((object_id, name)),
        _ => Err(invalid()),
    }
}

/// Snapshot of the whole session, or of one category or entity.
pub fn full_snapshot(
    session: &Session,
    category: Option<Category>,
    target: Option<&str>,
) -> Result<Value, StateError> {
    let category = match category {
        None => return Ok(with_type(session.to_document()?, "full_snapshot")),
        Some(c) => c,
    };
    let specific = target.filter(|t| !t.is_empty() && *t != "all");

    match category {
        Category::Session => Ok(json!({
            "id": session.id,
            "name": session.name,
            "creationTime": session.creation_time,
            "lastModifiedTime": session.last_modified_time,
            "type": "session_metadata",
        })),
        Category::Patch => match specific {
            None => {
                let patches = session
                    .patches
                    .values()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(json!({ "patches": patches, "type": "all_patches" }))
            }
            Some(id) => {
                let patch = session
                    .patch(id)
                    .ok_or_else(|| StateError::NotFound(format!("patch {}", id)))?;
                Ok(with_type(serde_json::to_value(patch)?, "patch"))
            }
        },
        Category::Object => match specific {
            None => {
                let mut objects = Vec::new();
                for patch in session.patches.values() {
                    for obj in patch.objects.values() {
                        objects.push(with_fields(
                            serde_json::to_value(obj)?,
                            &[("patchId", json!(patch.id))],
                        ));
                    }
                }
                Ok(json!({ "objects": objects, "type": "all_objects" }))
            }
            Some(id) => {
                let (patch, obj) = session
                    .find_object(id)
                    .ok_or_else(|| StateError::NotFound(format!("object {}", id)))?;
                // The object's own `type` field is replaced by the tag; keep it as `objectType`.
                Ok(with_fields(
                    serde_json::to_value(obj)?,
                    &[
                        ("objectType", json!(obj.object_type)),
                        ("patchId", json!(patch.id)),
                        ("type", json!("object")),
                    ],
                ))
            }
        },
        Category::Parameter => match specific {
            None => {
                let mut params = Vec::new();
                for patch in session.patches.values() {
                    for obj in patch.objects.values() {
                        for param in obj.parameters.values() {
                            params.push(parameter_document(param, &obj.id, &patch.id, "parameter"));
                        }
                    }
                }
                Ok(json!({ "parameters": params, "type": "all_parameters" }))
            }
            Some(id) => {
                let (object_id, name) = split_parameter_id(id)?;
                session
                    .find_object(object_id)
                    .and_then(|(patch, obj)| {
                        obj.parameter(name)
                            .map(|p| parameter_document(p, object_id, &patch.id, "parameter"))
                    })
                    .ok_or_else(|| StateError::NotFound(format!("parameter {}", id)))
            }
        },
        Category::Connection => match specific {
            None => {
                let mut connections = Vec::new();
                for patch in session.patches.values() {
                    for conn in patch.connections.values() {
                        connections.push(with_fields(
                            serde_json::to_value(conn)?,
                            &[("patchId", json!(patch.id))],
                        ));
                    }
                }
                Ok(json!({ "connections": connections, "type": "all_connections" }))
            }
            Some(id) => {
                let (patch, conn) = session
                    .find_connection(id)
                    .ok_or_else(|| StateError::NotFound(format!("connection {}", id)))?;
                Ok(with_fields(
                    serde_json::to_value(conn)?,
                    &[("patchId", json!(patch.id)), ("type", json!("connection"))],
                ))
            }
        },
        Category::GlobalSetting => match specific {
            None => Ok(with_type(
                serde_json::to_value(&session.global_settings)?,
                "all_global_settings",
            )),
            Some(name) => {
                let value = session
                    .global_settings
                    .get(name)
                    .ok_or_else(|| StateError::NotFound(format!("global setting {}", name)))?;
                Ok(json!({ "name": name, "value": value, "type": "global_setting" }))
            }
        },
    }
}

/// Entities modified strictly after `since`.
///
/// Falls back to a full snapshot when `since` is zero or older than
/// `staleness_nanos`. Deleted entities never appear in a delta.
pub fn differential_sync(
    session: &Session,
    since: Timestamp,
    now: Timestamp,
    staleness_nanos: i64,
) -> Result<DeltaResponse, StateError> {
    if since <= 0 || now.saturating_sub(since) > staleness_nanos {
        log::debug!("timestamp {} too old, answering with full snapshot", since);
        return Ok(DeltaResponse::Full {
            timestamp: now,
            state: session.to_document()?,
        });
    }

    let mut changes = Vec::new();
    for patch in session.patches.values() {
        if patch.last_modified_time > since {
            changes.push(ChangeRecord {
                category: Category::Patch,
                id: patch.id.clone(),
                parent_id: None,
                last_modified: patch.last_modified_time,
                data: serde_json::to_value(patch)?,
            });
        }
        for obj in patch.objects.values().filter(|o| o.last_modified_time > since) {
            changes.push(ChangeRecord {
                category: Category::Object,
                id: obj.id.clone(),
                parent_id: Some(patch.id.clone()),
                last_modified: obj.last_modified_time,
                data: serde_json::to_value(obj)?,
            });
        }
        for conn in patch.connections.values().filter(|c| c.last_modified_time > since) {
            changes.push(ChangeRecord {
                category: Category::Connection,
                id: conn.id.clone(),
                parent_id: Some(patch.id.clone()),
                last_modified: conn.last_modified_time,
                data: serde_json::to_value(conn)?,
            });
        }
    }

    let settings = &session.global_settings;
    if settings.last_modified_time > since {
        changes.push(ChangeRecord {
            category: Category::GlobalSetting,
            id: "all".into(),
            parent_id: None,
            last_modified: settings.last_modified_time,
            data: serde_json::to_value(settings)?,
        });
    }

    Ok(DeltaResponse::Differential {
        base_timestamp: since,
        current_timestamp: now,
        change_count: changes.len(),
        changes,
    })
}
