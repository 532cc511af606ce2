//! Applies validated changes to the session model.
//!
//! Every branch performs all of its lookups and checks before touching the
//! model, so a failed change leaves the session exactly as it was.

use crate::change::{Change, ChangeOp, ConnectionOp, ObjectOp, ParameterWrite, PatchOp, SessionOp};
use crate::clock::Timestamp;
use crate::error::StateError;
use crate::model::{Connection, MaxObject, Parameter, Patch, Session, SETTINGS_TIMESTAMP_KEY};

/// What `apply` did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Addressed to a session other than ours; dropped without error.
    Ignored,
}

pub fn apply(session: &mut Session, change: &Change, now: Timestamp) -> Result<ApplyOutcome, StateError> {
    let target = change.target_id.as_str();
    match &change.op {
        ChangeOp::Session(op) => {
            if target != session.id {
                log::debug!("ignoring session change for {} (current {})", target, session.id);
                return Ok(ApplyOutcome::Ignored);
            }
            apply_session(session, op, now);
        }
        ChangeOp::Patch(op) => apply_patch(session, target, op, now)?,
        ChangeOp::Object { patch_id, op } => {
            let patch = session
                .patch_mut(patch_id)
                .ok_or_else(|| StateError::NotFound(format!("patch {}", patch_id)))?;
            apply_object(patch, target, op, now)?;
        }
        ChangeOp::Parameter {
            patch_id,
            object_id,
            write,
        } => {
            let patch = session
                .patch_mut(patch_id)
                .ok_or_else(|| StateError::NotFound(format!("patch {}", patch_id)))?;
            apply_parameter(patch, object_id, write, now)?;
        }
        ChangeOp::Connection { patch_id, op } => {
            let patch = session
                .patch_mut(patch_id)
                .ok_or_else(|| StateError::NotFound(format!("patch {}", patch_id)))?;
            apply_connection(patch, target, op, now);
        }
        ChangeOp::GlobalSetting { value } => {
            if target == SETTINGS_TIMESTAMP_KEY {
                return Err(StateError::InvalidFormat(format!(
                    "'{}' is reserved",
                    SETTINGS_TIMESTAMP_KEY
                )));
            }
            session.global_settings.set(target, value.clone(), now);
        }
    }
    Ok(ApplyOutcome::Applied)
}

fn apply_session(session: &mut Session, op: &SessionOp, now: Timestamp) {
    match op {
        SessionOp::Update { name } => {
            if let Some(name) = name {
                session.name = name.clone();
            }
        }
        SessionOp::Replace { state } => {
            *session = (**state).clone();
        }
    }
    session.last_modified_time = now;
}

fn apply_patch(session: &mut Session, patch_id: &str, op: &PatchOp, now: Timestamp) -> Result<(), StateError> {
    match op {
        PatchOp::Create { name, path } => {
            let mut patch = Patch::new(patch_id, name.clone(), path.clone().unwrap_or_default());
            patch.last_modified_time = now;
            session.patches.insert(patch_id.to_string(), patch);
            log::debug!("created patch {} ({})", name, patch_id);
        }
        PatchOp::Update {
            name,
            path,
            is_modified,
        } => {
            let patch = session
                .patch_mut(patch_id)
                .ok_or_else(|| StateError::NotFound(format!("patch {}", patch_id)))?;
            if let Some(name) = name {
                patch.name = name.clone();
                patch.is_modified = true;
            }
            if let Some(path) = path {
                patch.path = path.clone();
            }
            if let Some(flag) = is_modified {
                patch.is_modified = *flag;
            }
            patch.last_modified_time = now;
        }
        PatchOp::Delete => {
            if session.patches.remove(patch_id).is_some() {
                log::debug!("deleted patch {}", patch_id);
            }
        }
    }
    Ok(())
}

fn apply_object(patch: &mut Patch, object_id: &str, op: &ObjectOp, now: Timestamp) -> Result<(), StateError> {
    match op {
        ObjectOp::Create {
            object_type,
            position,
            size,
            inlets,
            outlets,
            parameters,
        } => {
            let mut obj = MaxObject::new(object_id, object_type.clone());
            if let Some(position) = position {
                obj.position = *position;
            }
            if let Some(size) = size {
                obj.size = *size;
            }
            if let Some(n) = inlets {
                obj.inlets = *n;
            }
            if let Some(n) = outlets {
                obj.outlets = *n;
            }
            for param in parameters {
                obj.add_parameter(param.clone());
            }
            obj.last_modified_time = now;
            patch.objects.insert(object_id.to_string(), obj);
            log::debug!("created object {} ({})", object_type, object_id);
        }
        ObjectOp::Delete => {
            if patch.objects.remove(object_id).is_none() {
                return Ok(());
            }
            log::debug!("deleted object {}", object_id);
        }
        ObjectOp::Update {
            position,
            size,
            inlets,
            outlets,
        } => {
            let obj = object_mut(patch, object_id)?;
            if let Some(position) = position {
                obj.position = *position;
            }
            if let Some(size) = size {
                obj.size = *size;
            }
            if let Some(n) = inlets {
                obj.inlets = *n;
            }
            if let Some(n) = outlets {
                obj.outlets = *n;
            }
            obj.last_modified_time = now;
        }
        ObjectOp::Move(position) => {
            let obj = object_mut(patch, object_id)?;
            obj.position = *position;
            obj.last_modified_time = now;
        }
        ObjectOp::Resize(size) => {
            let obj = object_mut(patch, object_id)?;
            obj.size = *size;
            obj.last_modified_time = now;
        }
    }
    patch.touch(now);
    Ok(())
}

fn object_mut<'a>(patch: &'a mut Patch, object_id: &str) -> Result<&'a mut MaxObject, StateError> {
    patch
        .objects
        .get_mut(object_id)
        .ok_or_else(|| StateError::NotFound(format!("object {}", object_id)))
}

fn apply_parameter(
    patch: &mut Patch,
    object_id: &str,
    write: &ParameterWrite,
    now: Timestamp,
) -> Result<(), StateError> {
    let obj = object_mut(patch, object_id)?;
    match obj.parameters.get_mut(&write.name) {
        Some(param) => param.set_value(write.value.clone())?,
        None => {
            let mut param = Parameter::new(write.name.clone(), write.value.clone());
            if let Some(value_type) = &write.value_type {
                param.value_type = value_type.clone();
            }
            param.is_read_only = write.is_read_only.unwrap_or(false);
            obj.add_parameter(param);
        }
    }
    obj.last_modified_time = now;
    log::debug!("updated parameter {} for object {}", write.name, object_id);
    patch.touch(now);
    Ok(())
}

fn apply_connection(patch: &mut Patch, connection_id: &str, op: &ConnectionOp, now: Timestamp) {
    match op {
        ConnectionOp::Connect {
            source_id,
            source_outlet,
            destination_id,
            destination_inlet,
        } => {
            let conn = Connection {
                id: connection_id.to_string(),
                source_id: source_id.clone(),
                source_outlet: *source_outlet,
                destination_id: destination_id.clone(),
                destination_inlet: *destination_inlet,
                last_modified_time: now,
            };
            patch.connections.insert(connection_id.to_string(), conn);
            log::debug!(
                "connected {}:{} -> {}:{}",
                source_id,
                source_outlet,
                destination_id,
                destination_inlet
            );
        }
        ConnectionOp::Disconnect => {
            if patch.connections.remove(connection_id).is_none() {
                return;
            }
            log::debug!("deleted connection {}", connection_id);
        }
    }
    patch.touch(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Category, EventKind};
    use crate::model::{Position, Size};
    use serde_json::{json, Value};

    fn change(category: Category, kind: EventKind, target: &str, payload: Value) -> Change {
        Change::parse(category, kind, target, payload).unwrap()
    }

    fn session_with_object() -> Session {
        let mut session = Session::new("S", "Session", 1);
        let c = change(Category::Patch, EventKind::Created, "P1", json!({"name": "Test"}));
        apply(&mut session, &c, 2).unwrap();
        let c = change(
            Category::Object,
            EventKind::Created,
            "O1",
            json!({
                "patchId": "P1",
                "type": "slider",
                "position": {"x": 10, "y": 20},
                "parameters": [{"name": "value", "value": 0.5}]
            }),
        );
        apply(&mut session, &c, 3).unwrap();
        session
    }

    #[test]
    fn test_create_patch_and_object() {
        let session = session_with_object();
        let patch = session.patch("P1").unwrap();
        assert_eq!(patch.name, "Test");
        assert_eq!(patch.path, "");
        assert!(patch.is_modified);
        assert_eq!(patch.last_modified_time, 3);

        let obj = patch.object("O1").unwrap();
        assert_eq!(obj.object_type, "slider");
        assert_eq!(obj.position.x, 10);
        assert_eq!(obj.last_modified_time, 3);
        assert_eq!(obj.parameter("value").unwrap().value, json!(0.5));
    }

    #[test]
    fn test_object_in_unknown_patch_is_not_found() {
        let mut session = Session::new("S", "Session", 1);
        let c = change(
            Category::Object,
            EventKind::Created,
            "O1",
            json!({"patchId": "nope", "type": "slider"}),
        );
        assert!(matches!(apply(&mut session, &c, 2), Err(StateError::NotFound(_))));
    }

    #[test]
    fn test_move_missing_object_is_not_found() {
        let mut session = session_with_object();
        let c = change(
            Category::Object,
            EventKind::Moved,
            "ghost",
            json!({"patchId": "P1", "position": {"x": 1, "y": 1}}),
        );
        assert!(matches!(apply(&mut session, &c, 4), Err(StateError::NotFound(_))));
    }

    #[test]
    fn test_update_missing_object_fails() {
        let mut session = session_with_object();
        let before = session.clone();
        let c = change(
            Category::Object,
            EventKind::Updated,
            "ghost",
            json!({"patchId": "P1", "size": {"width": 5, "height": 5}}),
        );
        assert!(matches!(apply(&mut session, &c, 4), Err(StateError::NotFound(_))));
        assert_eq!(session, before);
    }

    #[test]
    fn test_resize_stamps_object_and_patch() {
        let mut session = session_with_object();
        let c = change(
            Category::Object,
            EventKind::Resized,
            "O1",
            json!({"patchId": "P1", "size": {"width": 40, "height": 12}}),
        );
        apply(&mut session, &c, 9).unwrap();
        let patch = session.patch("P1").unwrap();
        assert_eq!(patch.object("O1").unwrap().size.width, 40);
        assert_eq!(patch.object("O1").unwrap().last_modified_time, 9);
        assert_eq!(patch.last_modified_time, 9);
        assert_eq!(session.last_modified_time, 1);
    }

    #[test]
    fn test_object_update_changes_given_fields() {
        let mut session = session_with_object();
        let c = change(
            Category::Object,
            EventKind::Updated,
            "O1",
            json!({
                "patchId": "P1",
                "position": {"x": 5, "y": 6},
                "size": {"width": 30, "height": 8},
                "inlets": 2,
                "outlets": 3
            }),
        );
        assert_eq!(apply(&mut session, &c, 7), Ok(ApplyOutcome::Applied));
        let patch = session.patch("P1").unwrap();
        let obj = patch.object("O1").unwrap();
        assert_eq!(obj.position, Position { x: 5, y: 6 });
        assert_eq!(obj.size, Size { width: 30, height: 8 });
        assert_eq!(obj.inlets, 2);
        assert_eq!(obj.outlets, 3);
        assert_eq!(obj.object_type, "slider");
        assert_eq!(obj.last_modified_time, 7);
        assert_eq!(patch.last_modified_time, 7);
    }

    #[test]
    fn test_object_delete_is_idempotent() {
        let mut session = session_with_object();
        let delete = change(Category::Object, EventKind::Deleted, "O1", json!({"patchId": "P1"}));

        assert_eq!(apply(&mut session, &delete, 8), Ok(ApplyOutcome::Applied));
        let patch = session.patch("P1").unwrap();
        assert!(patch.object("O1").is_none());
        assert_eq!(patch.last_modified_time, 8);

        assert_eq!(apply(&mut session, &delete, 9), Ok(ApplyOutcome::Applied));
        assert_eq!(session.patch("P1").unwrap().last_modified_time, 8);
    }

    #[test]
    fn test_param_changed_creates_missing_parameter() {
        let mut session = session_with_object();
        let c = change(
            Category::Parameter,
            EventKind::ParamChanged,
            "level",
            json!({"patchId": "P1", "objectId": "O1", "name": "level", "value": 0.75}),
        );
        apply(&mut session, &c, 5).unwrap();
        let param = session
            .patch("P1")
            .unwrap()
            .object("O1")
            .unwrap()
            .parameter("level")
            .unwrap()
            .clone();
        assert_eq!(param.value, json!(0.75));
        assert_eq!(param.value_type, "any");
        assert!(!param.is_read_only);
    }

    #[test]
    fn test_param_changed_overwrites_existing_value() {
        let mut session = session_with_object();
        let c = change(
            Category::Parameter,
            EventKind::ParamChanged,
            "value",
            json!({"patchId": "P1", "objectId": "O1", "name": "value", "value": 1.0, "type": "float"}),
        );
        apply(&mut session, &c, 5).unwrap();
        let param = session.patch("P1").unwrap().object("O1").unwrap().parameter("value").unwrap();
        assert_eq!(param.value, json!(1.0));
        // Declared type only applies on creation.
        assert_eq!(param.value_type, "any");
    }

    #[test]
    fn test_read_only_parameter_is_untouched() {
        let mut session = session_with_object();
        let create = change(
            Category::Parameter,
            EventKind::ParamChanged,
            "locked",
            json!({"patchId": "P1", "objectId": "O1", "name": "locked", "value": 1, "isReadOnly": true}),
        );
        apply(&mut session, &create, 5).unwrap();
        let before = session.clone();

        let write = change(
            Category::Parameter,
            EventKind::ParamChanged,
            "locked",
            json!({"patchId": "P1", "objectId": "O1", "name": "locked", "value": 2}),
        );
        assert_eq!(
            apply(&mut session, &write, 6),
            Err(StateError::ReadOnly("locked".into()))
        );
        assert_eq!(session, before);
    }

    #[test]
    fn test_dangling_connection_allowed_and_disconnect_idempotent() {
        let mut session = session_with_object();
        let c = change(
            Category::Connection,
            EventKind::Connected,
            "C1",
            json!({"patchId": "P1", "sourceId": "O1", "sourceOutlet": 0, "destinationId": "missing", "destinationInlet": 1}),
        );
        apply(&mut session, &c, 6).unwrap();
        assert_eq!(
            session.patch("P1").unwrap().connection("C1").unwrap().destination_id,
            "missing"
        );

        let d = change(Category::Connection, EventKind::Disconnected, "C1", json!({"patchId": "P1"}));
        apply(&mut session, &d, 7).unwrap();
        assert!(session.patch("P1").unwrap().connection("C1").is_none());
        assert_eq!(apply(&mut session, &d, 8), Ok(ApplyOutcome::Applied));
    }

    #[test]
    fn test_patch_delete_is_idempotent() {
        let mut session = session_with_object();
        let d = change(Category::Patch, EventKind::Deleted, "P1", Value::Null);
        apply(&mut session, &d, 5).unwrap();
        assert!(session.patch("P1").is_none());
        assert_eq!(apply(&mut session, &d, 6), Ok(ApplyOutcome::Applied));
    }

    #[test]
    fn test_patch_update_requires_existing_patch() {
        let mut session = Session::new("S", "Session", 1);
        let c = change(Category::Patch, EventKind::Updated, "P9", json!({"name": "x"}));
        assert!(matches!(apply(&mut session, &c, 2), Err(StateError::NotFound(_))));
    }

    #[test]
    fn test_patch_update_explicit_modified_flag_wins() {
        let mut session = session_with_object();
        let c = change(
            Category::Patch,
            EventKind::Updated,
            "P1",
            json!({"name": "Renamed", "path": "/tmp/a.maxpat", "isModified": false}),
        );
        apply(&mut session, &c, 8).unwrap();
        let patch = session.patch("P1").unwrap();
        assert_eq!(patch.name, "Renamed");
        assert_eq!(patch.path, "/tmp/a.maxpat");
        assert!(!patch.is_modified);
        assert_eq!(patch.last_modified_time, 8);
    }

    #[test]
    fn test_session_update_for_other_session_ignored() {
        let mut session = Session::new("S", "Session", 1);
        let c = change(Category::Session, EventKind::Updated, "other", json!({"name": "Hijack"}));
        assert_eq!(apply(&mut session, &c, 2), Ok(ApplyOutcome::Ignored));
        assert_eq!(session.name, "Session");
        assert_eq!(session.last_modified_time, 1);

        let c = change(Category::Session, EventKind::Updated, "S", json!({"name": "Renamed"}));
        assert_eq!(apply(&mut session, &c, 3), Ok(ApplyOutcome::Applied));
        assert_eq!(session.name, "Renamed");
        assert_eq!(session.last_modified_time, 3);
    }

    #[test]
    fn test_session_state_changed_replaces_everything() {
        let mut session = session_with_object();
        let c = change(
            Category::Session,
            EventKind::StateChanged,
            "S",
            json!({"state": {"id": "S2", "name": "Restored", "patches": [{"id": "PX", "name": "X"}]}}),
        );
        apply(&mut session, &c, 10).unwrap();
        assert_eq!(session.id, "S2");
        assert_eq!(session.name, "Restored");
        assert!(session.patch("P1").is_none());
        assert!(session.patch("PX").is_some());
        assert_eq!(session.last_modified_time, 10);
    }

    #[test]
    fn test_global_setting_created_and_stamped() {
        let mut session = Session::new("S", "Session", 1);
        let c = change(Category::GlobalSetting, EventKind::Updated, "tempo", json!({"value": 120}));
        apply(&mut session, &c, 4).unwrap();
        assert_eq!(session.global_settings.get("tempo"), Some(&json!(120)));
        assert_eq!(session.global_settings.last_modified_time, 4);
    }

    #[test]
    fn test_global_setting_timestamp_key_reserved() {
        let mut session = Session::new("S", "Session", 1);
        let c = change(
            Category::GlobalSetting,
            EventKind::Updated,
            SETTINGS_TIMESTAMP_KEY,
            json!({"value": 0}),
        );
        assert!(matches!(apply(&mut session, &c, 2), Err(StateError::InvalidFormat(_))));
    }
}
