//! Session files on disk.
//!
//! A saved file is the session document with an inline `__metadata`
//! envelope carrying the format tag checked on load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{now_nanos, Timestamp};
use crate::error::StateError;
use crate::model::Session;

pub const METADATA_KEY: &str = "__metadata";
pub const FORMAT_VERSION: &str = "1.0";
pub const FORMAT_TAG: &str = "mcp_state";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub timestamp: Timestamp,
    pub format: String,
}

impl Envelope {
    fn current() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            timestamp: now_nanos(),
            format: FORMAT_TAG.to_string(),
        }
    }
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    pub path: PathBuf,
    pub timestamp: Timestamp,
}

/// Expand a leading `~` using `$HOME`.
pub fn expand_home(path: &Path) -> Result<PathBuf, StateError> {
    let rest = match path.strip_prefix("~") {
        Ok(rest) => rest,
        Err(_) => return Ok(path.to_path_buf()),
    };
    let home = std::env::var_os("HOME")
        .ok_or_else(|| StateError::IoError("could not expand home directory".into()))?;
    Ok(PathBuf::from(home).join(rest))
}

/// Write `session` plus envelope as pretty JSON, creating parent directories.
pub fn write_session(session: &Session, path: &Path) -> Result<SaveReceipt, StateError> {
    let path = expand_home(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StateError::IoError(e.to_string()))?;
    }

    let envelope = Envelope::current();
    let mut doc = session.to_document()?;
    if let Value::Object(map) = &mut doc {
        map.insert(METADATA_KEY.into(), serde_json::to_value(&envelope)?);
    }

    let json = serde_json::to_string_pretty(&doc)?;
    std::fs::write(&path, json).map_err(|e| StateError::IoError(e.to_string()))?;
    log::info!("saved session {} to {}", session.id, path.display());

    Ok(SaveReceipt {
        path,
        timestamp: envelope.timestamp,
    })
}

/// Read a session file written by `write_session`.
pub fn read_session(path: &Path) -> Result<Session, StateError> {
    let path = expand_home(path)?;
    if !path.exists() {
        return Err(StateError::NotFound(format!(
            "state file {}",
            path.display()
        )));
    }

    let data = std::fs::read(&path).map_err(|e| StateError::IoError(e.to_string()))?;
    let mut doc: Value = serde_json::from_slice(&data)?;

    let envelope = doc
        .as_object_mut()
        .and_then(|m| m.remove(METADATA_KEY))
        .ok_or_else(|| StateError::InvalidFormat("missing state file metadata".into()))?;
    let format = envelope.get("format").and_then(Value::as_str);
    if format != Some(FORMAT_TAG) {
        return Err(StateError::InvalidFormat(format!(
            "expected format '{}', found {:?}",
            FORMAT_TAG, format
        )));
    }

    let session = Session::from_document(&doc)?;
    log::info!("loaded session {} from {}", session.id, path.display());
    Ok(session)
}
