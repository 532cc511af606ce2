//! Merging two diverged session documents.
//!
//! Both resolvers work on whole patch records: a patch from one side
//! replaces the other's wholesale, its objects and connections are never
//! merged individually.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StateError;
use crate::model::SETTINGS_TIMESTAMP_KEY;

pub trait ConflictResolver<T> {
    fn resolve(&self, local: &T, remote: &T) -> T;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Timestamp,
    Priority,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Timestamp => "timestamp",
            Strategy::Priority => "priority",
        }
    }

    pub fn resolver(&self) -> Box<dyn ConflictResolver<Value> + Send + Sync> {
        match self {
            Strategy::Timestamp => Box::new(LatestTimestampWins),
            Strategy::Priority => Box::new(HighestPriorityWins),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" => Ok(Strategy::Timestamp),
            "priority" => Ok(Strategy::Priority),
            other => Err(StateError::InvalidFormat(format!(
                "unknown conflict strategy '{}'",
                other
            ))),
        }
    }
}

/// Resolve by strategy name. Unknown names keep the local document.
pub fn resolve(local: &Value, remote: &Value, strategy: &str) -> Value {
    match strategy.parse::<Strategy>() {
        Ok(s) => s.resolver().resolve(local, remote),
        Err(e) => {
            log::warn!("{}, keeping local state", e);
            local.clone()
        }
    }
}

/// Newer `lastModifiedTime` wins, at session, patch and settings level.
pub struct LatestTimestampWins;

/// Higher `priority` wins at session and patch level; settings always take
/// the remote value on overlap.
pub struct HighestPriorityWins;

const TIMESTAMP: &str = "lastModifiedTime";
const PRIORITY: &str = "priority";

impl ConflictResolver<Value> for LatestTimestampWins {
    fn resolve(&self, local: &Value, remote: &Value) -> Value {
        merge(local, remote, newer_timestamp, false).unwrap_or_else(|| {
            log::warn!("timestamp resolution failed on malformed document, keeping local state");
            local.clone()
        })
    }
}

impl ConflictResolver<Value> for HighestPriorityWins {
    fn resolve(&self, local: &Value, remote: &Value) -> Value {
        merge(local, remote, higher_priority, true).unwrap_or_else(|| {
            log::warn!("priority resolution failed on malformed document, keeping local state");
            local.clone()
        })
    }
}

/// Decides whether the remote record replaces the local one.
type RemoteWins = fn(&Map<String, Value>, &Map<String, Value>) -> bool;

/// Both sides stamped and remote strictly newer. Stamps are compared as
/// integers; nanosecond epochs lose precision as floats.
fn newer_timestamp(local: &Map<String, Value>, remote: &Map<String, Value>) -> bool {
    match (
        local.get(TIMESTAMP).and_then(Value::as_i64),
        remote.get(TIMESTAMP).and_then(Value::as_i64),
    ) {
        (Some(l), Some(r)) => r > l,
        _ => false,
    }
}

/// Both sides carry a numeric priority and remote's is higher.
fn higher_priority(local: &Map<String, Value>, remote: &Map<String, Value>) -> bool {
    match (
        local.get(PRIORITY).and_then(Value::as_f64),
        remote.get(PRIORITY).and_then(Value::as_f64),
    ) {
        (Some(l), Some(r)) => r > l,
        _ => false,
    }
}

fn merge(local: &Value, remote: &Value, remote_wins: RemoteWins, settings_always_remote: bool) -> Option<Value> {
    let local_map = local.as_object()?;
    let remote_map = remote.as_object()?;
    let mut resolved = local_map.clone();

    if remote_wins(local_map, remote_map) {
        for (k, v) in remote_map {
            if !v.is_object() && !v.is_array() {
                resolved.insert(k.clone(), v.clone());
            }
        }
    }

    if let Some(remote_patches) = remote_map.get("patches") {
        let merged = merge_patches(local_map.get("patches"), remote_patches, remote_wins)?;
        resolved.insert("patches".into(), merged);
    }

    if let Some(remote_settings) = remote_map.get("globalSettings") {
        let merged = match local_map.get("globalSettings") {
            Some(local_settings) => {
                let l = local_settings.as_object()?;
                let r = remote_settings.as_object()?;
                if settings_always_remote || newer_timestamp(l, r) {
                    Value::Object(overlay_settings(l, r))
                } else {
                    local_settings.clone()
                }
            }
            None => remote_settings.clone(),
        };
        resolved.insert("globalSettings".into(), merged);
    }

    Some(Value::Object(resolved))
}

fn merge_patches(local: Option<&Value>, remote: &Value, remote_wins: RemoteWins) -> Option<Value> {
    let mut merged: Vec<Value> = match local {
        Some(v) => v.as_array()?.clone(),
        None => Vec::new(),
    };
    for remote_patch in remote.as_array()? {
        let remote_obj = remote_patch.as_object()?;
        let id = remote_obj.get("id")?;
        let existing = merged
            .iter_mut()
            .find(|p| p.get("id") == Some(id));
        match existing {
            Some(local_patch) => {
                let local_obj = local_patch.as_object()?;
                if remote_wins(local_obj, remote_obj) {
                    *local_patch = remote_patch.clone();
                }
            }
            None => merged.push(remote_patch.clone()),
        }
    }
    Some(Value::Array(merged))
}

/// Remote keys overwrite local ones; the aggregate timestamp keeps the newer.
fn overlay_settings(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut out = local.clone();
    for (k, v) in remote.iter().filter(|(k, _)| k.as_str() != SETTINGS_TIMESTAMP_KEY) {
        out.insert(k.clone(), v.clone());
    }
    let newest = [local, remote]
        .iter()
        .filter_map(|m| m.get(SETTINGS_TIMESTAMP_KEY).and_then(Value::as_i64))
        .max();
    if let Some(ts) = newest {
        out.insert(SETTINGS_TIMESTAMP_KEY.into(), Value::from(ts));
    }
    out
}
