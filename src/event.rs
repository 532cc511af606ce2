//! Event vocabulary: what changed, how, and when.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Timestamp;
use crate::error::StateError;

/// Which part of the session a change targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Session,
    Patch,
    Object,
    Parameter,
    Connection,
    GlobalSetting,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Session => "session",
            Category::Patch => "patch",
            Category::Object => "object",
            Category::Parameter => "parameter",
            Category::Connection => "connection",
            Category::GlobalSetting => "globalSetting",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(Category::Session),
            "patch" => Ok(Category::Patch),
            "object" => Ok(Category::Object),
            "parameter" => Ok(Category::Parameter),
            "connection" => Ok(Category::Connection),
            "globalsetting" | "global_setting" => Ok(Category::GlobalSetting),
            _ => Err(StateError::InvalidFormat(format!("unknown category: {}", s))),
        }
    }
}

/// What kind of change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Connected,
    Disconnected,
    Moved,
    Resized,
    ParamChanged,
    StateChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Moved => "moved",
            EventKind::Resized => "resized",
            EventKind::ParamChanged => "paramChanged",
            EventKind::StateChanged => "stateChanged",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(EventKind::Created),
            "updated" => Ok(EventKind::Updated),
            "deleted" => Ok(EventKind::Deleted),
            "connected" => Ok(EventKind::Connected),
            "disconnected" => Ok(EventKind::Disconnected),
            "moved" => Ok(EventKind::Moved),
            "resized" => Ok(EventKind::Resized),
            "paramchanged" | "param_changed" => Ok(EventKind::ParamChanged),
            "statechanged" | "state_changed" => Ok(EventKind::StateChanged),
            _ => Err(StateError::InvalidFormat(format!("unknown event kind: {}", s))),
        }
    }
}

/// An accepted mutation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    pub category: Category,
    #[serde(rename = "eventType")]
    pub kind: EventKind,
    #[serde(rename = "objectId")]
    pub target_id: String,
    pub data: Value,
    pub timestamp: Timestamp,
}

impl StateEvent {
    pub fn new(
        category: Category,
        kind: EventKind,
        target_id: impl Into<String>,
        data: Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            category,
            kind,
            target_id: target_id.into(),
            data,
            timestamp,
        }
    }

    /// Address the transport publishes this event under,
    /// e.g. `/max/state/object/created`.
    pub fn address(&self) -> String {
        format!("/max/state/{}/{}", self.category, self.kind)
    }
}

/// Messages pushed to observers of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A single accepted change.
    StateChange(StateEvent),
    /// The whole session was replaced (after a load); carries the new document.
    Snapshot { state: Value, timestamp: Timestamp },
}
