//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::NANOS_PER_SECOND;
use crate::conflict::Strategy;
use crate::error::StateError;
use crate::event_log::DEFAULT_CAPACITY;

pub const DEFAULT_STATE_FILE: &str = "~/Documents/Max 9/state/session.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Conflict resolution strategy used when merging remote snapshots.
    pub strategy: Strategy,
    /// Where `save` writes when no path is given.
    pub state_file: PathBuf,
    /// Period of the auto-persist task.
    pub sync_interval_ms: u64,
    pub auto_persist: bool,
    pub event_log_capacity: usize,
    /// Differential requests older than this get a full snapshot.
    pub staleness_threshold_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Timestamp,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            sync_interval_ms: 500,
            auto_persist: false,
            event_log_capacity: DEFAULT_CAPACITY,
            staleness_threshold_secs: 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, StateError> {
        let data = std::fs::read(path).map_err(|e| StateError::IoError(e.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    pub fn staleness_nanos(&self) -> i64 {
        (self.staleness_threshold_secs as i64).saturating_mul(NANOS_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.strategy, Strategy::Timestamp);
        assert_eq!(config.sync_interval(), Duration::from_millis(500));
        assert_eq!(config.staleness_nanos(), 86_400 * NANOS_PER_SECOND);
        assert!(!config.auto_persist);
        assert_eq!(config.event_log_capacity, 1000);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"strategy": "priority", "auto_persist": true}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.strategy, Strategy::Priority);
        assert!(config.auto_persist);
        assert_eq!(config.state_file, PathBuf::from(DEFAULT_STATE_FILE));
    }

    #[test]
    fn test_bad_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"strategy": "newest"}"#).unwrap();
        assert!(matches!(EngineConfig::from_file(&path), Err(StateError::ParseError(_))));
        assert!(matches!(
            EngineConfig::from_file(&dir.path().join("absent.json")),
            Err(StateError::IoError(_))
        ));
    }
}
