//! The state engine: one session, its event log, observers, and the
//! background persistence task.
//!
//! All reads and writes of the session take the session lock for their
//! whole duration. The event log has its own lock but is only appended to
//! while the session lock is still held, so log order is apply order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::applier::{self, ApplyOutcome};
use crate::change::Change;
use crate::clock::{Clock, Timestamp};
use crate::config::EngineConfig;
use crate::conflict::ConflictResolver;
use crate::error::StateError;
use crate::event::{Category, Notification, StateEvent};
use crate::event_log::EventLog;
use crate::model::Session;
use crate::persistence;
use crate::responder::{self, DeltaResponse};

pub const DEFAULT_SESSION_NAME: &str = "Max 9 Session";

const NOTIFY_CAPACITY: usize = 256;

/// A pull-request answer tagged with the caller's request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub request_id: String,
    pub timestamp: Timestamp,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub request_id: String,
    pub path: PathBuf,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub request_id: String,
    pub path: PathBuf,
    pub session_id: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Newest timestamp anywhere in the tree.
fn newest_timestamp(session: &Session) -> Timestamp {
    let mut newest = session
        .last_modified_time
        .max(session.creation_time)
        .max(session.global_settings.last_modified_time);
    for patch in session.patches.values() {
        newest = newest.max(patch.last_modified_time);
        for obj in patch.objects.values() {
            newest = newest.max(obj.last_modified_time);
        }
        for conn in patch.connections.values() {
            newest = newest.max(conn.last_modified_time);
        }
    }
    newest
}

/// A freshly initialized session with the default settings.
pub fn fresh_session(now: Timestamp) -> Session {
    let mut session = Session::new(format!("session-{}", Uuid::new_v4()), DEFAULT_SESSION_NAME, now);
    session.global_settings.set("oscPort", json!(7400), now);
    session.global_settings.set("sampling_rate", json!(44100), now);
    session
}

/// State reachable from both the engine handle and its background task.
struct Shared {
    config: EngineConfig,
    session: Mutex<Option<Session>>,
    log: Mutex<EventLog>,
    clock: Clock,
    notify_tx: broadcast::Sender<Notification>,
}

impl Shared {
    fn notify(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.notify_tx.send(notification);
    }

    fn save(&self, request_id: &str, path: Option<&Path>) -> Result<SaveResponse, StateError> {
        let path = path.unwrap_or(self.config.state_file.as_path());
        let guard = lock(&self.session);
        let session = guard.as_ref().ok_or(StateError::NotInitialized)?;
        let receipt = persistence::write_session(session, path)?;
        Ok(SaveResponse {
            request_id: request_id.to_string(),
            path: receipt.path,
            timestamp: receipt.timestamp,
        })
    }

    /// Swap in a new session, reset the log and tell observers.
    fn replace_session(&self, session: Session) -> Result<(), StateError> {
        self.install(lock(&self.session), session)
    }

    /// Swap under an already held session lock, so no change can land
    /// between reading the old session and installing the new one.
    fn install(&self, mut guard: MutexGuard<'_, Option<Session>>, session: Session) -> Result<(), StateError> {
        let state = session.to_document()?;
        self.clock.observe(newest_timestamp(&session));
        let timestamp = self.clock.now();

        *guard = Some(session);
        lock(&self.log).reset_to(timestamp);
        drop(guard);

        self.notify(Notification::Snapshot { state, timestamp });
        Ok(())
    }
}

pub struct SyncEngine {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        let log = EventLog::new(config.event_log_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                session: Mutex::new(None),
                log: Mutex::new(log),
                clock: Clock::new(),
                notify_tx,
            }),
            shutdown_tx,
            persist_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.shared.session).is_some()
    }

    /// Start a fresh session, returning its id.
    ///
    /// Resets the event log. When auto-persist is configured, also starts the
    /// periodic save task; that requires a running tokio runtime.
    pub fn init(&self) -> String {
        let now = self.shared.clock.now();
        let session = fresh_session(now);
        let id = session.id.clone();
        {
            let mut guard = lock(&self.shared.session);
            *guard = Some(session);
            lock(&self.shared.log).clear();
        }
        log::info!("initialized session {}", id);

        if self.shared.config.auto_persist {
            self.start_auto_persist();
        }
        id
    }

    fn start_auto_persist(&self) {
        let mut slot = lock(&self.persist_task);
        if slot.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("auto-persist requested outside a tokio runtime, not started");
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = shared.config.sync_interval();
        *slot = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let shared = Arc::clone(&shared);
                        let request_id = format!("auto-{}", Uuid::new_v4());
                        let result = tokio::task::spawn_blocking(move || shared.save(&request_id, None)).await;
                        match result {
                            Ok(Ok(saved)) => log::debug!("auto-persisted to {}", saved.path.display()),
                            Ok(Err(StateError::NotInitialized)) => {}
                            Ok(Err(e)) => log::warn!("auto-persist failed: {}", e),
                            Err(e) => log::warn!("auto-persist task failed: {}", e),
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!("auto-persist task stopped");
        }));
    }

    /// Stop the background task and wait for it. An in-flight save finishes.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let task = lock(&self.persist_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("auto-persist task ended abnormally: {}", e);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.notify_tx.subscribe()
    }

    /// Validate and apply a change descriptor as delivered by the transport.
    ///
    /// Returns `Ok(None)` for changes that are accepted but have no effect,
    /// such as a rename addressed to another session.
    pub fn apply_change(
        &self,
        category: &str,
        kind: &str,
        target_id: &str,
        payload: Value,
    ) -> Result<Option<StateEvent>, StateError> {
        let change = Change::parse_str(category, kind, target_id, payload)?;
        self.apply(change)
    }

    pub fn apply(&self, change: Change) -> Result<Option<StateEvent>, StateError> {
        let mut guard = lock(&self.shared.session);
        let session = guard.as_mut().ok_or(StateError::NotInitialized)?;
        let now = self.shared.clock.now();

        match applier::apply(session, &change, now)? {
            ApplyOutcome::Ignored => Ok(None),
            ApplyOutcome::Applied => {
                if change.category == Category::Session {
                    // A replaced session may carry stamps ahead of ours.
                    self.shared.clock.observe(newest_timestamp(session));
                }
                let event = StateEvent::new(
                    change.category,
                    change.kind,
                    change.target_id,
                    change.payload,
                    now,
                );
                lock(&self.shared.log).append(event.clone());
                drop(guard);
                self.shared.notify(Notification::StateChange(event.clone()));
                Ok(Some(event))
            }
        }
    }

    pub fn full_snapshot(&self, category: Option<Category>, target_id: Option<&str>) -> Result<Value, StateError> {
        let guard = lock(&self.shared.session);
        let session = guard.as_ref().ok_or(StateError::NotInitialized)?;
        responder::full_snapshot(session, category, target_id)
    }

    pub fn differential_sync(&self, since: Timestamp) -> Result<DeltaResponse, StateError> {
        let guard = lock(&self.shared.session);
        let session = guard.as_ref().ok_or(StateError::NotInitialized)?;
        let now = self.shared.clock.now();
        responder::differential_sync(session, since, now, self.shared.config.staleness_nanos())
    }

    /// Answer a snapshot request. `category` is given as the transport spells it.
    pub fn handle_snapshot_request(
        &self,
        request_id: &str,
        category: Option<&str>,
        target_id: Option<&str>,
    ) -> Result<SyncResponse, StateError> {
        let category = category.map(str::parse::<Category>).transpose()?;
        let data = self.full_snapshot(category, target_id)?;
        Ok(SyncResponse {
            request_id: request_id.to_string(),
            timestamp: self.shared.clock.now(),
            data,
        })
    }

    pub fn handle_diff_request(&self, request_id: &str, since: Timestamp) -> Result<SyncResponse, StateError> {
        let delta = self.differential_sync(since)?;
        let timestamp = match &delta {
            DeltaResponse::Full { timestamp, .. } => *timestamp,
            DeltaResponse::Differential { current_timestamp, .. } => *current_timestamp,
        };
        Ok(SyncResponse {
            request_id: request_id.to_string(),
            timestamp,
            data: serde_json::to_value(&delta)?,
        })
    }

    /// Retained events newer than `since`; `None` when the log can no
    /// longer answer and a full snapshot is needed.
    pub fn events_since(&self, since: Timestamp) -> Option<Vec<StateEvent>> {
        lock(&self.shared.log).since(since)
    }

    /// Merge a remote session document into ours using the configured
    /// strategy, and adopt the result. The session lock is held from the
    /// read of local state until the merged session is installed.
    pub fn merge_remote(&self, remote: &Value) -> Result<Value, StateError> {
        let guard = lock(&self.shared.session);
        let local = guard.as_ref().ok_or(StateError::NotInitialized)?.to_document()?;
        let resolver = self.shared.config.strategy.resolver();
        let merged = resolver.resolve(&local, remote);
        if merged != local {
            let session = Session::from_document(&merged)?;
            self.shared.install(guard, session)?;
            log::info!("merged remote state using {} strategy", self.shared.config.strategy);
        }
        Ok(merged)
    }

    /// Save to `path`, or to the configured state file.
    pub fn save(&self, request_id: &str, path: Option<&Path>) -> Result<SaveResponse, StateError> {
        self.shared.save(request_id, path)
    }

    pub fn load(&self, request_id: &str, path: &Path) -> Result<LoadResponse, StateError> {
        let session = persistence::read_session(path)?;
        let session_id = session.id.clone();
        self.shared.replace_session(session)?;
        Ok(LoadResponse {
            request_id: request_id.to_string(),
            path: persistence::expand_home(path)?,
            session_id,
        })
    }
}
