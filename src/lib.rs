// Maxsync - state synchronization core for Max sessions

pub mod applier;
pub mod change;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod engine;
pub mod error;
pub mod event;
pub mod event_log;
pub mod model;
pub mod persistence;
pub mod responder;

pub use change::Change;
pub use config::EngineConfig;
pub use conflict::{ConflictResolver, Strategy};
pub use diff::{compute_diff, DiffOp, StateDiff};
pub use engine::{LoadResponse, SaveResponse, SyncEngine, SyncResponse};
pub use error::StateError;
pub use event::{Category, EventKind, Notification, StateEvent};
pub use model::{Connection, GlobalSettings, MaxObject, Parameter, Patch, Session};
pub use responder::{ChangeRecord, DeltaResponse};
