// DraftSync - replicated student draft editing

//! A single student record edited concurrently by several contexts.
//!
//! Every context holds its own copy of a conflict-free document
//! ([`convergent`]). Local edits are committed by a single-writer
//! controller ([`sync`]), fanned out to sibling contexts over a local bus
//! ([`broadcast`]) and pushed best-effort to a remote relay ([`remote`]),
//! which also seeds fresh processes. Everything received is merged, never
//! applied as a replacement, so all copies converge.

pub mod broadcast;
pub mod config;
pub mod convergent;
pub mod history;
pub mod relay;
pub mod remote;
pub mod store;
pub mod student;
pub mod sync;
pub mod types;

pub use broadcast::{ChangeBroadcaster, LocalBroadcaster, LocalBus};
pub use config::SyncConfig;
pub use convergent::{ConvergentEngine, MergeEngine, Snapshot};
pub use history::{ChangeRecord, HistoryInspector, HistoryLog};
pub use remote::{HttpRemote, MemoryRemote, RemotePersistence};
pub use store::DocumentStore;
pub use student::Student;
pub use sync::{SyncController, SyncError, SyncHandle};
pub use types::DocumentId;
