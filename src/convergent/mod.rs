//! Convergent Document System
//!
//! An operation-based CRDT: documents are sets of authored changes, state
//! is materialized by latest-wins resolution on Lamport op ids, and merging
//! is set union. The [`MergeEngine`] trait is the boundary the replication
//! layer sees.

mod change;
mod document;
mod engine;
mod error;
mod horizon;
mod snapshot;
mod transaction;
mod value;

pub use change::{Change, Op, OpId};
pub use document::{Document, DocumentState};
pub use engine::{ConvergentEngine, HistoryPoint, MergeEngine};
pub use error::EngineError;
pub use horizon::{ActorId, Horizon, SeqNum};
pub use snapshot::{Snapshot, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use transaction::Transaction;
pub use value::{obj_path, ObjPath, Value};
