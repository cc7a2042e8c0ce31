use thiserror::Error;

use super::horizon::{ActorId, SeqNum};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Snapshot is empty")]
    EmptySnapshot,

    #[error("Not a document snapshot (bad magic bytes)")]
    BadMagic,

    #[error("Unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Change {actor}:{seq} failed hash verification")]
    HashMismatch { actor: ActorId, seq: SeqNum },

    #[error("Change {actor}:{seq} is missing from the snapshot")]
    MissingChange { actor: ActorId, seq: SeqNum },

    #[error("Change {actor}:{seq} has an out-of-range sequence number or op counter")]
    CounterOutOfRange { actor: ActorId, seq: SeqNum },

    #[error("Document has used up its op counters")]
    CounterExhausted,

    #[error("Mutation rejected: {0}")]
    Mutation(String),
}
