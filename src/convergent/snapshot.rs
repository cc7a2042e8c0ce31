//! Snapshot encoding
//!
//! A snapshot is the full change set of a document, framed as:
//!
//! ```text
//! "DSNP" | version (1 byte) | CBOR { changes: [Change, ...] }
//! ```
//!
//! Decoding validates everything before a [`Document`] is handed out:
//! framing, CBOR, every change hash, op counters in range, contiguous
//! per-actor sequence numbers and that every dependency is contained in the
//! snapshot.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::change::Change;
use super::document::Document;
use super::error::EngineError;
use super::horizon::{ActorId, SeqNum};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"DSNP";
pub const SNAPSHOT_VERSION: u8 = 1;

const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 1;

/// Serialized document state, the unit exchanged over the broadcast
/// channel and the network. Cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Snapshot(Bytes);

impl Snapshot {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Snapshot {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Serialize)]
struct SnapshotBodyRef<'a> {
    changes: Vec<&'a Change>,
}

#[derive(Deserialize)]
struct SnapshotBody {
    changes: Vec<Change>,
}

/// Encode every change of `doc`, in causal order.
pub fn encode(doc: &Document) -> Result<Snapshot, EngineError> {
    let body = SnapshotBodyRef {
        changes: doc.changes_in_causal_order(),
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + 64 * body.changes.len());
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.push(SNAPSHOT_VERSION);
    ciborium::into_writer(&body, &mut buf)
        .map_err(|e| EngineError::SerializationError(e.to_string()))?;
    Ok(Snapshot::from_bytes(buf))
}

/// Decode and validate a snapshot into a document owned by `actor`.
pub fn decode(bytes: &[u8], actor: ActorId) -> Result<Document, EngineError> {
    if bytes.is_empty() {
        return Err(EngineError::EmptySnapshot);
    }
    if bytes.len() < HEADER_LEN || bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(EngineError::BadMagic);
    }
    let version = bytes[SNAPSHOT_MAGIC.len()];
    if version != SNAPSHOT_VERSION {
        return Err(EngineError::UnsupportedVersion(version));
    }

    let body: SnapshotBody = ciborium::from_reader(&bytes[HEADER_LEN..])
        .map_err(|e| EngineError::SerializationError(e.to_string()))?;

    let mut doc = Document::new(actor);
    for change in body.changes {
        change.verify()?;
        change.check_counters()?;
        doc.insert(Arc::new(change));
    }

    // Sequence numbers must be contiguous per actor. Changes come out
    // ordered by (actor, seq).
    let mut previous: Option<(&str, SeqNum)> = None;
    for change in doc.changes() {
        let expected = match previous {
            Some((actor, seq)) if actor == change.actor => seq.saturating_add(1),
            _ => 1,
        };
        if change.seq != expected {
            return Err(EngineError::MissingChange {
                actor: change.actor.clone(),
                seq: expected,
            });
        }
        previous = Some((change.actor.as_str(), change.seq));
    }

    // ...and everything a change depends on must be here too
    for change in doc.changes() {
        for (dep_actor, dep_seq) in change.deps.iter() {
            if !doc.horizon().has_seen(dep_actor, dep_seq) {
                return Err(EngineError::MissingChange {
                    actor: dep_actor.clone(),
                    seq: dep_seq,
                });
            }
        }
    }

    Ok(doc)
}
