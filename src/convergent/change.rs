//! Operations and the changes that carry them

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::EngineError;
use super::horizon::{ActorId, Horizon, SeqNum};
use super::value::{ObjPath, Value};

/// Highest Lamport counter any op may carry. Changes beyond it are
/// rejected on load, and a document that reaches it stops accepting local
/// changes.
pub const MAX_OP_COUNTER: u64 = u64::MAX / 2;

/// Identity of a single operation: Lamport counter, then author.
///
/// Ordering on this type is the latest-wins order used when two operations
/// write the same key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub actor: ActorId,
}

/// The two primitive operations
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Write a scalar under `key` of the object at `obj` (latest-wins)
    Put { obj: ObjPath, key: String, value: Value },

    /// Remove `key` from the object at `obj` (latest-wins against puts)
    Delete { obj: ObjPath, key: String },
}

impl Op {
    pub fn obj(&self) -> &ObjPath {
        match self {
            Op::Put { obj, .. } => obj,
            Op::Delete { obj, .. } => obj,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Op::Put { key, .. } => key,
            Op::Delete { key, .. } => key,
        }
    }
}

/// One atomic, authored unit of history.
///
/// Changes are immutable once created; `hash` covers every other field and
/// is checked whenever a change arrives from outside.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub hash: String,
    pub actor: ActorId,
    pub seq: SeqNum,
    /// Lamport counter of the first op; op `i` has counter `start_op + i`
    pub start_op: u64,
    /// Wall-clock milliseconds. Display only, never used for ordering.
    pub time_ms: i64,
    pub message: Option<String>,
    /// What the author had seen when making this change
    pub deps: Horizon,
    pub ops: Vec<Op>,
}

impl Change {
    /// Build a change and compute its hash
    pub fn new(
        actor: ActorId,
        seq: SeqNum,
        start_op: u64,
        message: Option<String>,
        deps: Horizon,
        ops: Vec<Op>,
    ) -> Result<Self, EngineError> {
        let mut change = Self {
            hash: String::new(),
            actor,
            seq,
            start_op,
            time_ms: Utc::now().timestamp_millis(),
            message,
            deps,
            ops,
        };
        change.check_counters()?;
        change.hash = change.compute_hash()?;
        Ok(change)
    }

    /// SHA-256 over the CBOR encoding of everything but the hash itself
    pub fn compute_hash(&self) -> Result<String, EngineError> {
        let body = (
            &self.actor,
            self.seq,
            self.start_op,
            self.time_ms,
            &self.message,
            &self.deps,
            &self.ops,
        );
        let mut buf = Vec::new();
        ciborium::into_writer(&body, &mut buf)
            .map_err(|e| EngineError::SerializationError(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&buf)))
    }

    pub fn verify(&self) -> Result<(), EngineError> {
        if self.compute_hash()? == self.hash {
            Ok(())
        } else {
            Err(EngineError::HashMismatch {
                actor: self.actor.clone(),
                seq: self.seq,
            })
        }
    }

    /// Sequence number and op counters must be in range. Checked for every
    /// change built locally or read from a snapshot, so counter arithmetic
    /// on a held change never overflows.
    pub fn check_counters(&self) -> Result<(), EngineError> {
        let in_range = self.seq >= 1
            && self.start_op >= 1
            && self.max_op().map_or(false, |last| last <= MAX_OP_COUNTER);
        if in_range {
            Ok(())
        } else {
            Err(EngineError::CounterOutOfRange {
                actor: self.actor.clone(),
                seq: self.seq,
            })
        }
    }

    /// Id of the op at `index` within this change
    pub fn op_id(&self, index: usize) -> Option<OpId> {
        let counter = self.start_op.checked_add(u64::try_from(index).ok()?)?;
        Some(OpId {
            counter,
            actor: self.actor.clone(),
        })
    }

    /// Highest op counter used by this change
    pub fn max_op(&self) -> Option<u64> {
        let extra = u64::try_from(self.ops.len().saturating_sub(1)).ok()?;
        self.start_op.checked_add(extra)
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Key used to order changes causally (a linear extension of happened-before)
    pub fn causal_key(&self) -> (u64, &str) {
        (self.start_op, self.actor.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::value::obj_path;

    fn put(key: &str, value: Value) -> Op {
        Op::Put {
            obj: obj_path(&["student"]),
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn test_hash_detects_tampering() {
        let change = Change::new(
            "A".into(),
            1,
            1,
            Some("first".into()),
            Horizon::new(),
            vec![put("age", Value::int(16))],
        )
        .unwrap();
        assert!(change.verify().is_ok());

        let mut tampered = change.clone();
        tampered.ops = vec![put("age", Value::int(61))];
        assert!(matches!(
            tampered.verify(),
            Err(EngineError::HashMismatch { seq: 1, .. })
        ));
    }

    #[test]
    fn test_op_ids_follow_start_op() {
        let change = Change::new(
            "B".into(),
            2,
            7,
            None,
            Horizon::new(),
            vec![put("a", Value::Null), put("b", Value::Null)],
        )
        .unwrap();

        assert_eq!(change.op_id(0).map(|id| id.counter), Some(7));
        assert_eq!(change.op_id(1).map(|id| id.counter), Some(8));
        assert_eq!(change.max_op(), Some(8));
    }

    #[test]
    fn test_counters_out_of_range_are_refused() {
        for start_op in [0, MAX_OP_COUNTER, u64::MAX] {
            let result = Change::new(
                "A".into(),
                1,
                start_op,
                None,
                Horizon::new(),
                vec![put("a", Value::Null), put("b", Value::Null)],
            );
            assert!(
                matches!(result, Err(EngineError::CounterOutOfRange { .. })),
                "start_op {} accepted",
                start_op
            );
        }

        let zero_seq = Change::new("A".into(), 0, 1, None, Horizon::new(), vec![]);
        assert!(matches!(zero_seq, Err(EngineError::CounterOutOfRange { seq: 0, .. })));
    }

    #[test]
    fn test_op_id_ordering_breaks_ties_by_actor() {
        let a = OpId { counter: 3, actor: "A".into() };
        let b = OpId { counter: 3, actor: "B".into() };
        let c = OpId { counter: 4, actor: "A".into() };
        assert!(a < b);
        assert!(b < c);
    }
}
