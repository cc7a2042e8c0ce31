//! The merge engine seam
//!
//! Everything above this module treats the CRDT as a black box supplying
//! `init`, `change`, `merge`, `save`, `load` and `history`. [`MergeEngine`]
//! is that box; [`ConvergentEngine`] is the implementation this crate ships.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::change::Change;
use super::document::{Document, DocumentState, Materializer};
use super::error::EngineError;
use super::horizon::{ActorId, SeqNum};
use super::snapshot::{self, Snapshot};
use super::transaction::Transaction;

/// One point in a document's history: a change and the state right after it.
#[derive(Clone, Debug)]
pub struct HistoryPoint {
    pub hash: String,
    pub actor: ActorId,
    pub seq: SeqNum,
    pub message: Option<String>,
    pub time: DateTime<Utc>,
    pub state: DocumentState,
}

/// The conflict-free merge primitives the replication layer is built on.
///
/// Implementations must make `merge` commutative, associative and
/// idempotent with respect to [`MergeEngine::state`].
pub trait MergeEngine: Send + Sync + 'static {
    type Document: Clone + Send + Sync + 'static;

    /// A fresh, empty document.
    fn init(&self) -> Self::Document;

    /// Run `mutator` against `doc` and return the resulting document.
    /// If the mutator records nothing, `doc` is returned unchanged.
    fn change<F>(
        &self,
        doc: &Self::Document,
        message: &str,
        mutator: F,
    ) -> Result<Self::Document, EngineError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), EngineError>;

    /// Combine two documents. The result keeps `ours`' local identity.
    fn merge(&self, ours: &Self::Document, theirs: &Self::Document) -> Self::Document;

    fn save(&self, doc: &Self::Document) -> Result<Snapshot, EngineError>;

    /// Decode and validate a snapshot.
    fn load(&self, bytes: &[u8]) -> Result<Self::Document, EngineError>;

    /// Every change in causal order with the state right after it.
    fn history(&self, doc: &Self::Document) -> Vec<HistoryPoint>;

    /// Materialized view of `doc`.
    fn state(&self, doc: &Self::Document) -> DocumentState;
}

/// Operation-based engine over [`Document`].
///
/// Each engine instance is one actor. Two engines must never share an
/// actor id; [`ConvergentEngine::new`] picks a random one.
#[derive(Clone, Debug)]
pub struct ConvergentEngine {
    actor: ActorId,
}

impl ConvergentEngine {
    pub fn new() -> Self {
        Self::with_actor(Uuid::new_v4().simple().to_string())
    }

    pub fn with_actor(actor: impl Into<ActorId>) -> Self {
        Self {
            actor: actor.into(),
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }
}

impl Default for ConvergentEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeEngine for ConvergentEngine {
    type Document = Document;

    fn init(&self) -> Document {
        Document::new(self.actor.clone())
    }

    fn change<F>(&self, doc: &Document, message: &str, mutator: F) -> Result<Document, EngineError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), EngineError>,
    {
        let mut tx = Transaction::new(doc.materialize());
        mutator(&mut tx)?;
        let ops = tx.into_ops();
        if ops.is_empty() {
            return Ok(doc.clone());
        }

        let message = if message.is_empty() {
            None
        } else {
            Some(message.to_string())
        };
        let change = Change::new(
            doc.actor().clone(),
            doc.next_seq()?,
            doc.next_op()?,
            message,
            doc.horizon().clone(),
            ops,
        )?;

        let mut next = doc.clone();
        next.insert(Arc::new(change));
        Ok(next)
    }

    fn merge(&self, ours: &Document, theirs: &Document) -> Document {
        let mut merged = ours.clone();
        let added = merged.absorb(theirs);
        log::trace!("merge absorbed {} change(s) from peer", added);
        merged
    }

    fn save(&self, doc: &Document) -> Result<Snapshot, EngineError> {
        snapshot::encode(doc)
    }

    fn load(&self, bytes: &[u8]) -> Result<Document, EngineError> {
        snapshot::decode(bytes, self.actor.clone())
    }

    fn history(&self, doc: &Document) -> Vec<HistoryPoint> {
        let mut materializer = Materializer::default();
        doc.changes_in_causal_order()
            .into_iter()
            .map(|change| {
                materializer.apply_change(change);
                HistoryPoint {
                    hash: change.hash.clone(),
                    actor: change.actor.clone(),
                    seq: change.seq,
                    message: change.message.clone(),
                    time: change.time(),
                    state: materializer.state(),
                }
            })
            .collect()
    }

    fn state(&self, doc: &Document) -> DocumentState {
        doc.materialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::value::Value;

    fn set_age(engine: &ConvergentEngine, doc: &Document, age: i64) -> Document {
        engine
            .change(doc, &format!("age {}", age), |tx| {
                tx.put(&["student"], "age", age);
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_change_leaves_input_untouched() {
        let engine = ConvergentEngine::with_actor("A");
        let empty = engine.init();
        let edited = set_age(&engine, &empty, 16);

        assert!(empty.is_empty());
        assert_eq!(edited.len(), 1);
        assert_eq!(
            engine.state(&edited).get(&["student"], "age"),
            Some(&Value::int(16))
        );
    }

    #[test]
    fn test_empty_transaction_records_nothing() {
        let engine = ConvergentEngine::with_actor("A");
        let doc = engine.init();
        let same = engine.change(&doc, "noop", |_| Ok(())).unwrap();
        assert!(same.is_empty());
        assert!(engine.history(&same).is_empty());
    }

    #[test]
    fn test_failed_mutator_propagates() {
        let engine = ConvergentEngine::with_actor("A");
        let doc = engine.init();
        let result = engine.change(&doc, "bad", |tx| {
            tx.put(&["student"], "age", 1i64);
            Err(EngineError::Mutation("age out of range".into()))
        });
        assert!(matches!(result, Err(EngineError::Mutation(_))));
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let a = ConvergentEngine::with_actor("A");
        let b = ConvergentEngine::with_actor("B");

        let base = set_age(&a, &a.init(), 15);
        let base_b = b.load(a.save(&base).unwrap().as_bytes()).unwrap();

        let doc_a = set_age(&a, &base, 16);
        let doc_b = b
            .change(&base_b, "class", |tx| {
                tx.put(&["student"], "class", "B2");
                Ok(())
            })
            .unwrap();

        let ab = a.merge(&doc_a, &doc_b);
        let ba = b.merge(&doc_b, &doc_a);
        assert_eq!(a.state(&ab), b.state(&ba));
        assert!(ab.converged_with(&ba));

        let again = a.merge(&ab, &ab);
        assert_eq!(a.state(&again), a.state(&ab));
        assert_eq!(again.len(), ab.len());

        let state = a.state(&ab);
        assert_eq!(state.get(&["student"], "age"), Some(&Value::int(16)));
        assert_eq!(state.get(&["student"], "class"), Some(&Value::string("B2")));
    }

    #[test]
    fn test_history_snapshots_each_change() {
        let engine = ConvergentEngine::with_actor("A");
        let mut doc = engine.init();
        for age in [15, 16, 17] {
            doc = set_age(&engine, &doc, age);
        }

        let history = engine.history(&doc);
        assert_eq!(history.len(), 3);
        for (point, age) in history.iter().zip([15, 16, 17]) {
            assert_eq!(point.message.as_deref(), Some(format!("age {}", age).as_str()));
            assert_eq!(point.state.get(&["student"], "age"), Some(&Value::int(age)));
        }
        assert_eq!(history[2].seq, 3);
    }

    #[test]
    fn test_edit_after_counter_ceiling_is_refused() {
        use crate::convergent::change::{Op, MAX_OP_COUNTER};
        use crate::convergent::horizon::Horizon;
        use crate::convergent::value::obj_path;

        let mut peer = Document::new("B".into());
        let last = Change::new(
            "B".into(),
            1,
            MAX_OP_COUNTER,
            None,
            Horizon::new(),
            vec![Op::Put {
                obj: obj_path(&["student"]),
                key: "age".into(),
                value: Value::int(15),
            }],
        )
        .unwrap();
        peer.insert(Arc::new(last));

        let engine = ConvergentEngine::with_actor("A");
        let merged = engine.merge(&engine.init(), &peer);
        let result = engine.change(&merged, "age", |tx| {
            tx.put(&["student"], "age", 16i64);
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::CounterExhausted)));
        assert_eq!(
            engine.state(&merged).get(&["student"], "age"),
            Some(&Value::int(15))
        );
    }

    #[test]
    fn test_loaded_document_authors_as_loader() {
        let a = ConvergentEngine::with_actor("A");
        let b = ConvergentEngine::with_actor("B");
        let doc = set_age(&a, &a.init(), 15);

        let loaded = b.load(a.save(&doc).unwrap().as_bytes()).unwrap();
        let edited = set_age(&b, &loaded, 20);

        let authors: Vec<&str> = edited.changes().map(|c| c.actor.as_str()).collect();
        assert_eq!(authors, vec!["A", "B"]);
    }
}
