//! The core Document type
//!
//! A Document stores authored changes and materializes them into state.
//! Every key resolves to the operation with the greatest [`OpId`], so the
//! materialized state depends only on the set of changes held, never on the
//! order they arrived in.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::change::{Change, Op, OpId, MAX_OP_COUNTER};
use super::error::EngineError;
use super::horizon::{ActorId, Horizon, SeqNum};
use super::value::{obj_path, ObjPath, Value};

/// Materialized state of the whole document: objects by path, each a map
/// of keys to scalar values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocumentState {
    objects: BTreeMap<ObjPath, BTreeMap<String, Value>>,
}

impl DocumentState {
    pub fn get(&self, obj: &[&str], key: &str) -> Option<&Value> {
        self.objects.get(&obj_path(obj)).and_then(|o| o.get(key))
    }

    pub fn object(&self, obj: &[&str]) -> Option<&BTreeMap<String, Value>> {
        self.objects.get(&obj_path(obj))
    }

    pub fn has_object(&self, obj: &[&str]) -> bool {
        self.objects.contains_key(&obj_path(obj))
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn set(&mut self, obj: &ObjPath, key: &str, value: Value) {
        self.objects
            .entry(obj.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub(crate) fn remove(&mut self, obj: &ObjPath, key: &str) {
        if let Some(object) = self.objects.get_mut(obj) {
            object.remove(key);
            if object.is_empty() {
                self.objects.remove(obj);
            }
        }
    }

    /// Apply an op on top of this state, treating it as the newest write
    pub(crate) fn apply(&mut self, op: &Op) {
        match op {
            Op::Put { obj, key, value } => self.set(obj, key, value.clone()),
            Op::Delete { obj, key } => self.remove(obj, key),
        }
    }

    /// Render as nested JSON objects, for display and debugging.
    pub fn to_json(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        for (path, entries) in &self.objects {
            let mut cursor = &mut root;
            for segment in path {
                let slot = cursor
                    .entry(segment.clone())
                    .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
                if !slot.is_object() {
                    *slot = serde_json::Value::Object(serde_json::Map::new());
                }
                cursor = match slot {
                    serde_json::Value::Object(map) => map,
                    _ => unreachable!("slot was just made an object"),
                };
            }
            for (key, value) in entries {
                cursor.insert(key.clone(), value.to_json());
            }
        }
        serde_json::Value::Object(root)
    }
}

/// Folds changes into a [`DocumentState`], keeping the winning op per key.
#[derive(Default)]
pub(crate) struct Materializer {
    winners: BTreeMap<(ObjPath, String), (OpId, Option<Value>)>,
}

impl Materializer {
    pub(crate) fn apply_change(&mut self, change: &Change) {
        for (index, op) in change.ops.iter().enumerate() {
            let Some(id) = change.op_id(index) else {
                continue;
            };
            let value = match op {
                Op::Put { value, .. } => Some(value.clone()),
                Op::Delete { .. } => None,
            };
            let slot = (op.obj().clone(), op.key().to_string());
            match self.winners.get(&slot) {
                Some((current, _)) if *current >= id => {}
                _ => {
                    self.winners.insert(slot, (id, value));
                }
            }
        }
    }

    pub(crate) fn state(&self) -> DocumentState {
        let mut state = DocumentState::default();
        for ((obj, key), (_, value)) in &self.winners {
            if let Some(value) = value {
                state.set(obj, key, value.clone());
            }
        }
        state
    }
}

/// A convergent document: an immutable-by-convention set of changes plus
/// the identity of the actor that will author the next local change.
#[derive(Clone, Debug)]
pub struct Document {
    /// Author of local changes made through this value
    actor: ActorId,

    /// Everything this document has seen
    horizon: Horizon,

    /// Highest op counter of any held change
    max_op: u64,

    /// All changes, keyed by (author, seq)
    changes: BTreeMap<(ActorId, SeqNum), Arc<Change>>,
}

impl Document {
    /// Create a new empty document
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            horizon: Horizon::new(),
            max_op: 0,
            changes: BTreeMap::new(),
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn horizon(&self) -> &Horizon {
        &self.horizon
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn set_actor(&mut self, actor: ActorId) {
        self.actor = actor;
    }

    /// Sequence number the next local change will get
    pub(crate) fn next_seq(&self) -> Result<SeqNum, EngineError> {
        self.horizon
            .get(&self.actor)
            .checked_add(1)
            .ok_or(EngineError::CounterExhausted)
    }

    /// Lamport counter the next local change will start at
    pub(crate) fn next_op(&self) -> Result<u64, EngineError> {
        self.max_op
            .checked_add(1)
            .filter(|next| *next <= MAX_OP_COUNTER)
            .ok_or(EngineError::CounterExhausted)
    }

    /// Store a change. Returns false if it was already present.
    pub(crate) fn insert(&mut self, change: Arc<Change>) -> bool {
        let key = (change.actor.clone(), change.seq);
        if self.changes.contains_key(&key) {
            return false;
        }
        self.horizon.observe(&change.actor, change.seq);
        if let Some(last) = change.max_op() {
            self.max_op = self.max_op.max(last);
        }
        self.changes.insert(key, change);
        true
    }

    /// Add every change of `other` that this document lacks.
    /// Returns how many were added.
    pub(crate) fn absorb(&mut self, other: &Document) -> usize {
        if self.horizon.dominates(&other.horizon) {
            return 0;
        }
        let mut added = 0;
        for change in other.changes.values() {
            if !self.horizon.has_seen(&change.actor, change.seq) && self.insert(Arc::clone(change)) {
                added += 1;
            }
        }
        added
    }

    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.values().map(|c| c.as_ref())
    }

    /// Changes ordered so that every change comes after everything its
    /// author had seen.
    pub fn changes_in_causal_order(&self) -> Vec<&Change> {
        let mut ordered: Vec<&Change> = self.changes().collect();
        ordered.sort_by(|a, b| a.causal_key().cmp(&b.causal_key()));
        ordered
    }

    /// Materialize the current state from all changes
    pub fn materialize(&self) -> DocumentState {
        let mut materializer = Materializer::default();
        for change in self.changes() {
            materializer.apply_change(change);
        }
        materializer.state()
    }

    /// True if both documents hold exactly the same changes.
    /// The local actor is not part of the comparison.
    pub fn converged_with(&self, other: &Document) -> bool {
        self.horizon == other.horizon
            && self
                .changes
                .iter()
                .zip(other.changes.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.hash == b.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(actor: &str, seq: SeqNum, start_op: u64, deps: Horizon, ops: Vec<Op>) -> Arc<Change> {
        Arc::new(Change::new(actor.into(), seq, start_op, None, deps, ops).unwrap())
    }

    fn put(key: &str, value: Value) -> Op {
        Op::Put {
            obj: obj_path(&["student"]),
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn test_insert_and_materialize() {
        let mut doc = Document::new("A".into());
        assert!(doc.insert(change("A", 1, 1, Horizon::new(), vec![put("age", Value::int(15))])));
        assert!(!doc.insert(change("A", 1, 1, Horizon::new(), vec![put("age", Value::int(15))])));

        let state = doc.materialize();
        assert_eq!(state.get(&["student"], "age"), Some(&Value::int(15)));
        assert_eq!(doc.next_seq().unwrap(), 2);
        assert_eq!(doc.next_op().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_writes_resolve_by_op_id() {
        // A's change starts at op 5 with three ops, B's concurrent change at 6.
        // The key written by A's third op (counter 7) beats B's op 6 no matter
        // which order they are folded in.
        let a = change(
            "A",
            1,
            5,
            Horizon::new(),
            vec![put("x", Value::int(1)), put("y", Value::int(1)), put("name", Value::string("from A"))],
        );
        let b = change("B", 1, 6, Horizon::new(), vec![put("name", Value::string("from B"))]);

        let mut ab = Document::new("A".into());
        ab.insert(Arc::clone(&a));
        ab.insert(Arc::clone(&b));

        let mut ba = Document::new("B".into());
        ba.insert(b);
        ba.insert(a);

        assert_eq!(ab.materialize(), ba.materialize());
        assert_eq!(
            ab.materialize().get(&["student"], "name"),
            Some(&Value::string("from A"))
        );
        assert!(ab.converged_with(&ba));
    }

    #[test]
    fn test_delete_removes_empty_object() {
        let mut deps = Horizon::new();
        let mut doc = Document::new("A".into());
        doc.insert(change("A", 1, 1, deps.clone(), vec![put("age", Value::int(15))]));
        deps.observe("A", 1);
        doc.insert(change(
            "A",
            2,
            2,
            deps,
            vec![Op::Delete {
                obj: obj_path(&["student"]),
                key: "age".into(),
            }],
        ));

        let state = doc.materialize();
        assert!(!state.has_object(&["student"]));
        assert!(state.is_empty());
    }

    #[test]
    fn test_causal_order() {
        let mut doc = Document::new("A".into());
        let mut deps = Horizon::new();
        doc.insert(change("A", 1, 1, deps.clone(), vec![put("a", Value::Null)]));
        deps.observe("A", 1);
        doc.insert(change("B", 1, 2, deps.clone(), vec![put("b", Value::Null)]));
        deps.observe("B", 1);
        doc.insert(change("A", 2, 3, deps, vec![put("c", Value::Null)]));

        let order: Vec<(String, SeqNum)> = doc
            .changes_in_causal_order()
            .iter()
            .map(|c| (c.actor.clone(), c.seq))
            .collect();
        assert_eq!(
            order,
            vec![("A".into(), 1), ("B".into(), 1), ("A".into(), 2)]
        );
    }

    #[test]
    fn test_absorb_skips_documents_already_covered() {
        let mut deps = Horizon::new();
        let mut full = Document::new("A".into());
        full.insert(change("A", 1, 1, deps.clone(), vec![put("a", Value::Null)]));
        deps.observe("A", 1);
        full.insert(change("A", 2, 2, deps, vec![put("b", Value::Null)]));

        let mut partial = Document::new("B".into());
        partial.insert(change("A", 1, 1, Horizon::new(), vec![put("a", Value::Null)]));

        assert_eq!(full.absorb(&partial), 0);
        assert_eq!(partial.absorb(&full), 1);
        assert!(partial.converged_with(&full));
    }

    #[test]
    fn test_next_op_stops_at_the_counter_ceiling() {
        let mut doc = Document::new("A".into());
        doc.insert(change(
            "B",
            1,
            MAX_OP_COUNTER,
            Horizon::new(),
            vec![put("a", Value::Null)],
        ));
        assert!(matches!(doc.next_op(), Err(EngineError::CounterExhausted)));
        assert_eq!(doc.next_seq().unwrap(), 1);
    }

    #[test]
    fn test_state_to_json_nests_objects() {
        let mut state = DocumentState::default();
        state.set(&obj_path(&["student"]), "studentName", Value::string("Ana"));
        state.set(&obj_path(&[]), "title", Value::string("draft"));

        assert_eq!(
            state.to_json(),
            serde_json::json!({"title": "draft", "student": {"studentName": "Ana"}})
        );
    }
}
