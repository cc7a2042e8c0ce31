//! Mutation transactions
//!
//! A Transaction is what a change's mutator closure writes into. It records
//! ops and keeps a working view so reads inside the closure see earlier
//! writes of the same closure.

use super::change::Op;
use super::document::DocumentState;
use super::value::{obj_path, Value};

pub struct Transaction {
    view: DocumentState,
    ops: Vec<Op>,
}

impl Transaction {
    pub(crate) fn new(view: DocumentState) -> Self {
        Self {
            view,
            ops: Vec::new(),
        }
    }

    /// Write `value` under `key` of the object at `obj`, creating the
    /// object if it does not exist yet.
    pub fn put(&mut self, obj: &[&str], key: &str, value: impl Into<Value>) {
        let op = Op::Put {
            obj: obj_path(obj),
            key: key.to_string(),
            value: value.into(),
        };
        self.view.apply(&op);
        self.ops.push(op);
    }

    /// Remove `key` from the object at `obj`. Removing an absent key
    /// records nothing.
    pub fn delete(&mut self, obj: &[&str], key: &str) {
        if self.view.get(obj, key).is_none() {
            return;
        }
        let op = Op::Delete {
            obj: obj_path(obj),
            key: key.to_string(),
        };
        self.view.apply(&op);
        self.ops.push(op);
    }

    pub fn get(&self, obj: &[&str], key: &str) -> Option<&Value> {
        self.view.get(obj, key)
    }

    pub fn has_object(&self, obj: &[&str]) -> bool {
        self.view.has_object(obj)
    }

    pub fn view(&self) -> &DocumentState {
        &self.view
    }

    /// Number of ops recorded so far
    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}
