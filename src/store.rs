//! DocumentStore: the single authoritative document of this process
//!
//! The store is a plain owned value with `&mut self` transitions. It is
//! meant to live inside exactly one task (the sync controller), which is
//! what makes every transition run to completion without interleaving.
//! Each transition replaces the held document with a new value; nothing is
//! mutated in place.

use std::sync::Arc;

use crate::convergent::{EngineError, MergeEngine, Snapshot, Transaction};
use crate::student::Student;

/// Result of a committed local edit. The snapshot is captured from the
/// committed document at commit time, so it stays correct even if later
/// transitions happen before it is sent anywhere.
#[derive(Clone, Debug)]
pub struct LocalCommit<D> {
    pub document: D,
    pub snapshot: Snapshot,
    pub version: u64,
}

pub struct DocumentStore<E: MergeEngine> {
    engine: Arc<E>,
    current: E::Document,
    /// Incremented on every transition
    version: u64,
}

impl<E: MergeEngine> DocumentStore<E> {
    /// Create a store holding an empty document
    pub fn new(engine: Arc<E>) -> Self {
        let current = engine.init();
        Self {
            engine,
            current,
            version: 0,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// The latest authoritative value
    pub fn current(&self) -> E::Document {
        self.current.clone()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Projection of the current document
    pub fn projection(&self) -> Student {
        Student::project(&self.engine.state(&self.current))
    }

    /// Apply a local mutation recorded under `message`.
    ///
    /// The new document is serialized before it replaces the current one;
    /// if either step fails the store is left untouched.
    pub fn apply_local_edit<F>(
        &mut self,
        message: &str,
        mutator: F,
    ) -> Result<LocalCommit<E::Document>, EngineError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), EngineError>,
    {
        let next = self.engine.change(&self.current, message, mutator)?;
        let snapshot = self.engine.save(&next)?;

        self.current = next.clone();
        self.version += 1;
        log::debug!(
            "local edit committed at version {} ({} bytes): {}",
            self.version,
            snapshot.len(),
            message
        );

        Ok(LocalCommit {
            document: next,
            snapshot,
            version: self.version,
        })
    }

    /// Merge an already-decoded remote document into the current one.
    pub fn merge_inbound(&mut self, remote: &E::Document) -> E::Document {
        let merged = self.engine.merge(&self.current, remote);
        self.current = merged.clone();
        self.version += 1;
        log::debug!("inbound merge committed at version {}", self.version);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::ConvergentEngine;

    fn store(actor: &str) -> DocumentStore<ConvergentEngine> {
        DocumentStore::new(Arc::new(ConvergentEngine::with_actor(actor)))
    }

    fn edit(store: &mut DocumentStore<ConvergentEngine>, student: &Student) -> LocalCommit<crate::convergent::Document> {
        store
            .apply_local_edit(&student.edit_message(), |tx| {
                student.write_into(tx);
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_new_store_projects_default() {
        let store = store("A");
        assert_eq!(store.projection(), Student::default());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_local_edit_replaces_current() {
        let mut store = store("A");
        let before = store.current();

        let ana = Student::new("Ana", 16, "B2");
        let commit = edit(&mut store, &ana);

        assert_eq!(store.projection(), ana);
        assert_eq!(commit.version, 1);
        assert!(before.is_empty());
        assert!(commit.document.converged_with(&store.current()));

        // The captured snapshot reproduces the committed document
        let engine = ConvergentEngine::with_actor("Z");
        let loaded = engine.load(commit.snapshot.as_bytes()).unwrap();
        assert_eq!(Student::project(&engine.state(&loaded)), ana);
    }

    #[test]
    fn test_failed_edit_leaves_store_untouched() {
        let mut store = store("A");
        let result = store.apply_local_edit("rejected", |tx| {
            tx.put(&["student"], "age", 3i64);
            Err(EngineError::Mutation("no".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.version(), 0);
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_merge_inbound_twice_is_idempotent() {
        let mut a = store("A");
        let mut b = store("B");
        let ana = Student::new("Ana", 16, "B2");
        let remote = edit(&mut b, &ana).document;

        a.merge_inbound(&remote);
        let once = a.projection();
        a.merge_inbound(&remote);

        assert_eq!(a.projection(), once);
        assert_eq!(a.projection(), ana);
        assert_eq!(a.current().len(), 1);
        assert_eq!(a.version(), 2);
    }
}
