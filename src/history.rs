//! HistoryInspector: the change log as the editor shows it
//!
//! Read-only and derived. A log is rebuilt from the document's full
//! history; the inspector keeps the last one keyed by store version, and
//! every store transition bumps the version, so a cached log is never
//! served for a document it was not built from.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::convergent::{ActorId, MergeEngine, SeqNum};
use crate::student::Student;

/// One entry of the history: a change and the student right after it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub index: usize,
    pub hash: String,
    pub actor: ActorId,
    pub seq: SeqNum,
    pub message: Option<String>,
    pub time: DateTime<Utc>,
    pub student: Student,
}

/// Changes in causal order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HistoryLog {
    records: Vec<ChangeRecord>,
}

impl HistoryLog {
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&ChangeRecord> {
        self.records.last()
    }

    /// Records that carry a message, the ones worth listing
    pub fn labelled(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter().filter(|r| {
            r.message
                .as_deref()
                .map(|m| !m.is_empty())
                .unwrap_or(false)
        })
    }
}

impl<'a> IntoIterator for &'a HistoryLog {
    type Item = &'a ChangeRecord;
    type IntoIter = std::slice::Iter<'a, ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

pub struct HistoryInspector<E: MergeEngine> {
    engine: Arc<E>,
    cache: Mutex<Option<(u64, HistoryLog)>>,
}

impl<E: MergeEngine> HistoryInspector<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            cache: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Build the log for `doc` without touching the cache.
    pub fn compute(&self, doc: &E::Document) -> HistoryLog {
        let records = self
            .engine
            .history(doc)
            .into_iter()
            .enumerate()
            .map(|(index, point)| ChangeRecord {
                index,
                student: Student::project(&point.state),
                hash: point.hash,
                actor: point.actor,
                seq: point.seq,
                message: point.message,
                time: point.time,
            })
            .collect();
        HistoryLog { records }
    }

    /// History of `doc`, which the store held at `version`.
    pub fn snapshot_history(&self, doc: &E::Document, version: u64) -> HistoryLog {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_version, log)) = cache.as_ref() {
            if *cached_version == version {
                return log.clone();
            }
        }
        let log = self.compute(doc);
        *cache = Some((version, log.clone()));
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::{ConvergentEngine, Document};

    fn edit(engine: &ConvergentEngine, doc: &Document, student: &Student) -> Document {
        engine
            .change(doc, &student.edit_message(), |tx| {
                student.write_into(tx);
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_history_fidelity() {
        let engine = Arc::new(ConvergentEngine::with_actor("A"));
        let inspector = HistoryInspector::new(Arc::clone(&engine));

        let edits = [
            Student::new("Ana", 15, "A1"),
            Student::new("Ana", 16, "A1"),
            Student::new("Ana", 16, "B2"),
        ];
        let mut doc = engine.init();
        for student in &edits {
            doc = edit(&engine, &doc, student);
        }

        let log = inspector.compute(&doc);
        assert_eq!(log.len(), 3);
        for (record, student) in log.iter().zip(edits.iter()) {
            assert_eq!(record.message.as_deref(), Some(student.edit_message().as_str()));
            assert_eq!(&record.student, student);
        }
        assert_eq!(log.last().map(|r| r.index), Some(2));
    }

    #[test]
    fn test_cache_is_keyed_by_version() {
        let engine = Arc::new(ConvergentEngine::with_actor("A"));
        let inspector = HistoryInspector::new(Arc::clone(&engine));

        let first = edit(&engine, &engine.init(), &Student::new("Ana", 15, "A1"));
        assert_eq!(inspector.snapshot_history(&first, 1).len(), 1);

        // Same version: served from cache even if handed another document
        let second = edit(&engine, &first, &Student::new("Ana", 16, "A1"));
        assert_eq!(inspector.snapshot_history(&second, 1).len(), 1);

        // New version invalidates
        assert_eq!(inspector.snapshot_history(&second, 2).len(), 2);
    }

    #[test]
    fn test_labelled_skips_unlabelled_changes() {
        let engine = Arc::new(ConvergentEngine::with_actor("A"));
        let inspector = HistoryInspector::new(Arc::clone(&engine));

        let doc = engine
            .change(&engine.init(), "", |tx| {
                tx.put(&["student"], "class", "A1");
                Ok(())
            })
            .unwrap();
        let doc = edit(&engine, &doc, &Student::new("Ana", 15, "A1"));

        let log = inspector.compute(&doc);
        assert_eq!(log.len(), 2);
        assert_eq!(log.labelled().count(), 1);
        assert_eq!(log.records()[0].student.class, "A1");
    }
}
