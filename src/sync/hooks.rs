//! Post-commit hooks
//!
//! Side effects of a transition live here instead of inside the mutation
//! path. The controller runs every hook after each committed transition;
//! a failing hook is logged and skipped, the others still run and the
//! committed document is never rolled back.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::broadcast::ChangeBroadcaster;
use crate::convergent::Snapshot;
use crate::remote::RemotePersistence;
use crate::student::Student;
use crate::types::DocumentId;

use super::observer::DocumentObserver;

/// Where an inbound snapshot came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Broadcast,
    Remote,
    /// Handed directly to the controller by its owner
    Direct,
}

#[derive(Clone, Debug)]
pub enum CommitKind {
    LocalEdit { message: String, snapshot: Snapshot },
    InboundMerge { origin: Origin },
}

/// A committed store transition, as the hooks see it.
#[derive(Clone, Debug)]
pub struct Commit {
    pub doc_id: DocumentId,
    pub kind: CommitKind,
    pub version: u64,
    pub projection: Student,
}

impl Commit {
    /// Snapshot captured at commit time, for local edits only.
    pub fn local_snapshot(&self) -> Option<&Snapshot> {
        match &self.kind {
            CommitKind::LocalEdit { snapshot, .. } => Some(snapshot),
            CommitKind::InboundMerge { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("No async runtime available")]
    NoRuntime,

    #[error("Hook failed: {0}")]
    Failed(String),
}

pub trait CommitHook: Send + Sync {
    fn name(&self) -> &str;

    /// Must return promptly; slow work is handed to a task, not awaited.
    fn after_commit(&self, commit: &Commit) -> Result<(), HookError>;
}

/// Run `hooks` in order, logging failures.
pub(crate) fn run_hooks(hooks: &[Box<dyn CommitHook>], commit: &Commit) {
    for hook in hooks {
        if let Err(e) = hook.after_commit(commit) {
            log::error!(
                "hook '{}' failed after version {} of '{}': {}",
                hook.name(),
                commit.version,
                commit.doc_id,
                e
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Built-in hooks
// ----------------------------------------------------------------------------

/// Publishes the committed snapshot of every local edit to sibling contexts.
pub struct BroadcastHook {
    broadcaster: Arc<dyn ChangeBroadcaster>,
}

impl BroadcastHook {
    pub fn new(broadcaster: Arc<dyn ChangeBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl CommitHook for BroadcastHook {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn after_commit(&self, commit: &Commit) -> Result<(), HookError> {
        if let Some(snapshot) = commit.local_snapshot() {
            self.broadcaster.publish(&commit.doc_id, snapshot);
        }
        Ok(())
    }
}

/// Pushes the committed snapshot of every local edit to the remote store.
///
/// Pushes run one at a time on a dedicated task, in commit order, so the
/// remote never ends up holding an older state than one already pushed.
/// When edits outpace the remote only the newest queued snapshot is sent;
/// it contains every change of the ones it replaces. Pushes are never
/// retried; failures are logged by the task.
pub struct RemotePushHook {
    queue: mpsc::UnboundedSender<PendingPush>,
}

struct PendingPush {
    doc_id: DocumentId,
    version: u64,
    snapshot: Snapshot,
}

impl RemotePushHook {
    /// Start the push task on the current runtime.
    pub fn spawn(remote: Arc<dyn RemotePersistence>) -> Result<Self, HookError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HookError::NoRuntime)?;
        let (queue, pending) = mpsc::unbounded_channel();
        runtime.spawn(push_in_order(remote, pending));
        Ok(Self { queue })
    }
}

async fn push_in_order(
    remote: Arc<dyn RemotePersistence>,
    mut pending: mpsc::UnboundedReceiver<PendingPush>,
) {
    while let Some(mut next) = pending.recv().await {
        while let Ok(newer) = pending.try_recv() {
            log::debug!(
                "push of '{}' version {} superseded by version {}",
                next.doc_id,
                next.version,
                newer.version
            );
            next = newer;
        }
        let PendingPush {
            doc_id,
            version,
            snapshot,
        } = next;
        match remote.push(&doc_id, snapshot).await {
            Ok(()) => log::debug!("pushed '{}' version {}", doc_id, version),
            Err(e) => log::warn!("push of '{}' version {} dropped: {}", doc_id, version, e),
        }
    }
}

impl CommitHook for RemotePushHook {
    fn name(&self) -> &str {
        "remote-push"
    }

    fn after_commit(&self, commit: &Commit) -> Result<(), HookError> {
        let Some(snapshot) = commit.local_snapshot() else {
            return Ok(());
        };
        self.queue
            .send(PendingPush {
                doc_id: commit.doc_id.clone(),
                version: commit.version,
                snapshot: snapshot.clone(),
            })
            .map_err(|_| HookError::Failed("push task has stopped".into()))
    }
}

/// Forwards the projection of every transition to the observers.
pub struct ObserverHook {
    observers: Vec<Arc<dyn DocumentObserver>>,
}

impl ObserverHook {
    pub fn new(observers: Vec<Arc<dyn DocumentObserver>>) -> Self {
        Self { observers }
    }
}

impl CommitHook for ObserverHook {
    fn name(&self) -> &str {
        "observers"
    }

    fn after_commit(&self, commit: &Commit) -> Result<(), HookError> {
        for observer in &self.observers {
            observer.on_document_changed(&commit.projection);
        }
        Ok(())
    }
}
