//! SyncController: the single writer of a process's document
//!
//! One tokio task owns the [`DocumentStore`]. Local edits, snapshots
//! received over the broadcaster and snapshots pulled from the remote all
//! arrive as commands on one bounded queue, so no two transitions ever
//! interleave. Broadcast deliveries that find the queue full are dropped:
//! every snapshot carries the sender's whole history, so a later one makes
//! up for it.
//! After each transition the post-commit hooks run: broadcast and remote
//! push for local edits, observers for everything.
//!
//! ```text
//! local edit ──┐
//! broadcast  ──┼─> command queue ─> actor ─> DocumentStore ─> hooks
//! remote pull ─┘
//! ```

pub mod hooks;
pub mod observer;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{BroadcastError, ChangeBroadcaster, Subscription};
use crate::config::SyncConfig;
use crate::convergent::{EngineError, MergeEngine, Snapshot, Transaction};
use crate::history::{HistoryInspector, HistoryLog};
use crate::remote::{RemoteError, RemotePersistence};
use crate::store::DocumentStore;
use crate::student::Student;
use crate::types::DocumentId;

pub use hooks::{
    BroadcastHook, Commit, CommitHook, CommitKind, HookError, ObserverHook, Origin, RemotePushHook,
};
pub use observer::DocumentObserver;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Sync controller has stopped")]
    Stopped,
}

/// What happened to one inbound snapshot
#[derive(Debug)]
pub enum InboundOutcome {
    Merged { version: u64, projection: Student },
    /// The bytes did not decode; the document is unchanged
    Rejected(EngineError),
}

/// Result of asking the remote for its copy
#[derive(Debug)]
pub enum ResyncOutcome {
    Merged { version: u64, projection: Student },
    /// The remote has nothing for this document yet
    NotFound,
    /// The remote could not be asked (transport failure or server error)
    Unreachable(String),
    /// The remote answered with bytes that did not decode
    Rejected(EngineError),
    /// No remote is configured
    Disabled,
}

type Mutator = Box<dyn FnOnce(&mut Transaction) -> Result<(), EngineError> + Send>;

enum Command<D> {
    LocalEdit {
        message: String,
        mutator: Mutator,
        reply: oneshot::Sender<Result<Student, EngineError>>,
    },
    Inbound {
        snapshot: Snapshot,
        origin: Origin,
        reply: Option<oneshot::Sender<InboundOutcome>>,
    },
    Current {
        reply: oneshot::Sender<(D, u64)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for a running controller.
pub struct SyncController<E: MergeEngine> {
    config: SyncConfig,
    engine: Arc<E>,
    broadcaster: Option<Arc<dyn ChangeBroadcaster>>,
    remote: Option<Arc<dyn RemotePersistence>>,
    observers: Vec<Arc<dyn DocumentObserver>>,
    hooks: Vec<Box<dyn CommitHook>>,
}

impl<E: MergeEngine> SyncController<E> {
    pub fn new(config: SyncConfig, engine: E) -> Self {
        Self {
            config,
            engine: Arc::new(engine),
            broadcaster: None,
            remote: None,
            observers: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn ChangeBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Ignored when `config.remote.enabled` is false.
    pub fn with_remote(mut self, remote: Arc<dyn RemotePersistence>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DocumentObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Extra hook, run after broadcast and push and before observers.
    pub fn with_hook(mut self, hook: Box<dyn CommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Spawn the controller task on the current runtime.
    ///
    /// Subscribes to the broadcaster and, if `pull_on_start` is set, merges
    /// whatever the remote holds before returning. Neither a missing nor an
    /// unreachable remote fails startup.
    pub async fn start(self) -> Result<SyncHandle<E>, SyncError> {
        let SyncController {
            config,
            engine,
            broadcaster,
            remote,
            observers,
            hooks: extra_hooks,
        } = self;
        let doc_id = config.doc_id.clone();
        let remote = remote.filter(|_| config.remote.enabled);

        let mut hooks: Vec<Box<dyn CommitHook>> = Vec::new();
        if let Some(broadcaster) = &broadcaster {
            hooks.push(Box::new(BroadcastHook::new(Arc::clone(broadcaster))));
        }
        if let Some(remote) = &remote {
            hooks.push(Box::new(RemotePushHook::spawn(Arc::clone(remote))?));
        }
        hooks.extend(extra_hooks);
        if !observers.is_empty() {
            hooks.push(Box::new(ObserverHook::new(observers)));
        }

        let (commands, queue) = mpsc::channel(config.queue_capacity.max(1));

        let subscription = match &broadcaster {
            Some(broadcaster) => {
                let inbound = commands.clone();
                let topic = doc_id.clone();
                Some(broadcaster.subscribe(
                    &doc_id,
                    Box::new(move |snapshot| {
                        let command = Command::Inbound {
                            snapshot,
                            origin: Origin::Broadcast,
                            reply: None,
                        };
                        if let Err(TrySendError::Full(_)) = inbound.try_send(command) {
                            log::warn!("command queue for '{}' full, dropping broadcast", topic);
                        }
                    }),
                )?)
            }
            None => None,
        };

        let actor = Actor {
            doc_id: doc_id.clone(),
            store: DocumentStore::new(Arc::clone(&engine)),
            hooks,
            subscription,
        };
        tokio::spawn(actor.run(queue));
        log::debug!("sync controller for '{}' started", doc_id);

        let handle = SyncHandle {
            doc_id,
            commands,
            remote,
            inspector: Arc::new(HistoryInspector::new(engine)),
        };

        if config.pull_on_start {
            match handle.resync().await? {
                ResyncOutcome::Merged { version, .. } => {
                    log::info!("seeded '{}' from remote (version {})", handle.doc_id, version);
                }
                ResyncOutcome::NotFound => {
                    log::info!("no remote copy of '{}' yet", handle.doc_id);
                }
                ResyncOutcome::Unreachable(reason) => {
                    log::warn!("remote unreachable at startup, continuing locally: {}", reason);
                }
                ResyncOutcome::Rejected(e) => {
                    log::warn!("remote copy of '{}' rejected: {}", handle.doc_id, e);
                }
                ResyncOutcome::Disabled => {}
            }
        }

        Ok(handle)
    }
}

// ----------------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------------

struct Actor<E: MergeEngine> {
    doc_id: DocumentId,
    store: DocumentStore<E>,
    hooks: Vec<Box<dyn CommitHook>>,
    subscription: Option<Subscription>,
}

impl<E: MergeEngine> Actor<E> {
    async fn run(mut self, mut queue: mpsc::Receiver<Command<E::Document>>) {
        while let Some(command) = queue.recv().await {
            match command {
                Command::LocalEdit {
                    message,
                    mutator,
                    reply,
                } => {
                    let _ = reply.send(self.local_edit(message, mutator));
                }
                Command::Inbound {
                    snapshot,
                    origin,
                    reply,
                } => {
                    let outcome = self.inbound(&snapshot, origin);
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                Command::Current { reply } => {
                    let _ = reply.send((self.store.current(), self.store.version()));
                }
                Command::Shutdown { reply } => {
                    if let Some(subscription) = self.subscription.take() {
                        subscription.cancel();
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        log::debug!("sync controller for '{}' stopped", self.doc_id);
    }

    fn local_edit(&mut self, message: String, mutator: Mutator) -> Result<Student, EngineError> {
        let commit = self.store.apply_local_edit(&message, mutator)?;
        let projection = self.store.projection();
        hooks::run_hooks(
            &self.hooks,
            &Commit {
                doc_id: self.doc_id.clone(),
                kind: CommitKind::LocalEdit {
                    message,
                    snapshot: commit.snapshot,
                },
                version: commit.version,
                projection: projection.clone(),
            },
        );
        Ok(projection)
    }

    fn inbound(&mut self, snapshot: &Snapshot, origin: Origin) -> InboundOutcome {
        let remote = match self.store.engine().load(snapshot.as_bytes()) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!(
                    "dropping {} byte snapshot for '{}' from {:?}: {}",
                    snapshot.len(),
                    self.doc_id,
                    origin,
                    e
                );
                return InboundOutcome::Rejected(e);
            }
        };

        self.store.merge_inbound(&remote);
        let version = self.store.version();
        let projection = self.store.projection();
        hooks::run_hooks(
            &self.hooks,
            &Commit {
                doc_id: self.doc_id.clone(),
                kind: CommitKind::InboundMerge { origin },
                version,
                projection: projection.clone(),
            },
        );
        InboundOutcome::Merged {
            version,
            projection,
        }
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable handle onto a running controller.
pub struct SyncHandle<E: MergeEngine> {
    doc_id: DocumentId,
    commands: mpsc::Sender<Command<E::Document>>,
    remote: Option<Arc<dyn RemotePersistence>>,
    inspector: Arc<HistoryInspector<E>>,
}

impl<E: MergeEngine> Clone for SyncHandle<E> {
    fn clone(&self) -> Self {
        Self {
            doc_id: self.doc_id.clone(),
            commands: self.commands.clone(),
            remote: self.remote.clone(),
            inspector: Arc::clone(&self.inspector),
        }
    }
}

impl<E: MergeEngine> SyncHandle<E> {
    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command<E::Document>,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::Stopped)?;
        response.await.map_err(|_| SyncError::Stopped)
    }

    /// Apply `mutator` as one local change recorded under `message` and
    /// return the new projection.
    pub async fn apply_local_change<F>(
        &self,
        message: impl Into<String>,
        mutator: F,
    ) -> Result<Student, SyncError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), EngineError> + Send + 'static,
    {
        let message = message.into();
        let result = self
            .request(|reply| Command::LocalEdit {
                message,
                mutator: Box::new(mutator),
                reply,
            })
            .await?;
        Ok(result?)
    }

    /// Write the whole student record, with the editor's change message.
    pub async fn edit_student(&self, student: Student) -> Result<Student, SyncError> {
        let message = student.edit_message();
        self.apply_local_change(message, move |tx| {
            student.write_into(tx);
            Ok(())
        })
        .await
    }

    /// Merge a snapshot obtained out of band.
    pub async fn receive_snapshot(
        &self,
        snapshot: Snapshot,
        origin: Origin,
    ) -> Result<InboundOutcome, SyncError> {
        self.request(|reply| Command::Inbound {
            snapshot,
            origin,
            reply: Some(reply),
        })
        .await
    }

    /// Pull the remote copy and merge it. The request itself runs on the
    /// caller's task; only the result goes through the queue.
    pub async fn resync(&self) -> Result<ResyncOutcome, SyncError> {
        let Some(remote) = &self.remote else {
            return Ok(ResyncOutcome::Disabled);
        };
        let snapshot = match remote.pull(&self.doc_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(ResyncOutcome::NotFound),
            Err(e) => return Ok(ResyncOutcome::Unreachable(e.to_string())),
        };
        Ok(match self.receive_snapshot(snapshot, Origin::Remote).await? {
            InboundOutcome::Merged {
                version,
                projection,
            } => ResyncOutcome::Merged {
                version,
                projection,
            },
            InboundOutcome::Rejected(e) => ResyncOutcome::Rejected(e),
        })
    }

    pub async fn current(&self) -> Result<E::Document, SyncError> {
        let (doc, _) = self.request(|reply| Command::Current { reply }).await?;
        Ok(doc)
    }

    pub async fn projection(&self) -> Result<Student, SyncError> {
        let doc = self.current().await?;
        Ok(Student::project(&self.inspector_engine().state(&doc)))
    }

    /// Serialized form of the current document
    pub async fn snapshot(&self) -> Result<Snapshot, SyncError> {
        let doc = self.current().await?;
        Ok(self.inspector_engine().save(&doc)?)
    }

    pub async fn history(&self) -> Result<HistoryLog, SyncError> {
        let (doc, version) = self.request(|reply| Command::Current { reply }).await?;
        Ok(self.inspector.snapshot_history(&doc, version))
    }

    /// Stop the controller task and its broadcast subscription. Pushes
    /// already queued are left to finish on their own.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    fn inspector_engine(&self) -> &E {
        self.inspector.engine()
    }
}
