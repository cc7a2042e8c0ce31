//! ChangeBroadcaster: best-effort fan-out of snapshots to sibling contexts
//!
//! Topics are document ids. Delivery is fire-and-forget: no acknowledgment,
//! no ordering across publishers, and a slow subscriber loses messages
//! rather than blocking anyone. Receivers merge what they get, so loss,
//! duplication and reordering are all absorbed; the remote relay is the
//! durable fallback.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::convergent::Snapshot;
use crate::types::{ContextId, DocumentId};

/// Callback invoked once per received snapshot
pub type SnapshotHandler = Box<dyn Fn(Snapshot) + Send + Sync>;

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("No async runtime available to drive the subscription")]
    NoRuntime,
}

/// A live subscription. Dropping it leaves the listener running for the
/// rest of the process; call [`Subscription::cancel`] to stop it.
pub struct Subscription {
    doc_id: DocumentId,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

pub trait ChangeBroadcaster: Send + Sync {
    /// Send `snapshot` to every other listener on `doc_id`. Never fails
    /// from the caller's point of view.
    fn publish(&self, doc_id: &DocumentId, snapshot: &Snapshot);

    /// Invoke `on_receive` for every snapshot other contexts publish on
    /// `doc_id` from now on.
    fn subscribe(
        &self,
        doc_id: &DocumentId,
        on_receive: SnapshotHandler,
    ) -> Result<Subscription, BroadcastError>;
}

#[derive(Clone, Debug)]
struct Frame {
    origin: ContextId,
    snapshot: Snapshot,
}

/// In-process pub/sub shared by sibling contexts.
///
/// Each context attaches with [`LocalBus::attach`] and gets its own
/// [`LocalBroadcaster`]; a context never receives its own publications.
#[derive(Clone)]
pub struct LocalBus {
    topics: Arc<RwLock<HashMap<DocumentId, broadcast::Sender<Frame>>>>,
    capacity: usize,
}

impl LocalBus {
    /// `capacity` is the per-topic buffer; subscribers further behind
    /// than that skip ahead and the skipped messages are lost.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Attach a new sibling context to the bus
    pub fn attach(&self) -> LocalBroadcaster {
        LocalBroadcaster {
            bus: self.clone(),
            context: ContextId::new(),
        }
    }

    /// Number of live subscriptions on a topic
    pub fn listener_count(&self, doc_id: &DocumentId) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(doc_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, doc_id: &DocumentId) -> broadcast::Sender<Frame> {
        if let Some(tx) = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(doc_id)
        {
            return tx.clone();
        }
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(doc_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// One context's handle onto a [`LocalBus`].
pub struct LocalBroadcaster {
    bus: LocalBus,
    context: ContextId,
}

impl LocalBroadcaster {
    pub fn context(&self) -> ContextId {
        self.context
    }
}

impl ChangeBroadcaster for LocalBroadcaster {
    fn publish(&self, doc_id: &DocumentId, snapshot: &Snapshot) {
        let frame = Frame {
            origin: self.context,
            snapshot: snapshot.clone(),
        };
        match self.bus.sender(doc_id).send(frame) {
            Ok(receivers) => {
                log::debug!("[{}] published {} bytes on '{}' to {} listener(s)", self.context, snapshot.len(), doc_id, receivers);
            }
            Err(_) => {
                log::trace!("[{}] no listeners on '{}'", self.context, doc_id);
            }
        }
    }

    fn subscribe(
        &self,
        doc_id: &DocumentId,
        on_receive: SnapshotHandler,
    ) -> Result<Subscription, BroadcastError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| BroadcastError::NoRuntime)?;
        let mut rx = self.bus.sender(doc_id).subscribe();
        let own = self.context;
        let topic = doc_id.clone();

        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if frame.origin != own {
                            on_receive(frame.snapshot);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[{}] lagged on '{}', {} message(s) lost", own, topic, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription {
            doc_id: doc_id.clone(),
            task,
        })
    }
}
