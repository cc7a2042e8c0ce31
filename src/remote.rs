//! RemotePersistence: durability and cross-session bridge
//!
//! The remote store is never the source of truth for a running process.
//! `push` is best-effort and only ever called after the local commit and
//! the broadcast have already happened; `pull` seeds a fresh process.
//!
//! Wire contract:
//!
//! ```text
//! GET  {base}/{docId}  -> 200 + snapshot bytes | 4xx or empty body (not found)
//! POST {base}/{docId}  <- snapshot bytes (application/octet-stream)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::RemoteConfig;
use crate::convergent::Snapshot;
use crate::types::DocumentId;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The request never got an answer (connect failure, timeout, ...)
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    /// The server answered with a server-side failure
    #[error("Remote responded with status {0}")]
    Status(u16),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

#[async_trait]
pub trait RemotePersistence: Send + Sync {
    /// Fetch the last stored snapshot. `Ok(None)` means the remote has
    /// nothing for this document yet.
    async fn pull(&self, doc_id: &DocumentId) -> Result<Option<Snapshot>, RemoteError>;

    /// Store `snapshot` as the latest state of `doc_id`.
    async fn push(&self, doc_id: &DocumentId, snapshot: Snapshot) -> Result<(), RemoteError>;
}

/// HTTP client for the relay endpoint
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        Self::new(config.base_url.clone(), config.timeout())
    }

    fn url(&self, doc_id: &DocumentId) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), doc_id)
    }
}

#[async_trait]
impl RemotePersistence for HttpRemote {
    async fn pull(&self, doc_id: &DocumentId) -> Result<Option<Snapshot>, RemoteError> {
        let response = self
            .client
            .get(self.url(doc_id))
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RemoteError::Status(status.as_u16()));
        }
        if !status.is_success() {
            log::debug!("pull '{}': status {}, treating as not found", doc_id, status);
            return Ok(None);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        if body.is_empty() {
            log::debug!("pull '{}': empty body, treating as not found", doc_id);
            return Ok(None);
        }
        Ok(Some(Snapshot::from_bytes(body)))
    }

    async fn push(&self, doc_id: &DocumentId, snapshot: Snapshot) -> Result<(), RemoteError> {
        let len = snapshot.len();
        let response = self
            .client
            .post(self.url(doc_id))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(snapshot.into_bytes())
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status(status.as_u16()));
        }
        log::debug!("pushed {} bytes for '{}'", len, doc_id);
        Ok(())
    }
}

/// In-memory remote, for tests and offline runs.
///
/// Counts pushes and can be switched into a failing mode to simulate an
/// unreachable server.
#[derive(Default)]
pub struct MemoryRemote {
    snapshots: RwLock<HashMap<DocumentId, Snapshot>>,
    pushes: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a snapshot, as if pushed in an earlier session
    pub fn with_snapshot(self, doc_id: DocumentId, snapshot: Snapshot) -> Self {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc_id, snapshot);
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of push attempts received, failed ones included
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn stored(&self, doc_id: &DocumentId) -> Option<Snapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(doc_id)
            .cloned()
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Unreachable("memory remote is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemotePersistence for MemoryRemote {
    async fn pull(&self, doc_id: &DocumentId) -> Result<Option<Snapshot>, RemoteError> {
        self.check_online()?;
        Ok(self.stored(doc_id).filter(|s| !s.is_empty()))
    }

    async fn push(&self, doc_id: &DocumentId, snapshot: Snapshot) -> Result<(), RemoteError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc_id.clone(), snapshot);
        Ok(())
    }
}
