//! Development relay: an in-memory implementation of the remote endpoint
//!
//! Keeps the latest body POSTed per document id and serves it back on GET.
//! It does not merge; clients do. Nothing survives a restart.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use warp::http::header::{HeaderValue, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::{Filter, Reply};

/// Largest snapshot the relay accepts
pub const MAX_SNAPSHOT_BYTES: u64 = 16 * 1024 * 1024;

type SnapshotTable = Arc<RwLock<HashMap<String, Bytes>>>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind relay: {0}")]
    Bind(#[from] warp::Error),
}

#[derive(Clone, Default)]
pub struct Relay {
    snapshots: SnapshotTable,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest stored body for `doc_id`
    pub async fn get(&self, doc_id: &str) -> Option<Bytes> {
        self.snapshots.read().await.get(doc_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
        // Browser-based editors call this endpoint directly
        let cors = warp::cors()
            .allow_any_origin()
            .allow_headers(vec!["content-type"])
            .allow_methods(vec!["GET", "POST"]);

        let get_snapshot = warp::path::param::<String>()
            .and(warp::path::end())
            .and(warp::get())
            .and(with_table(Arc::clone(&self.snapshots)))
            .and_then(handle_get);

        let put_snapshot = warp::path::param::<String>()
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::body::content_length_limit(MAX_SNAPSHOT_BYTES))
            .and(warp::body::bytes())
            .and(with_table(Arc::clone(&self.snapshots)))
            .and_then(handle_post);

        get_snapshot.or(put_snapshot).with(cors)
    }

    /// Bind `addr` (port 0 picks one) and serve on a background task.
    pub fn spawn(&self, addr: SocketAddr) -> Result<RunningRelay, RelayError> {
        let (addr, server) = warp::serve(self.routes()).try_bind_ephemeral(addr)?;
        log::info!("relay listening on http://{}", addr);
        Ok(RunningRelay {
            addr,
            task: tokio::spawn(server),
        })
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn serve_until<F>(&self, addr: SocketAddr, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (addr, server) =
            warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, shutdown)?;
        log::info!("relay listening on http://{}", addr);
        server.await;
        log::info!("relay on {} stopped", addr);
        Ok(())
    }
}

/// A relay serving on a background task
pub struct RunningRelay {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningRelay {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL for [`crate::remote::HttpRemote`]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

fn with_table(
    table: SnapshotTable,
) -> impl Filter<Extract = (SnapshotTable,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&table))
}

async fn handle_get(doc_id: String, table: SnapshotTable) -> Result<warp::reply::Response, warp::Rejection> {
    match table.read().await.get(&doc_id) {
        Some(body) => {
            log::debug!("GET '{}': {} bytes", doc_id, body.len());
            let mut response = warp::reply::Response::new(body.clone().into());
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
            Ok(response)
        }
        None => {
            log::debug!("GET '{}': not found", doc_id);
            Ok(StatusCode::NOT_FOUND.into_response())
        }
    }
}

async fn handle_post(
    doc_id: String,
    body: Bytes,
    table: SnapshotTable,
) -> Result<warp::reply::Response, warp::Rejection> {
    log::debug!("POST '{}': {} bytes", doc_id, body.len());
    table.write().await.insert(doc_id, body);
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_document_is_404() {
        let relay = Relay::new();
        let response = warp::test::request()
            .method("GET")
            .path("/student")
            .reply(&relay.routes())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_then_get() {
        let relay = Relay::new();
        let routes = relay.routes();

        let response = warp::test::request()
            .method("POST")
            .path("/student")
            .header("content-type", "application/octet-stream")
            .body(vec![1u8, 2, 3])
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = warp::test::request()
            .method("GET")
            .path("/student")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), &[1u8, 2, 3]);
        assert_eq!(relay.len().await, 1);
    }

    #[tokio::test]
    async fn test_post_replaces_previous_body() {
        let relay = Relay::new();
        let routes = relay.routes();
        for body in [vec![1u8], vec![2u8, 2]] {
            warp::test::request()
                .method("POST")
                .path("/student")
                .body(body)
                .reply(&routes)
                .await;
        }
        assert_eq!(relay.get("student").await, Some(Bytes::from(vec![2u8, 2])));
    }

    #[tokio::test]
    async fn test_nested_paths_are_not_documents() {
        let relay = Relay::new();
        let response = warp::test::request()
            .method("GET")
            .path("/student/extra")
            .reply(&relay.routes())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
