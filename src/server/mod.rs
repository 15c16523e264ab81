//! Monitoring HTTP server
//!
//! Serves the health check and the Prometheus scrape endpoint next to the
//! running connector.

pub mod routes;

use axum::{extract::Extension, Router};
use prometheus::Registry;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::bulk::Bulk;
use crate::error::{Error, Result};

/// Shared state of the monitoring routes
#[derive(Clone)]
pub struct MonitorState {
    pub bulk: Arc<Bulk>,
    pub registry: Registry,
}

impl std::fmt::Debug for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorState")
            .field("bulk", &self.bulk)
            .finish()
    }
}

/// Build the monitoring router
pub fn router(state: MonitorState) -> Router {
    routes::monitoring_routes()
        .layer(Extension(Arc::new(state)))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
}

/// Serve the monitoring routes on `addr` until `shutdown` resolves.
pub async fn start_server<F>(addr: &str, state: MonitorState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "monitoring server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("monitoring server error: {}", e)))
}
