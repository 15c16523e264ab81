//! Connector: wires the listener, mapper, bulk and monitoring together
//!
//! ```rust,no_run
//! use dcp_cassandra::{ConnectorBuilder, ConnectorConfig};
//!
//! # async fn run() -> dcp_cassandra::error::Result<()> {
//! let config = ConnectorConfig::load("config.toml")?;
//! let connector = ConnectorBuilder::new(config).build()?;
//! connector.start().await
//! # }
//! ```

use crate::bulk::{Bulk, CheckpointCommit, RebalanceHandler};
use crate::config::ConnectorConfig;
use crate::error::{Error, Result};
use crate::event::{ListenerContext, ListenerEvent};
use crate::mapper::{CollectionMapper, Mapper, SimpleMapper};
use crate::metrics;
use crate::storage::{Session, TracingSession};
use prometheus::Registry;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Builds a [`Connector`] from configuration plus optional overrides
pub struct ConnectorBuilder {
    config: ConnectorConfig,
    mapper: Option<Arc<dyn Mapper>>,
    checkpoint: Option<CheckpointCommit>,
    session: Option<Arc<dyn Session>>,
}

impl ConnectorBuilder {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            mapper: None,
            checkpoint: None,
            session: None,
        }
    }

    pub fn mapper(mut self, mapper: impl Mapper + 'static) -> Self {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    /// Called after every committed flush; advance the feed offset here.
    pub fn checkpoint(mut self, checkpoint: CheckpointCommit) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn session(mut self, session: Arc<dyn Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> Result<Connector> {
        let mut config = self.config;
        config.apply_defaults();
        config.validate()?;

        let mapper = self.mapper.unwrap_or_else(|| default_mapper(&config));
        let checkpoint = self.checkpoint.unwrap_or_else(|| Arc::new(|| {}));
        let session = self.session.unwrap_or_else(|| {
            warn!("no session configured, writes are only logged");
            Arc::new(TracingSession::new())
        });

        let bulk = Arc::new(Bulk::new(config.cassandra.clone(), session, checkpoint));
        let registry = metrics::registry(bulk.metric().clone())
            .map_err(|e| Error::Internal(format!("metrics registry: {}", e)))?;

        info!(
            keyspace = %config.cassandra.keyspace,
            workers = config.cassandra.worker_count,
            batch_size_limit = config.cassandra.batch_size_limit,
            "connector built"
        );

        Ok(Connector {
            config,
            bulk,
            mapper,
            registry,
        })
    }
}

fn default_mapper(config: &ConnectorConfig) -> Arc<dyn Mapper> {
    let cassandra = &config.cassandra;
    if !cassandra.collection_table_mapping.is_empty() {
        Arc::new(CollectionMapper::new(
            cassandra.collection_table_mapping.clone(),
        ))
    } else if !cassandra.table_name.is_empty() {
        Arc::new(SimpleMapper::new(cassandra.table_name.clone()))
    } else {
        Arc::new(SimpleMapper::default())
    }
}

pub struct Connector {
    config: ConnectorConfig,
    bulk: Arc<Bulk>,
    mapper: Arc<dyn Mapper>,
    registry: Registry,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("bulk", &self.bulk)
            .field("app_port", &self.config.app_port)
            .finish()
    }
}

impl Connector {
    /// Handle one event from the feed client.
    ///
    /// Events the sink does not care about, and events the mapper filters
    /// out, are acknowledged right away. A fatal mapping failure aborts the
    /// bulk; other failures only reject this event, which stays unacked.
    pub async fn listener(&self, ctx: ListenerContext) -> Result<()> {
        let ListenerContext { event, ack } = ctx;
        let event = match event {
            ListenerEvent::Change(event) => event,
            ListenerEvent::Other(kind) => {
                debug!(kind = %kind, "ignoring non-change event");
                ack.ack();
                return Ok(());
            }
        };

        let actions = match self.mapper.map(&event) {
            Ok(actions) => actions,
            Err(e) => {
                error!(
                    key = %event.key_str(),
                    collection = %event.collection_name,
                    error = %e,
                    fatal = e.is_fatal(),
                    "mapping failed"
                );
                if e.is_fatal() {
                    self.bulk.abort(e.to_string());
                }
                return Err(e);
            }
        };

        if actions.is_empty() {
            ack.ack();
            return Ok(());
        }

        self.bulk.add_actions(ack, event.event_time, actions).await
    }

    /// Run until [`Connector::close`] or SIGINT/SIGTERM.
    pub async fn start(&self) -> Result<()> {
        let bulk = self.bulk.clone();
        let signals = tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            bulk.close();
        });

        let result = self.bulk.start().await;
        signals.abort();
        result
    }

    pub fn close(&self) {
        self.bulk.close();
    }

    pub fn bulk(&self) -> &Arc<Bulk> {
        &self.bulk
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Stream lifecycle hooks bound to this connector's bulk
    pub fn event_handler(&self, is_finite: bool) -> RebalanceHandler {
        RebalanceHandler::new(self.bulk.clone(), is_finite)
    }

    pub fn metrics_registry(&self) -> &Registry {
        &self.registry
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
