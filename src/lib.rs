// DCP Cassandra - Rust Implementation
// Streams Couchbase DCP mutations into Cassandra with checkpoint-safe batching

#![warn(rust_2018_idioms)]

pub mod bulk;
pub mod config;
pub mod connector;
pub mod event;
pub mod mapper;
pub mod metrics;
pub mod model;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use bulk::{Bulk, BulkMetric, CheckpointCommit};
pub use config::ConnectorConfig;
pub use connector::{Connector, ConnectorBuilder};
pub use event::{ChangeEvent, EventKind, ListenerContext, ListenerEvent};
pub use mapper::Mapper;
pub use model::{Ack, Operation, WriteAction};
pub use storage::{BatchKind, BoundStatement, Session};

/// Connector error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// Rejected before any write was attempted
        #[error("Validation error: {0}")]
        Validation(String),

        #[error("Cassandra write failed for table {table} (id {id}): {message}")]
        Execution {
            table: String,
            id: String,
            message: String,
        },

        #[error("Configuration error: {0}")]
        Config(String),

        /// The pipeline hit a fatal error earlier and refuses further work
        #[error("Bulk aborted: {0}")]
        Aborted(String),

        #[error("Bulk queue closed")]
        QueueClosed,

        #[error("Mapping error: {0}")]
        Mapping(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Errors that must stop the service instead of being retried in-process.
        pub fn is_fatal(&self) -> bool {
            !matches!(self, Error::Config(_) | Error::Serialization(_))
        }
    }

    impl From<serde_json::Error> for Error {
        fn from(err: serde_json::Error) -> Self {
            Error::Serialization(err.to_string())
        }
    }

    impl From<config::ConfigError> for Error {
        fn from(err: config::ConfigError) -> Self {
            Error::Config(err.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
