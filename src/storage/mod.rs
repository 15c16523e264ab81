//! Storage layer
//!
//! # Architecture
//!
//! The bulk never talks to a driver directly. Everything it needs from
//! Cassandra goes through the [`Session`] trait:
//!
//! ```text
//! Executor ──→ Session::execute(BoundStatement)              (per-item mode)
//!          └─→ Session::execute_batch(BatchKind, [Bound...]) (native batch mode)
//! ```
//!
//! Connection pooling, TLS and authentication live behind the trait in the
//! driver adapter. Two in-tree implementations exist:
//! - [`MockSession`] records statements in memory for tests
//! - [`TracingSession`] logs statements instead of sending them (dry run)

pub mod mock;
pub mod tracing_session;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use mock::MockSession;
pub use tracing_session::TracingSession;

/// Cassandra native batch flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    #[default]
    Logged,
    Unlogged,
    Counter,
}

impl BatchKind {
    /// Parse a configured batch type. Unknown values fall back to `Logged`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "unlogged" => BatchKind::Unlogged,
            "counter" => BatchKind::Counter,
            _ => BatchKind::Logged,
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchKind::Logged => "logged",
            BatchKind::Unlogged => "unlogged",
            BatchKind::Counter => "counter",
        };
        f.write_str(name)
    }
}

/// Statement text with its positional values already bound.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub query: Arc<str>,
    pub values: Vec<Value>,
}

impl BoundStatement {
    pub fn new(query: Arc<str>, values: Vec<Value>) -> Self {
        Self { query, values }
    }
}

/// Storage session trait
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute a single prepared statement.
    async fn execute(&self, statement: &BoundStatement) -> Result<()>;

    /// Execute several statements as one native batch.
    async fn execute_batch(&self, kind: BatchKind, statements: &[BoundStatement]) -> Result<()>;

    /// Release driver resources. Called once on connector shutdown.
    async fn close(&self) {}
}
