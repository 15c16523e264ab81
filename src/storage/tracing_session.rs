//! Dry-run session that logs statements instead of sending them

use super::{BatchKind, BoundStatement, Session};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct TracingSession {
    executed: AtomicU64,
}

impl TracingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements logged so far
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Session for TracingSession {
    async fn execute(&self, statement: &BoundStatement) -> Result<()> {
        info!(query = %statement.query, values = ?statement.values, "execute");
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn execute_batch(&self, kind: BatchKind, statements: &[BoundStatement]) -> Result<()> {
        info!(kind = %kind, size = statements.len(), "begin batch");
        for statement in statements {
            info!(query = %statement.query, values = ?statement.values, "  batch entry");
        }
        self.executed
            .fetch_add(statements.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        info!(executed = self.executed(), "dry-run session closed");
    }
}
