//! Executes flush batches against the storage session

use super::buffer::StagedItem;
use super::metric::BulkMetric;
use super::statement::{bind_values, StatementCache};
use crate::config::CassandraConfig;
use crate::error::{Error, Result};
use crate::model::{Operation, WriteAction};
use crate::storage::{BatchKind, BoundStatement, Session};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, instrument};

/// How a flush batch is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One statement per item, acknowledged as soon as it succeeds
    PerItem,
    /// Native Cassandra batches of at most `max_size` statements,
    /// acknowledged only after the whole flush batch succeeds
    NativeBatch { kind: BatchKind, max_size: usize },
}

impl ExecutionMode {
    pub fn from_config(config: &CassandraConfig) -> Self {
        if config.use_batch {
            ExecutionMode::NativeBatch {
                kind: config.batch_kind(),
                max_size: config.max_batch_size.max(1),
            }
        } else {
            ExecutionMode::PerItem
        }
    }
}

pub struct Executor {
    session: Arc<dyn Session>,
    statements: StatementCache,
    config: Arc<CassandraConfig>,
    mode: ExecutionMode,
    metric: Arc<BulkMetric>,
}

impl Executor {
    pub fn new(
        session: Arc<dyn Session>,
        config: Arc<CassandraConfig>,
        metric: Arc<BulkMetric>,
    ) -> Self {
        Self {
            statements: StatementCache::new(config.keyspace.clone()),
            mode: ExecutionMode::from_config(&config),
            session,
            config,
            metric,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Validate `action` and bind it to its cached statement.
    pub fn prepare(&self, action: &WriteAction) -> Result<BoundStatement> {
        self.validate(action)?;
        let query = self.statements.get_or_build(action);
        Ok(BoundStatement::new(query, bind_values(action)))
    }

    fn validate(&self, action: &WriteAction) -> Result<()> {
        match action.operation {
            Operation::Insert | Operation::Upsert => {
                for field in self.config.primary_key_fields(&action.table) {
                    if !action.document.contains_key(field) {
                        return Err(Error::Validation(format!(
                            "primary key field '{}' is required for idempotency",
                            field
                        )));
                    }
                }
            }
            Operation::Update => {
                if action.document.is_empty() || action.filter.is_empty() {
                    return Err(Error::Validation(format!(
                        "update on {} needs both document and filter",
                        action.table
                    )));
                }
            }
            Operation::Delete => {
                if action.filter.is_empty() {
                    return Err(Error::Validation(format!(
                        "delete on {} without filter",
                        action.table
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write a single action outside of any flush.
    pub async fn write(&self, action: &WriteAction) -> Result<()> {
        let statement = self.prepare(action)?;
        self.session
            .execute(&statement)
            .await
            .map_err(|e| execution_error(action, e))
    }

    /// Write every item of a flush batch. Any failure aborts the whole batch.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn process(&self, items: &[StagedItem]) -> Result<()> {
        let started = Instant::now();

        match self.mode {
            ExecutionMode::PerItem => self.process_each(items).await?,
            ExecutionMode::NativeBatch { kind, max_size } => {
                self.process_native(items, kind, max_size).await?
            }
        }

        self.metric.record_bulk_request_latency(started.elapsed());
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "batch processed");
        Ok(())
    }

    async fn process_each(&self, items: &[StagedItem]) -> Result<()> {
        for item in items {
            if let Err(e) = self.write(&item.action).await {
                error!(
                    table = %item.action.table,
                    id = %item.action.declared_id().unwrap_or_default(),
                    error = %e,
                    "Cassandra write failed"
                );
                return Err(e);
            }
            item.ack.ack();
        }
        Ok(())
    }

    async fn process_native(
        &self,
        items: &[StagedItem],
        kind: BatchKind,
        max_size: usize,
    ) -> Result<()> {
        let mut pending: Vec<BoundStatement> = Vec::with_capacity(max_size.min(items.len()));
        let mut pending_items: Vec<&StagedItem> = Vec::with_capacity(pending.capacity());

        for item in items {
            let statement = self.prepare(&item.action).map_err(|e| {
                error!(
                    table = %item.action.table,
                    id = %item.action.declared_id().unwrap_or_default(),
                    error = %e,
                    "invalid action in batch"
                );
                e
            })?;
            pending.push(statement);
            pending_items.push(item);

            if pending.len() >= max_size {
                self.execute_native(kind, &pending, &pending_items).await?;
                pending.clear();
                pending_items.clear();
            }
        }

        if !pending.is_empty() {
            self.execute_native(kind, &pending, &pending_items).await?;
        }

        for item in items {
            item.ack.ack();
        }
        Ok(())
    }

    async fn execute_native(
        &self,
        kind: BatchKind,
        statements: &[BoundStatement],
        items: &[&StagedItem],
    ) -> Result<()> {
        self.session
            .execute_batch(kind, statements)
            .await
            .map_err(|e| {
                let first = items.first().map(|item| &item.action);
                error!(
                    kind = %kind,
                    size = statements.len(),
                    table = %first.map(|a| a.table.as_str()).unwrap_or_default(),
                    error = %e,
                    "Cassandra batch write failed"
                );
                Error::Execution {
                    table: first.map(|a| a.table.clone()).unwrap_or_default(),
                    id: format!("batch of {}", statements.len()),
                    message: e.to_string(),
                }
            })
    }
}

fn execution_error(action: &WriteAction, err: Error) -> Error {
    match err {
        Error::Execution { .. } => err,
        other => Error::Execution {
            table: action.table.clone(),
            id: action.declared_id().unwrap_or_default(),
            message: other.to_string(),
        },
    }
}
