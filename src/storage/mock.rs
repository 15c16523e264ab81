//! Mock session for testing
//!
//! This module provides an in-memory [`Session`] that records every
//! statement it is asked to run, with optional failure injection and
//! latency so tests can exercise backpressure and abort paths.

use super::{BatchKind, BoundStatement, Session};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// One call recorded by [`MockSession`]
#[derive(Debug, Clone, PartialEq)]
pub enum Executed {
    Single(BoundStatement),
    Batch {
        kind: BatchKind,
        statements: Vec<BoundStatement>,
    },
}

#[derive(Default)]
struct MockState {
    executed: Vec<Executed>,
    statement_count: usize,
    fail_table: Option<String>,
    fail_after: Option<usize>,
    fail_next: usize,
    delay: Option<Duration>,
    closed: bool,
}

/// In-memory mock session for testing
#[derive(Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    /// Create a new mock session
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement that targets `table`.
    pub fn fail_on_table(self, table: impl Into<String>) -> Self {
        self.state.lock().fail_table = Some(table.into());
        self
    }

    /// Succeed for the first `count` statements, fail afterwards.
    pub fn fail_after(self, count: usize) -> Self {
        self.state.lock().fail_after = Some(count);
        self
    }

    /// Fail the next `count` calls, then succeed again.
    pub fn fail_next(self, count: usize) -> Self {
        self.state.lock().fail_next = count;
        self
    }

    /// Sleep before every execution.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().delay = Some(delay);
        self
    }

    /// All recorded calls in execution order
    pub fn executed(&self) -> Vec<Executed> {
        self.state.lock().executed.clone()
    }

    /// Every statement, with native batches flattened
    pub fn statements(&self) -> Vec<BoundStatement> {
        self.state
            .lock()
            .executed
            .iter()
            .flat_map(|call| match call {
                Executed::Single(statement) => vec![statement.clone()],
                Executed::Batch { statements, .. } => statements.clone(),
            })
            .collect()
    }

    /// Number of statements executed successfully
    pub fn len(&self) -> usize {
        self.state.lock().statement_count
    }

    /// Check if nothing has been executed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.executed.clear();
        state.statement_count = 0;
    }

    async fn pause(&self) {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_transient(state: &mut MockState) -> Result<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Internal("mock transient failure".to_string()));
        }
        Ok(())
    }

    fn check(state: &MockState, statement: &BoundStatement, pending: usize) -> Result<()> {
        if let Some(table) = &state.fail_table {
            let target = format!(".{} ", table);
            if statement.query.contains(&target) {
                return Err(Error::Internal(format!("mock failure on table {}", table)));
            }
        }
        if let Some(limit) = state.fail_after {
            if state.statement_count + pending >= limit {
                return Err(Error::Internal(format!(
                    "mock failure after {} statements",
                    limit
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MockSession {
    async fn execute(&self, statement: &BoundStatement) -> Result<()> {
        self.pause().await;

        let mut state = self.state.lock();
        Self::take_transient(&mut state)?;
        Self::check(&state, statement, 0)?;
        state.executed.push(Executed::Single(statement.clone()));
        state.statement_count += 1;
        Ok(())
    }

    async fn execute_batch(&self, kind: BatchKind, statements: &[BoundStatement]) -> Result<()> {
        self.pause().await;

        let mut state = self.state.lock();
        Self::take_transient(&mut state)?;
        for (pending, statement) in statements.iter().enumerate() {
            Self::check(&state, statement, pending)?;
        }
        state.executed.push(Executed::Batch {
            kind,
            statements: statements.to_vec(),
        });
        state.statement_count += statements.len();
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn statement(query: &str) -> BoundStatement {
        BoundStatement::new(Arc::from(query), vec![json!("a")])
    }

    #[tokio::test]
    async fn test_mock_session_records() -> Result<()> {
        let session = MockSession::new();

        session.execute(&statement("DELETE FROM ks.t WHERE id = ?")).await?;
        session
            .execute_batch(
                BatchKind::Unlogged,
                &vec![statement("DELETE FROM ks.t WHERE id = ?"); 2],
            )
            .await?;

        assert_eq!(session.len(), 3);
        assert_eq!(session.executed().len(), 2);
        assert_eq!(session.statements().len(), 3);

        session.clear();
        assert!(session.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mock_session_failures() {
        let session = MockSession::new().fail_on_table("broken");
        assert!(session
            .execute(&statement("DELETE FROM ks.broken WHERE id = ?"))
            .await
            .is_err());
        assert!(session
            .execute(&statement("DELETE FROM ks.fine WHERE id = ?"))
            .await
            .is_ok());

        let session = MockSession::new().fail_next(1);
        assert!(session.execute(&statement("DELETE FROM ks.t WHERE id = ?")).await.is_err());
        assert!(session.execute(&statement("DELETE FROM ks.t WHERE id = ?")).await.is_ok());

        let session = MockSession::new().fail_after(1);
        assert!(session.execute(&statement("DELETE FROM ks.t WHERE id = ?")).await.is_ok());
        assert!(session.execute(&statement("DELETE FROM ks.t WHERE id = ?")).await.is_err());
        assert_eq!(session.len(), 1);
    }
}
