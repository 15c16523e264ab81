//! Bulk writer: staging, deduplication, flushing and checkpointing
//!
//! # Pipeline
//!
//! ```text
//! add_actions ─→ StagingBuffer ─(threshold | ticker | close)─→ flush
//!                                                              │
//!     snapshot ─→ bounded queue ─→ WorkerPool ─→ Executor ─→ Session
//!                                     │
//!     completion signal ←─────────────┘
//!        ├─ Ok  → reset buffer, commit checkpoint
//!        └─ Err → keep buffer, poison bulk, surface fatal error
//! ```
//!
//! Accumulation, flushing and rebalance transitions share one exclusive
//! lock, so exactly one flush is in flight at any time and the checkpoint
//! commit of flush N always precedes the first write of flush N+1.
//!
//! A flush blocks until a worker has fully processed the batch. Until
//! [`Bulk::start`] has spawned the workers, a flush waits.

pub mod buffer;
pub mod executor;
pub mod metric;
pub mod rebalance;
pub mod statement;
pub mod worker;

pub use buffer::{StagedItem, StagingBuffer};
pub use executor::{ExecutionMode, Executor};
pub use metric::{BulkMetric, MetricSnapshot};
pub use rebalance::{RebalanceGate, RebalanceHandler, StreamEventHandler};
pub use statement::StatementCache;

use crate::config::CassandraConfig;
use crate::error::{Error, Result};
use crate::model::{Ack, WriteAction};
use crate::storage::Session;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use worker::{BatchReceiver, CompletionSignal, FlushBatch, WorkerPool};

/// Invoked once per successfully completed flush; it is then safe to
/// advance the change feed offset.
pub type CheckpointCommit = Arc<dyn Fn() + Send + Sync>;

pub struct Bulk {
    config: Arc<CassandraConfig>,
    staging: Mutex<StagingBuffer>,
    gate: RebalanceGate,
    executor: Arc<Executor>,
    sender: parking_lot::Mutex<Option<mpsc::Sender<FlushBatch>>>,
    receiver: BatchReceiver,
    checkpoint: CheckpointCommit,
    metric: Arc<BulkMetric>,
    shutdown: watch::Sender<bool>,
    aborted: parking_lot::Mutex<Option<String>>,
}

impl std::fmt::Debug for Bulk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulk")
            .field("keyspace", &self.config.keyspace)
            .field("mode", &self.executor.mode())
            .field("rebalancing", &self.gate.is_suspended())
            .finish()
    }
}

impl Bulk {
    pub fn new(
        config: CassandraConfig,
        session: Arc<dyn Session>,
        checkpoint: CheckpointCommit,
    ) -> Self {
        let config = Arc::new(config);
        let metric = Arc::new(BulkMetric::new());
        let executor = Arc::new(Executor::new(session, config.clone(), metric.clone()));
        let (sender, receiver) = mpsc::channel(config.queue_capacity());
        let (shutdown, _) = watch::channel(false);

        Self {
            staging: Mutex::new(StagingBuffer::with_capacity(config.batch_size_limit)),
            gate: RebalanceGate::new(),
            sender: parking_lot::Mutex::new(Some(sender)),
            receiver: Arc::new(Mutex::new(receiver)),
            aborted: parking_lot::Mutex::new(None),
            executor,
            checkpoint,
            metric,
            shutdown,
            config,
        }
    }

    /// Run the worker pool and the periodic flush until [`Bulk::close`].
    ///
    /// On close a final flush is attempted, the queue is closed and every
    /// worker is awaited. Returns the first fatal error encountered.
    pub async fn start(&self) -> Result<()> {
        let pool = WorkerPool::spawn(
            self.config.worker_count,
            self.receiver.clone(),
            self.executor.clone(),
        );
        info!(
            workers = pool.len(),
            mode = ?self.executor.mode(),
            interval_ms = self.config.batch_ticker_duration_ms,
            "bulk started"
        );

        let mut ticker = tokio::time::interval(self.config.batch_ticker_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut shutdown = self.shutdown.subscribe();

        let result = loop {
            if *shutdown.borrow_and_update() {
                info!("bulk closing, flushing remaining items");
                break self.flush().await;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        break Err(e);
                    }
                }
            }
        };

        self.sender.lock().take();
        let joined = pool.join().await;
        self.executor.session().close().await;
        info!("bulk stopped");

        result.and(joined)
    }

    /// Signal [`Bulk::start`] to flush once more and stop.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stage the actions mapped from one event.
    ///
    /// May block for a whole flush cycle when a threshold is reached.
    pub async fn add_actions(
        &self,
        ack: Ack,
        event_time: DateTime<Utc>,
        actions: Vec<WriteAction>,
    ) -> Result<()> {
        let mut staging = self.staging.lock().await;
        self.ensure_healthy()?;

        self.metric.record_process_latency(Utc::now() - event_time);

        if self.gate.is_suspended() {
            warn!(
                actions = actions.len(),
                "could not add new message to batch while rebalancing"
            );
            return Ok(());
        }

        staging.reserve_for(actions.len());
        for action in actions {
            let primary_key = self.config.primary_key_fields(&action.table);
            staging.stage(action, ack.clone(), primary_key);
        }

        if staging.len() >= self.config.batch_size_limit
            || staging.byte_size() >= self.config.batch_byte_size_limit
        {
            debug!(
                items = staging.len(),
                bytes = staging.byte_size(),
                "batch threshold reached"
            );
            self.flush_locked(&mut staging).await?;
        }
        Ok(())
    }

    /// Flush everything staged so far and commit the checkpoint on success.
    pub async fn flush(&self) -> Result<()> {
        let mut staging = self.staging.lock().await;
        self.flush_locked(&mut staging).await
    }

    #[instrument(skip(self, staging), fields(items = staging.len()))]
    async fn flush_locked(&self, staging: &mut StagingBuffer) -> Result<()> {
        // A batch that failed earlier is never resent in-process
        self.ensure_healthy()?;
        if self.gate.is_suspended() || staging.is_empty() {
            return Ok(());
        }

        let items = staging.snapshot();
        let count = items.len();
        let (completion, done) = CompletionSignal::new();

        let sender = self.sender.lock().clone();
        let outcome = match sender {
            Some(sender) => match sender.send(FlushBatch { items, completion }).await {
                Ok(()) => done.await.unwrap_or_else(|_| {
                    Err(Error::Aborted(
                        "worker exited before completing the batch".to_string(),
                    ))
                }),
                Err(_) => Err(Error::QueueClosed),
            },
            None => Err(Error::QueueClosed),
        };

        match outcome {
            Ok(()) => {
                staging.reset();
                (self.checkpoint)();
                debug!(items = count, "flush committed");
                Ok(())
            }
            Err(e) => {
                error!(items = count, error = %e, "flush failed, checkpoint not committed");
                self.abort(e.to_string());
                Err(e)
            }
        }
    }

    /// Poison the bulk and stop [`Bulk::start`] without a final commit.
    ///
    /// Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        self.aborted.lock().get_or_insert_with(|| reason.into());
        self.shutdown.send_replace(true);
    }

    fn ensure_healthy(&self) -> Result<()> {
        match self.aborted.lock().as_ref() {
            Some(reason) => Err(Error::Aborted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Suspend accumulation and flushing ahead of a partition handover.
    pub async fn prepare_start_rebalancing(&self) {
        let _staging = self.staging.lock().await;
        self.gate.suspend();
        info!("rebalance started, bulk suspended");
    }

    /// Resume accumulation and flushing.
    pub async fn prepare_end_rebalancing(&self) {
        let _staging = self.staging.lock().await;
        self.gate.resume();
        info!("rebalance finished, bulk resumed");
    }

    pub fn is_rebalancing(&self) -> bool {
        self.gate.is_suspended()
    }

    /// Set once a flush failed; the bulk then rejects all further work.
    pub fn abort_reason(&self) -> Option<String> {
        self.aborted.lock().clone()
    }

    pub fn metric(&self) -> &Arc<BulkMetric> {
        &self.metric
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn config(&self) -> &CassandraConfig {
        &self.config
    }

    /// Number of staged items. Waits for any flush in flight.
    pub async fn staged_len(&self) -> usize {
        self.staging.lock().await.len()
    }

    /// Approximate staged bytes. Waits for any flush in flight.
    pub async fn staged_byte_size(&self) -> usize {
        self.staging.lock().await.byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use crate::storage::MockSession;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(batch_size_limit: usize) -> CassandraConfig {
        CassandraConfig {
            keyspace: "ks".to_string(),
            batch_size_limit,
            batch_byte_size_limit: 1024 * 1024,
            batch_ticker_duration_ms: 60_000,
            worker_count: 1,
            primary_key: vec!["id".to_string()],
            ..Default::default()
        }
    }

    fn bulk(session: MockSession, batch_size_limit: usize) -> (Arc<Bulk>, Arc<AtomicUsize>) {
        let commits = Arc::new(AtomicUsize::new(0));
        let counter = commits.clone();
        let checkpoint: CheckpointCommit = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let bulk = Arc::new(Bulk::new(config(batch_size_limit), Arc::new(session), checkpoint));
        (bulk, commits)
    }

    fn upsert(id: &str) -> WriteAction {
        WriteAction::upsert("t", document! { "id" => id })
    }

    #[tokio::test]
    async fn test_below_threshold_stays_staged() {
        let session = MockSession::new();
        let (bulk, commits) = bulk(session.clone(), 3);

        bulk.add_actions(Ack::noop(), Utc::now(), vec![upsert("a"), upsert("b")])
            .await
            .unwrap();

        assert_eq!(bulk.staged_len().await, 2);
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_flushes_before_returning() {
        let session = MockSession::new();
        let (bulk, commits) = bulk(session.clone(), 3);
        let runner = {
            let bulk = bulk.clone();
            tokio::spawn(async move { bulk.start().await })
        };

        bulk.add_actions(Ack::noop(), Utc::now(), vec![upsert("a"), upsert("b"), upsert("c")])
            .await
            .unwrap();

        assert_eq!(session.len(), 3);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(bulk.staged_len().await, 0);

        bulk.close();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_commit() {
        let (bulk, commits) = bulk(MockSession::new(), 3);
        bulk.flush().await.unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suspended_gate_drops_adds_and_skips_flush() {
        let session = MockSession::new();
        let (bulk, commits) = bulk(session.clone(), 10);

        bulk.add_actions(Ack::noop(), Utc::now(), vec![upsert("a")]).await.unwrap();
        bulk.prepare_start_rebalancing().await;
        assert!(bulk.is_rebalancing());

        bulk.add_actions(Ack::noop(), Utc::now(), vec![upsert("b")]).await.unwrap();
        bulk.flush().await.unwrap();
        assert_eq!(bulk.staged_len().await, 1);
        assert_eq!(commits.load(Ordering::SeqCst), 0);

        bulk.prepare_end_rebalancing().await;
        let runner = {
            let bulk = bulk.clone();
            tokio::spawn(async move { bulk.start().await })
        };
        bulk.flush().await.unwrap();

        assert_eq!(bulk.staged_len().await, 0);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(session.len(), 1);

        bulk.close();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_latency_recorded_even_when_suspended() {
        let (bulk, _) = bulk(MockSession::new(), 10);
        bulk.prepare_start_rebalancing().await;

        let event_time = Utc::now() - chrono::Duration::seconds(5);
        bulk.add_actions(Ack::noop(), event_time, vec![upsert("a")]).await.unwrap();

        assert!(bulk.metric().process_latency_ms() >= 5000);
        assert_eq!(bulk.staged_len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_flush_poisons_bulk() {
        let session = MockSession::new().fail_on_table("t");
        let (bulk, commits) = bulk(session, 10);
        let runner = {
            let bulk = bulk.clone();
            tokio::spawn(async move { bulk.start().await })
        };

        bulk.add_actions(Ack::noop(), Utc::now(), vec![upsert("a")]).await.unwrap();
        let err = bulk.flush().await.unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert_eq!(bulk.staged_len().await, 1);
        assert!(bulk.abort_reason().is_some());

        let err = bulk
            .add_actions(Ack::noop(), Utc::now(), vec![upsert("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));

        bulk.close();
        assert!(tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .is_err());
    }

    #[tokio::test]
    async fn test_close_flushes_remaining_items() {
        let session = MockSession::new();
        let (bulk, commits) = bulk(session.clone(), 100);
        let runner = {
            let bulk = bulk.clone();
            tokio::spawn(async move { bulk.start().await })
        };

        bulk.add_actions(Ack::noop(), Utc::now(), vec![upsert("a"), upsert("b")])
            .await
            .unwrap();
        bulk.close();
        runner.await.unwrap().unwrap();

        assert_eq!(session.len(), 2);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_flushes_periodically() {
        let session = MockSession::new();
        let (bulk, commits) = bulk(session.clone(), 100);
        let runner = {
            let bulk = bulk.clone();
            tokio::spawn(async move { bulk.start().await })
        };

        bulk.add_actions(Ack::noop(), Utc::now(), vec![upsert("a")]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(session.len(), 1);

        bulk.close();
        runner.await.unwrap().unwrap();
    }
}
