//! Rebalance gating and stream lifecycle hooks
//!
//! ```text
//!   Active ──before_stream_stop──→ Suspended ──before_stream_start──→ Active
//! ```
//!
//! While suspended, new actions are dropped and flushes are skipped. Items
//! already staged stay in the buffer untouched until the gate reopens.

use super::Bulk;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Suspended flag, read lock-free on the hot path.
///
/// Writes happen only while the staging lock is held, so a flush in
/// flight never observes the gate toggling underneath it.
#[derive(Debug, Default)]
pub struct RebalanceGate {
    suspended: AtomicBool,
}

impl RebalanceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }
}

/// DCP stream lifecycle callbacks. Every hook defaults to a no-op.
#[async_trait]
pub trait StreamEventHandler: Send + Sync {
    async fn before_rebalance_start(&self) {}
    async fn after_rebalance_start(&self) {}
    async fn before_rebalance_end(&self) {}
    async fn after_rebalance_end(&self) {}
    async fn before_stream_start(&self) {}
    async fn after_stream_start(&self) {}
    async fn before_stream_stop(&self) {}
    async fn after_stream_stop(&self) {}
}

/// Drives the bulk's rebalance gate from stream lifecycle events.
#[derive(Clone)]
pub struct RebalanceHandler {
    bulk: Arc<Bulk>,
    is_finite: bool,
}

impl RebalanceHandler {
    pub fn new(bulk: Arc<Bulk>, is_finite: bool) -> Self {
        Self { bulk, is_finite }
    }
}

#[async_trait]
impl StreamEventHandler for RebalanceHandler {
    async fn before_stream_start(&self) {
        self.bulk.prepare_end_rebalancing().await;
    }

    async fn before_stream_stop(&self) {
        if self.is_finite {
            info!("finite stream stopping, rebalance gate left open");
            return;
        }
        self.bulk.prepare_start_rebalancing().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_cycles() {
        let gate = RebalanceGate::new();
        assert!(!gate.is_suspended());
        gate.suspend();
        assert!(gate.is_suspended());
        gate.resume();
        assert!(!gate.is_suspended());
    }
}
