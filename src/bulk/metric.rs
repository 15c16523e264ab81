//! Last-observed bulk latencies

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Latest latency values, overwritten on every add and every flush.
#[derive(Debug, Default)]
pub struct BulkMetric {
    process_latency_ms: AtomicI64,
    bulk_request_process_latency_ms: AtomicI64,
}

/// Point-in-time copy of [`BulkMetric`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricSnapshot {
    /// Event time to staging, i.e. feed lag at ingestion
    pub process_latency_ms: i64,
    /// Duration of the last successfully processed flush batch
    pub bulk_request_process_latency_ms: i64,
}

impl BulkMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_process_latency(&self, latency: chrono::Duration) {
        self.process_latency_ms
            .store(latency.num_milliseconds(), Ordering::Relaxed);
    }

    pub fn record_bulk_request_latency(&self, latency: Duration) {
        let ms = i64::try_from(latency.as_millis()).unwrap_or(i64::MAX);
        self.bulk_request_process_latency_ms
            .store(ms, Ordering::Relaxed);
    }

    pub fn process_latency_ms(&self) -> i64 {
        self.process_latency_ms.load(Ordering::Relaxed)
    }

    pub fn bulk_request_process_latency_ms(&self) -> i64 {
        self.bulk_request_process_latency_ms.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            process_latency_ms: self.process_latency_ms(),
            bulk_request_process_latency_ms: self.bulk_request_process_latency_ms(),
        }
    }
}
