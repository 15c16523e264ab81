//! Prometheus exposition of the bulk latency gauges
//!
//! Gauges are read from the live [`BulkMetric`] at scrape time, so they
//! always report the last observed values. Each connector owns its own
//! [`Registry`].

use crate::bulk::BulkMetric;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

pub struct BulkMetricsCollector {
    metric: Arc<BulkMetric>,
    process_latency: IntGauge,
    bulk_request_process_latency: IntGauge,
}

impl BulkMetricsCollector {
    pub fn new(metric: Arc<BulkMetric>) -> prometheus::Result<Self> {
        Ok(Self {
            metric,
            process_latency: IntGauge::with_opts(Opts::new(
                "cassandra_connector_latency_ms_current",
                "Cassandra connector latency ms",
            ))?,
            bulk_request_process_latency: IntGauge::with_opts(Opts::new(
                "cassandra_connector_bulk_request_process_latency_ms_current",
                "Cassandra connector bulk request process latency ms",
            ))?,
        })
    }
}

impl Collector for BulkMetricsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.process_latency
            .desc()
            .into_iter()
            .chain(self.bulk_request_process_latency.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.metric.snapshot();
        self.process_latency.set(snapshot.process_latency_ms);
        self.bulk_request_process_latency
            .set(snapshot.bulk_request_process_latency_ms);

        let mut families = self.process_latency.collect();
        families.extend(self.bulk_request_process_latency.collect());
        families
    }
}

/// New registry with the bulk collector registered
pub fn registry(metric: Arc<BulkMetric>) -> prometheus::Result<Registry> {
    let registry = Registry::new();
    registry.register(Box::new(BulkMetricsCollector::new(metric)?))?;
    Ok(registry)
}

/// Encode every metric in `registry` in Prometheus text format
pub fn export_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
