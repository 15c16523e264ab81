//! Connector configuration
//!
//! Loaded from a TOML/YAML/JSON file with `DCP_CASSANDRA__*` environment
//! overrides, e.g. `DCP_CASSANDRA__CASSANDRA__WORKER_COUNT=4`.

use crate::error::{Error, Result};
use crate::storage::BatchKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const VALID_CONSISTENCIES: &[&str] = &[
    "ANY",
    "ONE",
    "TWO",
    "THREE",
    "QUORUM",
    "ALL",
    "LOCAL_QUORUM",
    "EACH_QUORUM",
    "LOCAL_ONE",
];

/// Maximum capacity of the flush queue regardless of worker count
pub const MAX_QUEUE_CAPACITY: usize = 10;

/// Routes one Couchbase collection to one Cassandra table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionTableMapping {
    pub collection: String,
    pub table_name: String,
    /// Cassandra column -> source field path
    pub field_mappings: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub min_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub enable: bool,
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
    pub insecure_skip_verify: bool,
}

/// Cassandra sink configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CassandraConfig {
    pub hosts: Vec<String>,
    pub username: String,
    pub password: String,
    pub keyspace: String,
    pub timeout_ms: u64,
    /// Staged item count that triggers a flush
    pub batch_size_limit: usize,
    /// Approximate staged bytes that trigger a flush
    pub batch_byte_size_limit: usize,
    /// Periodic flush interval
    pub batch_ticker_duration_ms: u64,
    pub worker_count: usize,
    /// Target table for the simple mapper
    pub table_name: String,
    pub collection_table_mapping: Vec<CollectionTableMapping>,
    pub consistency: String,
    pub batch_type: String,
    /// Write flushes as native Cassandra batches instead of one statement per item
    pub use_batch: bool,
    pub max_batch_size: usize,
    pub num_conns: u32,
    pub connect_timeout_ms: u64,
    pub keep_alive_ms: u64,
    pub max_prepared_stmts: usize,
    pub max_routing_key_info: usize,
    pub page_size: u32,
    pub serial_consistency: String,
    pub retry_policy: RetryPolicy,
    pub compressor: String,
    pub ssl: SslConfig,
    /// Primary key columns used for deduplication and insert validation
    pub primary_key: Vec<String>,
    /// Per-table override of `primary_key`
    pub table_primary_keys: HashMap<String, Vec<String>>,
}

/// Upstream change feed settings consumed by this crate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcpConfig {
    pub hosts: Vec<String>,
    pub bucket: String,
    pub group_name: String,
    /// Bounded scan; rebalance suspension never applies
    pub is_finite: bool,
}

/// Top-level connector configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub cassandra: CassandraConfig,
    pub dcp: DcpConfig,
    /// Bind address of the monitoring HTTP server
    pub app_port: String,
}

impl CassandraConfig {
    fn set_defaults(&mut self) {
        let consistency = self.consistency.trim().to_ascii_uppercase();
        self.consistency = if VALID_CONSISTENCIES.contains(&consistency.as_str()) {
            consistency
        } else {
            "QUORUM".to_string()
        };

        if self.batch_type.is_empty() {
            self.batch_type = "logged".to_string();
        }
        if self.max_batch_size == 0 {
            self.max_batch_size = 65536;
        }
        if self.worker_count == 0 {
            self.worker_count = 1;
        }
        if self.batch_size_limit == 0 {
            self.batch_size_limit = 1000;
        }
        if self.batch_byte_size_limit == 0 {
            self.batch_byte_size_limit = 10 * 1024 * 1024;
        }
        if self.batch_ticker_duration_ms == 0 {
            self.batch_ticker_duration_ms = 10_000;
        }
        if self.num_conns == 0 {
            self.num_conns = 2;
        }
        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = 5_000;
        }
        if self.keep_alive_ms == 0 {
            self.keep_alive_ms = 30_000;
        }
        if self.max_prepared_stmts == 0 {
            self.max_prepared_stmts = 1000;
        }
        if self.page_size == 0 {
            self.page_size = 5000;
        }
        if self.retry_policy.num_retries == 0 {
            self.retry_policy.num_retries = 3;
        }
        if self.retry_policy.min_retry_delay_ms == 0 {
            self.retry_policy.min_retry_delay_ms = 100;
        }
        if self.retry_policy.max_retry_delay_ms == 0 {
            self.retry_policy.max_retry_delay_ms = 1000;
        }
        if self.primary_key.is_empty() {
            self.primary_key = vec!["id".to_string()];
        }
    }

    pub fn batch_kind(&self) -> BatchKind {
        BatchKind::parse(&self.batch_type)
    }

    pub fn batch_ticker_duration(&self) -> Duration {
        Duration::from_millis(self.batch_ticker_duration_ms.max(1))
    }

    /// Capacity of the bounded flush queue
    pub fn queue_capacity(&self) -> usize {
        self.worker_count.clamp(1, MAX_QUEUE_CAPACITY)
    }

    /// Primary key columns declared for `table`
    pub fn primary_key_fields(&self, table: &str) -> &[String] {
        self.table_primary_keys
            .get(table)
            .filter(|fields| !fields.is_empty())
            .unwrap_or(&self.primary_key)
    }
}

impl ConnectorConfig {
    /// Load from `path` (format inferred from the extension) plus environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;
        Self::finish(settings.try_deserialize()?)
    }

    /// Parse a TOML document, then apply defaults and validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;
        Self::finish(settings.try_deserialize()?)
    }

    fn finish(mut cfg: Self) -> Result<Self> {
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_defaults(&mut self) {
        self.cassandra.set_defaults();
        if self.app_port.is_empty() {
            self.app_port = "0.0.0.0:8080".to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cassandra.keyspace.trim().is_empty() {
            return Err(Error::Config("cassandra.keyspace is required".to_string()));
        }
        for mapping in &self.cassandra.collection_table_mapping {
            if mapping.table_name.is_empty() {
                return Err(Error::Config(format!(
                    "collection mapping '{}' has no table_name",
                    mapping.collection
                )));
            }
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("DCP_CASSANDRA")
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("cassandra.hosts")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let cfg = ConnectorConfig::from_toml_str(
            r#"
            [cassandra]
            keyspace = "ks"
            consistency = "local_one"
            "#,
        )
        .unwrap();

        let cassandra = &cfg.cassandra;
        assert_eq!(cassandra.consistency, "LOCAL_ONE");
        assert_eq!(cassandra.batch_kind(), BatchKind::Logged);
        assert_eq!(cassandra.max_batch_size, 65536);
        assert_eq!(cassandra.worker_count, 1);
        assert_eq!(cassandra.batch_size_limit, 1000);
        assert_eq!(cassandra.batch_byte_size_limit, 10 * 1024 * 1024);
        assert_eq!(cassandra.retry_policy.num_retries, 3);
        assert_eq!(cassandra.primary_key, vec!["id".to_string()]);
        assert_eq!(cfg.app_port, "0.0.0.0:8080");
    }

    #[test]
    fn test_invalid_consistency_falls_back_to_quorum() {
        let mut cfg = ConnectorConfig::default();
        cfg.cassandra.consistency = "SOMETIMES".to_string();
        cfg.apply_defaults();
        assert_eq!(cfg.cassandra.consistency, "QUORUM");
    }

    #[test]
    fn test_missing_keyspace_rejected() {
        let err = ConnectorConfig::from_toml_str("[cassandra]\nworker_count = 2\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_queue_capacity_is_capped() {
        let mut cassandra = CassandraConfig {
            worker_count: 32,
            ..Default::default()
        };
        assert_eq!(cassandra.queue_capacity(), MAX_QUEUE_CAPACITY);
        cassandra.worker_count = 3;
        assert_eq!(cassandra.queue_capacity(), 3);
    }

    #[test]
    fn test_table_primary_key_override() {
        let cfg = ConnectorConfig::from_toml_str(
            r#"
            [cassandra]
            keyspace = "ks"
            batch_type = "unlogged"

            [cassandra.table_primary_keys]
            events = ["tenant", "event_id"]

            [[cassandra.collection_table_mapping]]
            collection = "orders"
            table_name = "orders_by_id"
            field_mappings = { total = "amount.value" }
            "#,
        )
        .unwrap();

        let cassandra = &cfg.cassandra;
        assert_eq!(cassandra.batch_kind(), BatchKind::Unlogged);
        assert_eq!(cassandra.primary_key_fields("events"), ["tenant", "event_id"]);
        assert_eq!(cassandra.primary_key_fields("other"), ["id"]);
        assert_eq!(cassandra.collection_table_mapping.len(), 1);
        assert_eq!(
            cassandra.collection_table_mapping[0].field_mappings["total"],
            "amount.value"
        );
    }

    #[test]
    fn test_effective_config_renders() {
        let cfg = ConnectorConfig::from_toml_str("[cassandra]\nkeyspace = \"ks\"\n").unwrap();
        let rendered = cfg.to_toml().unwrap();
        assert!(rendered.contains("keyspace = \"ks\""));
    }
}
