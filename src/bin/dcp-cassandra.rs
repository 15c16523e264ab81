//! DCP Cassandra connector binary
//!
//! # Examples
//!
//! ```bash
//! # Replay recorded change events through a dry-run session
//! dcp-cassandra replay --config config.toml --input events.jsonl
//!
//! # Print the effective configuration
//! dcp-cassandra config --config config.toml
//! ```
//!
//! Each line of the replay input is one JSON change event:
//!
//! ```json
//! {"kind": "mutation", "key": "user::1", "collection": "users", "value": {"name": "x"}}
//! {"kind": "deletion", "key": "user::1", "collection": "users"}
//! ```

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use dcp_cassandra::server::{start_server, MonitorState};
use dcp_cassandra::storage::TracingSession;
use dcp_cassandra::{
    Ack, ChangeEvent, CheckpointCommit, ConnectorBuilder, ConnectorConfig, EventKind,
    ListenerContext,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Couchbase DCP to Cassandra connector
#[derive(Parser, Debug)]
#[command(name = "dcp-cassandra")]
#[command(version = dcp_cassandra::VERSION)]
#[command(about = "Streams Couchbase DCP changes into Cassandra", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "DCP_CASSANDRA_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Emit JSON log lines on stdout
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed recorded change events through the connector
    Replay(ReplayArgs),

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file
        #[arg(short, long, env = "DCP_CASSANDRA_CONFIG")]
        config: PathBuf,
    },

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Configuration file
    #[arg(short, long, env = "DCP_CASSANDRA_CONFIG")]
    config: PathBuf,

    /// JSON lines file of change events
    #[arg(short, long)]
    input: PathBuf,
}

/// One line of replay input
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    #[serde(default = "default_kind")]
    kind: EventKind,
    key: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    collection: String,
    #[serde(default)]
    event_time: Option<DateTime<Utc>>,
}

fn default_kind() -> EventKind {
    EventKind::Mutation
}

impl ReplayRecord {
    fn into_event(self) -> ChangeEvent {
        let mut event = match self.kind {
            EventKind::Mutation => {
                let payload = match self.value {
                    Some(serde_json::Value::String(raw)) => raw,
                    Some(value) => value.to_string(),
                    None => String::new(),
                };
                ChangeEvent::mutation(self.key, payload, self.collection)
            }
            EventKind::Deletion => ChangeEvent::deletion(self.key, self.collection),
            EventKind::Expiration => ChangeEvent::expiration(self.key, self.collection),
        };
        if let Some(event_time) = self.event_time {
            event = event.with_event_time(event_time);
        }
        event
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    match cli.command {
        Commands::Replay(args) => replay_command(args).await,
        Commands::Config { config } => config_command(config),
        Commands::Version => {
            println!("dcp-cassandra {}", dcp_cassandra::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "dcp-cassandra.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let stdout = if cli.json_logs {
        fmt::layer().json().with_writer(std::io::stdout).boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(!cli.no_color)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn config_command(path: PathBuf) -> anyhow::Result<()> {
    let config = ConnectorConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Replay command - run the full pipeline against a dry-run session
async fn replay_command(args: ReplayArgs) -> anyhow::Result<()> {
    info!(version = %dcp_cassandra::VERSION, "dcp-cassandra replay starting");

    let config = ConnectorConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let addr = config.app_port.clone();

    let commits = Arc::new(AtomicU64::new(0));
    let checkpoint: CheckpointCommit = {
        let commits = commits.clone();
        Arc::new(move || {
            let n = commits.fetch_add(1, Ordering::SeqCst) + 1;
            info!(commit = n, "checkpoint committed");
        })
    };

    let connector = Arc::new(
        ConnectorBuilder::new(config)
            .session(Arc::new(TracingSession::new()))
            .checkpoint(checkpoint)
            .build()?,
    );

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let state = MonitorState {
        bulk: connector.bulk().clone(),
        registry: connector.metrics_registry().clone(),
    };
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_stopped.await;
        };
        if let Err(e) = start_server(&addr, state, shutdown).await {
            error!(error = %e, "monitoring server failed");
        }
    });

    let runner = {
        let connector = connector.clone();
        tokio::spawn(async move { connector.start().await })
    };

    let fed = feed(&connector, &args.input).await;
    connector.close();

    let finished = runner.await.context("connector task panicked")?;
    let _ = stop_server.send(());
    let _ = server.await;

    let events = fed?;
    finished?;
    info!(
        events,
        checkpoints = commits.load(Ordering::SeqCst),
        "replay finished"
    );
    Ok(())
}

async fn feed(connector: &dcp_cassandra::Connector, input: &Path) -> anyhow::Result<u64> {
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut events = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed event");
                continue;
            }
        };

        let key = record.key.clone();
        let ack = Ack::new(move || tracing::trace!(key = %key, "event acked"));
        match connector
            .listener(ListenerContext::change(record.into_event(), ack))
            .await
        {
            Ok(()) => events += 1,
            Err(e) if !e.is_fatal() => {
                warn!(line = line_no, error = %e, "skipping rejected event");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("event on line {}", line_no));
            }
        }
    }

    Ok(events)
}
