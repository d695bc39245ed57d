//! `stateful`: administer the stores behind stateful functions.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, error};

use stateful_fn::{
    migrate, BackendConfig, BackendKind, ItemOutcome, MigrationReport, MigrationStatus,
    StateBackend,
};

#[derive(Parser)]
#[command(
    name = "stateful",
    about = "Inspect, check and migrate durable function state",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty store (schema for SQLite, connectivity check for Redis)
    Init {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// List every stored identity with its codec, version and size
    List {
        #[command(flatten)]
        store: StoreArgs,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Check that a store is reachable and intact; exits 1 if not
    Healthcheck {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Copy all records from one store to another
    Migrate {
        /// Source backend kind (embedded, networked)
        #[arg(long = "from")]
        from: BackendKind,
        /// Destination backend kind
        #[arg(long = "to")]
        to: BackendKind,
        /// Source SQLite path or Redis URL
        #[arg(long)]
        from_path: String,
        /// Destination SQLite path or Redis URL
        #[arg(long)]
        to_path: String,
        #[arg(long)]
        from_namespace: Option<String>,
        #[arg(long)]
        to_namespace: Option<String>,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

#[derive(Args)]
struct StoreArgs {
    /// Backend kind (embedded, networked)
    #[arg(short, long, env = "STATEFUL_BACKEND", default_value = "embedded")]
    backend: BackendKind,
    /// SQLite database path or Redis URL
    #[arg(short, long, env = "STATEFUL_CONNECTION")]
    path: String,
    /// Namespace within the store
    #[arg(short, long, env = "STATEFUL_NAMESPACE")]
    namespace: Option<String>,
}

impl StoreArgs {
    fn config(&self) -> BackendConfig {
        backend_config(self.backend, &self.path, self.namespace.as_deref())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn backend_config(kind: BackendKind, path: &str, namespace: Option<&str>) -> BackendConfig {
    let config = BackendConfig::new(kind, path);
    match namespace {
        Some(ns) => config.with_namespace(ns),
        None => config,
    }
}

/// Opening a missing SQLite file would create it, so read-only commands
/// check for it first.
fn ensure_exists(config: &BackendConfig) -> anyhow::Result<()> {
    if config.kind == BackendKind::Embedded && !std::path::Path::new(&config.connection).exists() {
        bail!("{} does not exist", config.connection);
    }
    Ok(())
}

async fn open(config: &BackendConfig) -> anyhow::Result<Arc<dyn StateBackend>> {
    if config.kind == BackendKind::Memory {
        bail!("the memory backend only lives inside one process");
    }
    config
        .connect()
        .await
        .with_context(|| format!("cannot open {config}"))
}

#[derive(Serialize)]
struct ListRow {
    identity: String,
    codec: String,
    version: u64,
    bytes: usize,
    updated_at_ms: u128,
}

async fn init(store: StoreArgs) -> anyhow::Result<ExitCode> {
    let config = store.config();
    let backend = open(&config).await?;
    backend.healthcheck().await?;
    println!("initialized {config}");
    Ok(ExitCode::SUCCESS)
}

async fn list(store: StoreArgs, format: Format) -> anyhow::Result<ExitCode> {
    let config = store.config();
    ensure_exists(&config)?;
    let backend = open(&config).await?;

    let mut rows = Vec::new();
    for id in backend.list().await? {
        let Some(record) = backend.get(&id).await? else {
            debug!(identity = %id, "record vanished while listing");
            continue;
        };
        rows.push(ListRow {
            identity: id.to_string(),
            codec: record.codec,
            version: record.version,
            bytes: record.payload.len(),
            updated_at_ms: record
                .updated_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
        });
    }

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            for row in &rows {
                println!(
                    "{}\t{}\tv{}\t{} bytes\t{}",
                    row.identity, row.codec, row.version, row.bytes, row.updated_at_ms
                );
            }
            println!("{} record(s)", rows.len());
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn healthcheck(store: StoreArgs) -> anyhow::Result<ExitCode> {
    let config = store.config();
    if let Err(e) = ensure_exists(&config) {
        println!("unhealthy: {e}");
        return Ok(ExitCode::FAILURE);
    }

    let result = match open(&config).await {
        Ok(backend) => backend.healthcheck().await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            println!("healthy: {config}");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("unhealthy: {e:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_migration(
    from: BackendConfig,
    to: BackendConfig,
    format: Format,
) -> anyhow::Result<ExitCode> {
    let source = match ensure_exists(&from) {
        Ok(()) => open(&from).await,
        Err(e) => Err(e),
    };
    let source = match source {
        Ok(source) => source,
        Err(e) => {
            let status = MigrationStatus::SourceUnreadable(format!("{e:#}"));
            return print_report(&MigrationReport::aborted(status), format);
        }
    };
    let destination = match open(&to).await {
        Ok(destination) => destination,
        Err(e) => {
            let status = MigrationStatus::DestinationUnwritable(format!("{e:#}"));
            return print_report(&MigrationReport::aborted(status), format);
        }
    };

    let report = migrate(source.as_ref(), destination.as_ref()).await;
    print_report(&report, format)
}

fn print_report(report: &MigrationReport, format: Format) -> anyhow::Result<ExitCode> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Format::Text => {
            for item in &report.items {
                let outcome = match &item.outcome {
                    ItemOutcome::Copied { version } => format!("copied (v{version})"),
                    ItemOutcome::Unchanged => "unchanged".to_string(),
                    ItemOutcome::Skipped => "skipped (gone from source)".to_string(),
                    ItemOutcome::Failed(reason) => format!("FAILED: {reason}"),
                };
                println!("{}\t{}", item.identity, outcome);
            }
            let label = match report.status {
                MigrationStatus::Complete => "complete",
                MigrationStatus::Partial => "partial",
                MigrationStatus::SourceUnreadable(_) | MigrationStatus::DestinationUnwritable(_) => {
                    "failed"
                }
            };
            println!("{label}: {}", report.summary());
        }
    }

    Ok(match report.status {
        MigrationStatus::Complete => ExitCode::SUCCESS,
        MigrationStatus::Partial => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stateful=info,stateful_fn=info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { store } => init(store).await,
        Commands::List { store, format } => list(store, format).await,
        Commands::Healthcheck { store } => healthcheck(store).await,
        Commands::Migrate {
            from,
            to,
            from_path,
            to_path,
            from_namespace,
            to_namespace,
            format,
        } => {
            run_migration(
                backend_config(from, &from_path, from_namespace.as_deref()),
                backend_config(to, &to_path, to_namespace.as_deref()),
                format,
            )
            .await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
