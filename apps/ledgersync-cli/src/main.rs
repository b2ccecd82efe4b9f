//! # Ledgersync CLI
//!
//! Operator entry point for the reconciliation engine.
//!
//! ## Commands
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ledgersync [--config PATH] <command>                                  │
//! │                                                                         │
//! │  run                         every configured partition (run_all)      │
//! │  run   <tenant> <entity>     one partition                             │
//! │  reset <tenant> <entity>     drop the watermark: next run is full      │
//! │  runs  <tenant> <entity>     recent SyncRuns, newest first (--limit)   │
//! │                                                                         │
//! │  Ctrl-C stops in-flight cycles between batches.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ledgersync_core::{Normalizer, PartitionKey, RunStatus, SyncRun};
use ledgersync_db::Database;
use ledgersync_engine::{run_all, EngineConfig, JsonFileExtractor, Orchestrator, SyncError};

/// Replicates accounting master data into a local SQLite replica
#[derive(Debug, Parser)]
#[command(name = "ledgersync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: ledgersync.toml in the platform config directory)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Defaults to `run` over every configured partition
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run one partition, or every configured partition when none is given
    Run(RunArgs),

    /// Drop a partition's watermark so its next cycle runs in full mode
    Reset(PartitionArgs),

    /// List recent sync runs of a partition, newest first
    Runs {
        #[command(flatten)]
        partition: PartitionArgs,

        /// Number of runs to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, Default, PartialEq, Eq, Args)]
struct RunArgs {
    /// Tenant (company) name
    #[arg(requires = "entity_type")]
    tenant: Option<String>,

    /// Entity type, e.g. `ledger` or `stock_item`
    entity_type: Option<String>,
}

impl RunArgs {
    fn partition(&self) -> Option<PartitionKey> {
        match (&self.tenant, &self.entity_type) {
            (Some(tenant), Some(entity_type)) => Some(PartitionKey::new(tenant, entity_type)),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
struct PartitionArgs {
    /// Tenant (company) name
    tenant: String,

    /// Entity type, e.g. `ledger` or `stock_item`
    entity_type: String,
}

impl PartitionArgs {
    fn key(&self) -> PartitionKey {
        PartitionKey::new(&self.tenant, &self.entity_type)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `false` when any cycle did not succeed.
async fn run(cli: Cli) -> Result<bool> {
    let config = EngineConfig::load(cli.config).context("loading configuration")?;
    let db = Arc::new(
        Database::new(config.db_config())
            .await
            .with_context(|| format!("opening replica {}", config.database.path.display()))?,
    );

    let extractor = Arc::new(JsonFileExtractor::new(
        config.source.export_dir.clone(),
        Normalizer::new(config.mapping.clone()),
    ));
    let orchestrator = Arc::new(Orchestrator::new(db.clone(), extractor, &config));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        }
    });

    let command = cli.command.unwrap_or(Command::Run(RunArgs::default()));
    let all_ok = match command {
        Command::Run(args) => match args.partition() {
            Some(partition) => {
                let result = orchestrator.run_cycle_with(&partition, cancel.clone()).await;
                print_result(&partition, result)
            }
            None => {
                let partitions = config.partitions();
                if partitions.is_empty() {
                    bail!("no [[partitions]] configured");
                }

                let mut all_ok = true;
                for report in run_all(&orchestrator, &partitions, &cancel).await {
                    all_ok &= print_result(&report.partition, report.result);
                }
                all_ok
            }
        },
        Command::Reset(args) => {
            let partition = args.key();
            let removed = orchestrator.reset_watermark(&partition).await?;
            println!(
                "{partition}: {}",
                if removed { "watermark removed, next run is full" } else { "no watermark" }
            );
            true
        }
        Command::Runs { partition, limit } => {
            for run in db.runs().list(&partition.key(), limit).await? {
                println!("{}", format_run(&run));
            }
            true
        }
    };

    db.close().await;
    Ok(all_ok)
}

fn print_result(partition: &PartitionKey, result: Result<SyncRun, SyncError>) -> bool {
    match result {
        Ok(run) => {
            println!("{}", format_run(&run));
            run.status == RunStatus::Success
        }
        Err(e) => {
            println!("{partition} {e}");
            false
        }
    }
}

/// One line per run: partition, status, counts, summary.
fn format_run(run: &SyncRun) -> String {
    let c = &run.counts;
    let mut line = format!(
        "{} {} {} mode={} seen={} inserted={} updated={} deleted={} skipped={} failed={}",
        run.partition(),
        run.run_id,
        run.status,
        run.mode,
        c.seen,
        c.inserted,
        c.updated,
        c.deleted,
        c.skipped,
        c.failed,
    );
    if let Some(summary) = &run.error_summary {
        line.push_str(" error=\"");
        line.push_str(summary);
        line.push('"');
    }
    line
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ledgersync=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "ledgersync starting");
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("ledgersync").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse(&[]).unwrap().command, None);
        assert_eq!(
            parse(&["run"]).unwrap().command,
            Some(Command::Run(RunArgs::default()))
        );

        let cli = parse(&["run", "Acme Traders", "ledger"]).unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.partition(), Some(PartitionKey::new("Acme Traders", "ledger")));

        let cli = parse(&["reset", "acme", "stock_item"]).unwrap();
        let Some(Command::Reset(args)) = cli.command else {
            panic!("expected reset");
        };
        assert_eq!(args.key(), PartitionKey::new("acme", "stock_item"));
    }

    #[test]
    fn test_global_config_and_limit() {
        let cli = parse(&["runs", "acme", "ledger", "--config", "/etc/ledgersync.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/ledgersync.toml")));
        assert_eq!(
            cli.command,
            Some(Command::Runs {
                partition: PartitionArgs {
                    tenant: "acme".into(),
                    entity_type: "ledger".into(),
                },
                limit: 20,
            })
        );

        let cli = parse(&["-c", "alt.toml", "runs", "acme", "ledger", "-l", "5"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Some(Command::Runs { limit: 5, .. })));
    }

    #[test]
    fn test_parse_rejects_bad_usage() {
        assert!(parse(&["reset"]).is_err());
        assert!(parse(&["run", "acme"]).is_err());
        assert!(parse(&["sync", "acme", "ledger"]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["runs", "acme", "ledger", "--limit", "many"]).is_err());
    }

    #[test]
    fn test_format_run() {
        let mut run = SyncRun::start(
            "r1",
            &PartitionKey::new("acme", "ledger"),
            ledgersync_core::SyncMode::Full,
            chrono::Utc::now(),
        );
        run.counts.seen = 3;
        run.counts.inserted = 2;
        run.counts.failed = 1;
        run.error_summary = Some("1 record(s) failed: X: guid is required".into());

        let line = format_run(&run);
        assert!(line.starts_with("acme/ledger r1 in_progress mode=full seen=3 inserted=2"));
        assert!(line.ends_with("error=\"1 record(s) failed: X: guid is required\""));
    }
}
