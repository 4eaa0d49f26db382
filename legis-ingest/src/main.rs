//! legis-ingest - Legislative data ingestion
//!
//! Fetches Congress.gov and Senate LDA entities into the record store and
//! migrates them into the relational target. Every command prints its
//! summary as JSON on stdout; logs go to stderr.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use legis_common::config::{
    load_toml_config, resolve_config_path, resolve_root_folder, RootLayout, TomlConfig, ROOT_ENV_VAR,
};
use legis_ingest::config::CredentialOverrides;
use legis_ingest::models::{Collection, EntityType, MigrationState};
use legis_ingest::services::{self, Enumeration, FetchRequest};
use legis_ingest::IngestContext;

/// Command-line arguments for legis-ingest
#[derive(Parser, Debug)]
#[command(name = "legis-ingest")]
#[command(about = "Fetch and migrate legislative records")]
#[command(version)]
struct Cli {
    /// Config file (default: LEGIS_CONFIG, then <config_dir>/legis/legis.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root folder holding the record store and target database
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log level or filter directive (overrides RUST_LOG and the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct CredentialArgs {
    /// Congress.gov API key
    #[arg(long, global = true)]
    congress_api_key: Option<String>,

    /// Senate LDA API token
    #[arg(long, global = true)]
    lda_api_key: Option<String>,

    #[arg(long, global = true)]
    lda_username: Option<String>,

    #[arg(long, global = true)]
    lda_password: Option<String>,
}

impl From<CredentialArgs> for CredentialOverrides {
    fn from(args: CredentialArgs) -> Self {
        Self {
            congress_api_key: args.congress_api_key,
            lda_api_key: args.lda_api_key,
            lda_username: args.lda_username,
            lda_password: args.lda_password,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one collection of one congress into the record store
    Fetch {
        /// bill, vote, member, committee or lobbyingFiling
        #[arg(long)]
        collection: Collection,

        #[arg(long)]
        congress: u32,

        /// Vote session (repeatable; default both)
        #[arg(long)]
        session: Vec<u32>,

        /// Bill type (repeatable; default all)
        #[arg(long)]
        bill_type: Vec<String>,

        /// Worker count (default from config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Explicit unit key instead of enumeration (repeatable)
        #[arg(long)]
        key: Vec<String>,

        /// Number range instead of asking upstream for the count, e.g. 1..250
        #[arg(long, value_parser = parse_range)]
        range: Option<RangeInclusive<u32>>,

        /// Fetch units even if already recorded, creating new versions
        #[arg(long)]
        refetch: bool,
    },

    /// Migrate records into the target database
    Migrate {
        #[arg(long)]
        congress: u32,

        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        entity: Option<EntityType>,

        /// Every entity type, in dependency order
        #[arg(long)]
        all: bool,

        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Compare a migrated entity type against its records
    Validate {
        #[arg(long)]
        congress: u32,

        #[arg(long)]
        entity: EntityType,
    },

    /// Record counts and migration progress
    Status {
        #[arg(long)]
        congress: u32,
    },
}

/// Parse `A..B` or `A..=B` (both inclusive)
fn parse_range(s: &str) -> Result<RangeInclusive<u32>, String> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| format!("expected A..B, got {:?}", s))?;
    let end = end.strip_prefix('=').unwrap_or(end);

    let start: u32 = start.trim().parse().map_err(|e| format!("range start: {}", e))?;
    let end: u32 = end.trim().parse().map_err(|e| format!("range end: {}", e))?;
    if start == 0 || start > end {
        return Err(format!("range must satisfy 1 <= A <= B, got {}..{}", start, end));
    }
    Ok(start..=end)
}

fn init_tracing(cli_level: Option<&str>, config: &TomlConfig) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Cancel `token` on Ctrl+C; a second Ctrl+C is left to the default handler
fn spawn_cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, finishing in-flight work and stopping");
                token.cancel();
            }
            Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
        }
    });
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = match &config_path {
        Some(path) => load_toml_config(path).context("Failed to load configuration")?,
        None => TomlConfig::default(),
    };

    init_tracing(cli.log_level.as_deref(), &config);

    info!("Starting legis-ingest {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Config: {}", path.display());
    }

    let root = resolve_root_folder(cli.root.as_deref(), ROOT_ENV_VAR, &config);
    info!("Root folder: {}", root.display());

    let layout = RootLayout::new(root);
    let ctx = IngestContext::open(&layout, config)
        .await
        .context("Failed to open record store and database")?;

    let cancel = CancellationToken::new();
    spawn_cancel_on_ctrl_c(cancel.clone());

    let overrides: CredentialOverrides = cli.credentials.into();

    match cli.command {
        Command::Fetch {
            collection,
            congress,
            session,
            bill_type,
            concurrency,
            key,
            range,
            refetch,
        } => {
            let orchestrator = ctx.fetch_orchestrator(collection.source(), &overrides)?;

            let mut request = FetchRequest::new(
                collection,
                congress,
                concurrency.unwrap_or(ctx.config.fetch.concurrency),
            );
            request.keys = key;
            request.refetch = refetch;
            request.enumeration = Enumeration {
                sessions: session,
                bill_types: bill_type,
                range,
            };

            let summary = orchestrator.run_request(&request, &cancel).await?;
            print_json(&summary)?;
        }

        Command::Migrate {
            congress,
            entity,
            all,
            batch_size,
        } => {
            let mut pipeline = ctx.migration_pipeline();
            if let Some(batch_size) = batch_size {
                pipeline = pipeline.with_batch_size(batch_size);
            }

            if all {
                let outcomes = pipeline.migrate_all(congress, &cancel).await;
                print_json(&outcomes)?;
                if outcomes.iter().any(|o| o.error.is_some()) {
                    return Ok(ExitCode::FAILURE);
                }
            } else {
                let Some(entity_type) = entity else {
                    bail!("--entity or --all is required");
                };
                let summary = pipeline.migrate(entity_type, congress, &cancel).await?;
                print_json(&summary)?;
                if summary.state == MigrationState::PartiallyFailed {
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        Command::Validate { congress, entity } => {
            let report = services::validate(&ctx.db, &ctx.store, entity, congress).await?;
            print_json(&report)?;
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Status { congress } => {
            let report = services::status(&ctx.db, &ctx.store, congress).await?;
            print_json(&report)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("1..250").unwrap(), 1..=250);
        assert_eq!(parse_range("5..=5").unwrap(), 5..=5);
        assert!(parse_range("0..3").is_err());
        assert!(parse_range("9..3").is_err());
        assert!(parse_range("12").is_err());
    }

    #[test]
    fn test_cli_parses_migrate_all() {
        let cli = Cli::try_parse_from(["legis-ingest", "migrate", "--congress", "118", "--all"]).unwrap();
        assert!(matches!(cli.command, Command::Migrate { all: true, entity: None, .. }));
    }

    #[test]
    fn test_cli_rejects_entity_with_all() {
        let result = Cli::try_parse_from([
            "legis-ingest", "migrate", "--congress", "118", "--all", "--entity", "bill",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parses_fetch_keys() {
        let cli = Cli::try_parse_from([
            "legis-ingest", "fetch", "--collection", "bill", "--congress", "118",
            "--key", "118/hr/1", "--key", "118/hr/2", "--range", "1..10",
        ])
        .unwrap();
        match cli.command {
            Command::Fetch { collection, key, range, .. } => {
                assert_eq!(collection, Collection::Bill);
                assert_eq!(key.len(), 2);
                assert_eq!(range, Some(1..=10));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
