//! Thin executable: collect argv into `dmr_config::RawArgs` for the `run`
//! path, or dispatch straight to a maintenance subcommand. Exit codes per
//! spec.md §6: 0 normal shutdown, 1 command-line validation error, 2
//! runtime fatal.

mod version;

use clap::{Parser, Subcommand};
use dmr_config::{Environment, ParsedArgs, RawArgs};
use std::collections::HashMap;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "dmr", about = "Data mart replicator", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    maintenance: Option<Maintenance>,

    #[arg(long)]
    help: bool,
    #[arg(long)]
    version: bool,
    #[arg(long)]
    ignore_environment: bool,
    #[arg(long)]
    core_instance_name: Option<String>,
    #[arg(long)]
    core_settings: Option<String>,
    #[arg(long)]
    core_config_id: Option<i64>,
    #[arg(long)]
    core_log_level: Option<String>,
    #[arg(long)]
    core_concurrency: Option<u32>,
    #[arg(long)]
    refresh_config_seconds: Option<u64>,
    #[arg(long)]
    processing_rate: Option<String>,
    #[arg(long)]
    sqs_info_uri: Option<String>,
    #[arg(long)]
    rabbit_info_uri: Option<String>,
    #[arg(long)]
    rabbit_info_queue: Option<String>,
    #[arg(long)]
    database_info_queue: bool,
    #[arg(long)]
    database_uri: Option<String>,
}

/// Maintenance operations that touch the data mart without starting the
/// daemon (SPEC_FULL.md §2 supplemented features). Each still needs
/// `--core-settings`/`--database-uri` to find the mart.
#[derive(Subcommand)]
enum Maintenance {
    /// Idempotently verify or (re)create the schema (spec.md §3 component B).
    Schema {
        #[command(subcommand)]
        cmd: SchemaCmd,
    },
    /// Reap advisory locks whose holder has not renewed them in time.
    Locks {
        #[command(subcommand)]
        cmd: LocksCmd,
    },
    /// Print row counts for the mart's core tables and the queue's status
    /// breakdown.
    Stats,
}

#[derive(Subcommand)]
enum SchemaCmd {
    /// Create any missing tables/indexes/triggers; a no-op if already current.
    Verify,
    /// Drop and recreate every table. Refuses unless `--yes` is given and the
    /// mart currently has no entities.
    Recreate {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum LocksCmd {
    /// Release locks older than `--lease-seconds` (default 300).
    Reap {
        #[arg(long, default_value_t = 300)]
        lease_seconds: u64,
    },
}

impl From<&Cli> for RawArgs {
    fn from(cli: &Cli) -> Self {
        RawArgs {
            help: cli.help,
            version: cli.version,
            ignore_environment: cli.ignore_environment,
            core_instance_name: cli.core_instance_name.clone(),
            core_settings: cli.core_settings.clone(),
            core_config_id: cli.core_config_id,
            core_log_level: cli.core_log_level.clone(),
            core_concurrency: cli.core_concurrency,
            refresh_config_seconds: cli.refresh_config_seconds,
            processing_rate: cli.processing_rate.clone(),
            sqs_info_uri: cli.sqs_info_uri.clone(),
            rabbit_info_uri: cli.rabbit_info_uri.clone(),
            rabbit_info_queue: cli.rabbit_info_queue.clone(),
            database_info_queue: cli.database_info_queue,
            database_uri: cli.database_uri.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();
    let raw: RawArgs = (&cli).into();
    let env: Environment = std::env::vars().collect::<HashMap<_, _>>();

    let parsed = match dmr_config::options::parse(raw, &env) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("dmr: {e}");
            return ExitCode::from(1);
        }
    };

    match parsed {
        ParsedArgs::Help => {
            print_usage();
            ExitCode::SUCCESS
        }
        ParsedArgs::Version => {
            println!("{}", version::current());
            ExitCode::SUCCESS
        }
        ParsedArgs::Run(options) => {
            let result = match cli.maintenance {
                Some(cmd) => run_maintenance(cmd, options).await,
                None => run_daemon(options).await,
            };
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "fatal error");
                    eprintln!("dmr: fatal: {e:#}");
                    ExitCode::from(2)
                }
            }
        }
    }
}

fn print_usage() {
    println!("usage: dmr [--core-settings <json-or-path>] [--database-uri <uri>] <message-source-flag> [options]");
    println!("       dmr schema verify|recreate [--yes]");
    println!("       dmr locks reap [--lease-seconds <n>]");
    println!("       dmr stats");
    println!("see spec.md section 6 for the full flag list");
}

async fn connect(options: &dmr_config::Options) -> anyhow::Result<dmr_db::DbPool> {
    let resolved_uri = options.database_uri.clone().resolve(Some(&options.core_settings))?;
    dmr_db::DbPool::connect(&resolved_uri).await
}

async fn run_daemon(options: dmr_config::Options) -> anyhow::Result<()> {
    dmr_daemon::init_tracing(options.core_log_level);
    let pool = connect(&options).await?;
    dmr_db::ensure_schema(&pool, false).await?;
    dmr_daemon::run(options, pool, shutdown_signal()).await
}

async fn run_maintenance(cmd: Maintenance, options: dmr_config::Options) -> anyhow::Result<()> {
    dmr_daemon::init_tracing(options.core_log_level);
    let pool = connect(&options).await?;

    // `locks reap` and `stats` read tables this command doesn't itself create;
    // `schema recreate` needs them present to count existing entities.
    if !matches!(cmd, Maintenance::Schema { cmd: SchemaCmd::Recreate { .. } }) {
        dmr_db::ensure_schema(&pool, false).await?;
    }

    match cmd {
        Maintenance::Schema { cmd: SchemaCmd::Verify } => {
            println!("schema_ok=true");
        }
        Maintenance::Schema { cmd: SchemaCmd::Recreate { yes } } => {
            if !yes {
                anyhow::bail!("schema recreate is destructive; pass --yes to confirm");
            }
            let entity_count = dmr_db::mart::count_entities(&pool).await.unwrap_or(0);
            if entity_count > 0 {
                anyhow::bail!("refusing to recreate schema: mart has {entity_count} entities");
            }
            dmr_db::ensure_schema(&pool, true).await?;
            println!("schema_recreated=true");
        }
        Maintenance::Locks { cmd: LocksCmd::Reap { lease_seconds } } => {
            let n = dmr_locks::reap_stale_locks(&pool, std::time::Duration::from_secs(lease_seconds)).await?;
            println!("locks_reaped={n}");
        }
        Maintenance::Stats => {
            let ready = dmr_db::queue::count_by_status(&pool, dmr_db::queue::STATUS_READY).await?;
            let leased = dmr_db::queue::count_by_status(&pool, dmr_db::queue::STATUS_LEASED).await?;
            let dead_lettered = dmr_db::queue::count_by_status(&pool, dmr_db::queue::STATUS_DEAD_LETTER).await?;
            let entities = dmr_db::mart::count_entities(&pool).await?;
            println!("entities={entities}");
            println!("queue.ready={ready}");
            println!("queue.leased={leased}");
            println!("queue.dead_lettered={dead_lettered}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
