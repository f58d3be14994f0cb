//! mir CLI — thin operator wrappers over the sync engine.
//!
//! Every command is a few lines of wiring around library calls: connect,
//! build the engine from layered config + env secrets, invoke, print
//! `key=value` results.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use mir_engine::{EngineConfig, ParallelOpts, SyncEngine};
use mir_provider::{RestAnalyticsClient, RestRemoteClient};

#[derive(Parser)]
#[command(name = "mir")]
#[command(about = "mirrorsync CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Backfill and run inspection
    Sync {
        #[command(subcommand)]
        cmd: SyncCmd,
    },

    /// Apply a webhook delivery from disk (testing / replay)
    Webhook {
        #[command(subcommand)]
        cmd: WebhookCmd,
    },

    /// Account-level maintenance
    Account {
        #[command(subcommand)]
        cmd: AccountCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum SyncCmd {
    /// Backfill one object (serial) or all supported objects (parallel).
    Backfill {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Single object to backfill; omit for all supported objects
        #[arg(long)]
        object: Option<String>,

        /// Worker count for the parallel path
        #[arg(long)]
        parallel: Option<usize>,

        /// Keep going when one object fails
        #[arg(long)]
        continue_on_error: bool,

        /// Skip objects this credential cannot list
        #[arg(long)]
        skip_inaccessible: bool,

        /// Stop after this many seconds, releasing claims cleanly
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Show recent runs with per-object counts.
    Status {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum WebhookCmd {
    Apply {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// File holding the raw delivery body
        #[arg(long)]
        file: String,

        /// Value of the signature header
        #[arg(long)]
        signature: String,
    },
}

#[derive(Subcommand)]
enum AccountCmd {
    /// Delete every synced row, run and the account itself. No undo.
    Purge {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Required confirmation flag
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = mir_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = mir_db::status(&pool).await?;
                    println!("db_ok={} has_sync_tables={}", s.ok, s.has_sync_tables);
                }
                DbCmd::Migrate => {
                    mir_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Sync { cmd } => match cmd {
            SyncCmd::Backfill {
                config_paths,
                object,
                parallel,
                continue_on_error,
                skip_inaccessible,
                timeout_secs,
            } => {
                let engine = build_engine(&config_paths).await?;

                match object {
                    Some(object) => {
                        let processed = engine.process_until_done(&object, None).await?;
                        println!("object={object} processed={processed}");
                    }
                    None => {
                        let totals = engine
                            .process_until_done_parallel(ParallelOpts {
                                objects: None,
                                max_parallel: parallel,
                                continue_on_error,
                                skip_inaccessible,
                                deadline: timeout_secs.map(Duration::from_secs),
                            })
                            .await?;
                        println!(
                            "run_started_at={} processed={}",
                            totals.run_started_at, totals.processed
                        );
                        for (object, error) in totals.failed_objects {
                            println!("failed_object={object} error={error:?}");
                        }
                    }
                }
            }

            SyncCmd::Status { config_paths, limit } => {
                let engine = build_engine(&config_paths).await?;
                let runs =
                    mir_db::list_run_summaries(engine.pool(), engine.account_id(), limit).await?;
                for r in runs {
                    println!(
                        "run={} status={} pending={} running={} complete={} error={} closed={}",
                        r.started_at,
                        r.status,
                        r.pending_count,
                        r.running_count,
                        r.complete_count,
                        r.error_count,
                        r.closed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    );
                }
            }
        },

        Commands::Webhook { cmd } => match cmd {
            WebhookCmd::Apply {
                config_paths,
                file,
                signature,
            } => {
                let engine = build_engine(&config_paths).await?;
                let body = std::fs::read_to_string(&file)
                    .with_context(|| format!("read webhook body: {file}"))?;
                let outcome = engine.process_webhook(&body, &signature).await?;
                println!("outcome={outcome:?}");
            }
        },

        Commands::Account { cmd } => match cmd {
            AccountCmd::Purge { config_paths, yes } => {
                if !yes {
                    bail!("refusing to purge without --yes");
                }
                let engine = build_engine(&config_paths).await?;
                let tables = engine.registry().tables();
                let removed = mir_db::dangerously_delete_synced_account_data(
                    engine.pool(),
                    engine.account_id(),
                    &tables,
                )
                .await?;
                println!("account={} rows_removed={removed}", engine.account_id());
            }
        },
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Wire pool + provider adapters + registry into one engine from layered
/// config and env secrets, bootstrapping the account row.
async fn build_engine(config_paths: &[String]) -> Result<Arc<SyncEngine>> {
    let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = mir_config::load_layered_yaml(&path_refs)?;
    let settings = loaded.settings()?;
    let secrets = mir_config::resolve_secrets(&loaded.config_json)?;

    let url = std::env::var(mir_db::ENV_DB_URL)
        .with_context(|| format!("missing env var {}", mir_db::ENV_DB_URL))?;
    let pool = mir_db::connect(&url, settings.pool_size).await?;

    let key_hash = mir_config::api_key_hash(&secrets.api_key);
    mir_db::upsert_account(&pool, &settings.account_id, None, Some(&key_hash)).await?;

    let client = Arc::new(RestRemoteClient::new(
        secrets.api_key.clone(),
        settings.base_url.clone(),
    ));
    let analytics = Arc::new(RestAnalyticsClient::new(
        secrets
            .analytics_api_key
            .clone()
            .unwrap_or_else(|| secrets.api_key.clone()),
        settings.analytics_base_url.clone(),
    ));

    let config = EngineConfig {
        page_limit: settings.page_limit,
        max_parallel: settings.max_parallel,
        backfill_related_entities: settings.backfill_related_entities,
        stale_run_max_age_minutes: settings.stale_run_max_age_minutes,
        stuck_running_threshold_minutes: settings.stuck_running_threshold_minutes,
        webhook_tolerance_secs: settings.webhook_tolerance_secs,
        ..EngineConfig::default()
    };

    Ok(Arc::new(SyncEngine::new(
        pool,
        client,
        Some(analytics),
        mir_registry::standard(),
        settings.account_id,
        secrets.webhook_secret,
        config,
    )))
}
