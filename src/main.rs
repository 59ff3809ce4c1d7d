//! Faxline gateway hook.
//!
//! Invoked by the telephony gateway for every finished call, and by
//! operators to submit, dial, cancel and inspect transmissions. Each run
//! applies one lifecycle operation, drains the resulting deliveries and
//! prints a JSON report on stdout. Logs go to stderr.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faxline_core::{Clock, RealClock, Storage, TransmissionId};
use faxline_delivery::{
    DeliveryDispatcher, DeliveryEngine, PostgresDeliveryStorage, SuppressionTracker, WebhookClient,
};
use faxline_lifecycle::{
    CallDialer, CostCalculator, GatewayPool, LifecycleManager, PostgresLifecycleStorage,
};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;
mod esl;
mod hook;
mod spool;

use crate::{
    config::Config,
    esl::EslConnector,
    hook::{ChannelVars, Hook, HookReport},
    spool::SpoolSink,
};

#[derive(Debug, Parser)]
#[command(name = "faxline", version, about = "Fax transmission lifecycle hook")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database schema.
    Migrate,
    /// Apply an outbound completion from the gateway's channel variables.
    TxResult,
    /// Record a received fax from the gateway's channel variables.
    Rx,
    /// Submit a document and place the call.
    Send {
        /// Sender number, also used as the gateway name.
        #[arg(long)]
        from: String,
        /// Recipient number.
        #[arg(long)]
        to: String,
        /// Document to transmit.
        #[arg(long)]
        file: PathBuf,
    },
    /// Place the call for a queued transmission.
    Dial {
        /// Transmission id.
        id: TransmissionId,
    },
    /// Cancel a transmission.
    Cancel {
        /// Transmission id.
        id: TransmissionId,
    },
    /// Print a transmission and its audit log.
    Show {
        /// Transmission id.
        id: TransmissionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(db_pool.clone()));

    let result = tokio::select! {
        result = run(cli.command, &config, storage) => result,
        () = shutdown_signal() => Err(anyhow::anyhow!("interrupted")),
    };

    db_pool.close().await;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "command failed");
    }
    result
}

async fn run(command: Command, config: &Config, storage: Arc<Storage>) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(RealClock);
    let manager = Arc::new(LifecycleManager::new(
        Arc::new(PostgresLifecycleStorage::new(storage.clone())),
        clock.clone(),
        CostCalculator::new(config.to_cost_config()),
        config.to_retry_policy(),
        config.to_lifecycle_config(),
    ));

    match command {
        Command::Migrate => {
            storage.migrate().await.context("migration failed")?;
            return Ok(());
        },
        Command::Show { id } => {
            #[derive(Serialize)]
            struct Shown<T, A> {
                transmission: T,
                audit_log: A,
            }
            let shown = Shown {
                transmission: manager.get(id).await?,
                audit_log: manager.audit_log(id).await?,
            };
            println!("{}", serde_json::to_string_pretty(&shown)?);
            return Ok(());
        },
        _ => {},
    }

    let dispatcher = DeliveryDispatcher::new(
        Arc::new(PostgresDeliveryStorage::new(storage)),
        WebhookClient::new(config.to_client_config())?,
        SuppressionTracker::new(config.to_suppression_policy()),
        clock,
    )
    .with_notification_sink(Arc::new(SpoolSink::new(&config.notification_spool_dir)));
    let mut engine = DeliveryEngine::new(Arc::new(dispatcher), config.to_delivery_config());
    engine.start();

    let hook = Hook::new(manager.clone(), engine.sender());
    let report = execute(&hook, command, config, &manager).await;

    let stats = engine.stats().await;
    let drained = engine.shutdown().await;
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        suppressed = stats.suppressed,
        "deliveries drained"
    );

    let report = report?;
    println!("{}", serde_json::to_string(&report)?);
    drained.context("delivery engine did not shut down cleanly")
}

async fn execute(
    hook: &Hook<PostgresLifecycleStorage>,
    command: Command,
    config: &Config,
    manager: &Arc<LifecycleManager<PostgresLifecycleStorage>>,
) -> Result<HookReport> {
    let channel_vars = || std::env::vars().collect::<ChannelVars>();

    match command {
        Command::TxResult => hook.tx_result(&channel_vars()).await,
        Command::Rx => hook.rx(&channel_vars()).await,
        Command::Cancel { id } => hook.cancel(id).await,
        Command::Send { from, to, file } => {
            let id = hook.submit(&from, &to, &file).await?;
            info!(transmission_id = %id, "transmission submitted");
            dial(hook, config, manager, id).await
        },
        Command::Dial { id } => dial(hook, config, manager, id).await,
        Command::Migrate | Command::Show { .. } => {
            anyhow::bail!("command does not produce a hook report")
        },
    }
}

async fn dial(
    hook: &Hook<PostgresLifecycleStorage>,
    config: &Config,
    manager: &Arc<LifecycleManager<PostgresLifecycleStorage>>,
    id: TransmissionId,
) -> Result<HookReport> {
    let pool = Arc::new(GatewayPool::new(
        EslConnector::new(config.to_esl_config()),
        config.gateway_pool_size,
        Duration::from_secs(config.gateway_acquire_timeout_seconds),
    ));
    let dialer = CallDialer::new(manager.clone(), pool.clone(), config.gateway_use_ecm);

    let report = hook.dial(&dialer, id).await;
    pool.close();
    report
}

/// Initializes tracing on stderr with environment-based filtering.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,faxline=debug"))
        .context("invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 3;
    const RETRY_DELAY: Duration = Duration::from_secs(1);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Resolves on CTRL+C or SIGTERM. A handler that cannot be installed never
/// resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
