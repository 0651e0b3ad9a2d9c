// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # walletd Node
//!
//! Entry point for the `walletd-node` binary. Opens the ledger store, wires
//! it to a [`LedgerEngine`] and either runs the daemon or performs a
//! one-shot maintenance command.
//!
//! - `run`     : periodic timelock unlocks plus the `/metrics` endpoint
//! - `unlock`  : one unlock pass at a given (or the current) time
//! - `validate`: compare address aggregates against their history
//! - `register`: attach addresses to a wallet
//! - `status`  : store statistics as JSON
//! - `version` : print build version information

mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tower_http::trace::TraceLayer;

use walletd_engine::alert::TracingAlertSink;
use walletd_engine::config::EngineConfig;
use walletd_engine::storage::{LedgerDb, LedgerStore};
use walletd_engine::{EngineError, LedgerEngine};

use cli::{Commands, WalletdCli};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::WalletdMetrics;

type Engine = LedgerEngine<LedgerDb, TracingAlertSink>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = WalletdCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Unlock(args) => unlock_once(args),
        Commands::Validate(args) => validate(args),
        Commands::Register(args) => register(args),
        Commands::Status(args) => status(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Opens (or creates) the ledger database under `data_dir/db`.
fn open_store(data_dir: &Path) -> Result<LedgerDb> {
    let db_path = data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;

    let db = LedgerDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");
    Ok(db)
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Starts the daemon: an unlock loop on a fixed interval and the metrics
/// server, until SIGINT or SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_json_flag(args.store.log_json));

    let config = args.engine.to_config();
    tracing::info!(
        data_dir = %args.store.data_dir.display(),
        metrics_port = args.metrics_port,
        unlock_interval_secs = args.unlock_interval_secs,
        reorg_warning_depth = config.reorg_warning_depth,
        reward_spend_min_blocks = config.reward_spend_min_blocks,
        "starting walletd-node"
    );

    let db = open_store(&args.store.data_dir)?;
    let engine: Arc<Engine> = Arc::new(LedgerEngine::new(db, TracingAlertSink, config));
    let node_metrics = Arc::new(WalletdMetrics::new());
    node_metrics.set_best_height(engine.best_height()?);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Unlock loop ---
    let period = Duration::from_secs(args.unlock_interval_secs.max(1));
    let loop_engine = Arc::clone(&engine);
    let loop_metrics = Arc::clone(&node_metrics);
    let unlock_loop = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let engine = Arc::clone(&loop_engine);
            let metrics = Arc::clone(&loop_metrics);
            let joined = tokio::task::spawn_blocking(move || unlock_pass(&engine, &metrics)).await;
            if let Err(e) = joined {
                tracing::error!(error = %e, "unlock task panicked");
            }
        }
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    unlock_loop.abort();
    engine.store().flush().context("failed to flush database")?;
    tracing::info!("walletd-node stopped");
    Ok(())
}

/// One timelock unlock pass, recorded in `metrics`.
fn unlock_pass(engine: &Engine, metrics: &WalletdMetrics) {
    let started = Instant::now();
    match engine.unlock_timelocked_utxos(unix_now()) {
        Ok(summary) => {
            metrics.record_unlock(&summary);
            if summary.utxos > 0 {
                tracing::info!(
                    utxos = summary.utxos,
                    addresses = summary.addresses,
                    wallets = summary.wallets,
                    "timelocks released"
                );
            }
        }
        Err(e) => {
            metrics.unlock_failures_total.inc();
            tracing::error!(error = %e, "unlock pass failed");
        }
    }
    metrics
        .unlock_latency_seconds
        .observe(started.elapsed().as_secs_f64());

    match engine.best_height() {
        Ok(height) => metrics.set_best_height(height),
        Err(e) => tracing::warn!(error = %e, "failed to read best height"),
    }
}

fn unlock_once(args: cli::UnlockArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_json_flag(args.store.log_json));

    let db = open_store(&args.store.data_dir)?;
    let engine = LedgerEngine::new(db, TracingAlertSink, EngineConfig::default());
    let now = args.now.unwrap_or_else(unix_now);

    let summary = engine
        .unlock_timelocked_utxos(now)
        .with_context(|| format!("unlock at {now} failed"))?;
    engine.store().flush()?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn validate(args: cli::ValidateArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_json_flag(args.store.log_json));

    let db = open_store(&args.store.data_dir)?;
    let engine = LedgerEngine::new(db, TracingAlertSink, EngineConfig::default());

    match engine.validate_addresses(&args.addresses) {
        Ok(()) => {
            println!("ok: {} address(es) consistent", args.addresses.len());
            Ok(())
        }
        Err(EngineError::BalanceMismatch(mismatches)) => {
            println!("{}", serde_json::to_string_pretty(&mismatches)?);
            anyhow::bail!("{} balance mismatch(es) found", mismatches.len())
        }
        Err(e) => Err(e.into()),
    }
}

fn register(args: cli::RegisterArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_json_flag(args.store.log_json));

    let db = open_store(&args.store.data_dir)?;
    db.add_wallet_addresses(&args.wallet, &args.addresses)
        .with_context(|| format!("failed to register addresses for wallet {}", args.wallet))?;
    db.flush()?;

    tracing::info!(wallet = %args.wallet, count = args.addresses.len(), "addresses registered");
    Ok(())
}

fn status(args: cli::StoreArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_json_flag(args.log_json));

    let db = open_store(&args.data_dir)?;
    let best = match db.get_latest_height()? {
        Some(height) => db.get_block_by_height(height)?,
        None => None,
    };

    let report = serde_json::json!({
        "best_height": best.as_ref().map(|b| b.height),
        "best_block": best.as_ref().map(|b| b.tx_id.clone()),
        "transactions": db.transaction_count(),
        "utxos": db.utxo_count(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("walletd-node   {}", env!("CARGO_PKG_VERSION"));
    println!("walletd-engine {}", walletd_engine::VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
