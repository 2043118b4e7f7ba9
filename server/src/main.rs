// Copyright (c) 2026 Roster Contributors. MIT License.
// See LICENSE for details.

//! # Roster Server
//!
//! Entry point for the `roster-server` binary. Parses CLI arguments,
//! initializes logging and metrics, loads or creates the signing key, and
//! serves the admin API.
//!
//! The binary supports four subcommands:
//!
//! - `run`     — serve the API and metrics
//! - `init`    — create the data directory and keypair
//! - `verify`  — fetch a running server's export and verify it
//! - `version` — print build version information

mod api;
mod cli;
mod client;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use roster_integrity::config::{CURVE_NAME, HASH_ALGORITHM, SIGNATURE_ALGORITHM};
use roster_integrity::crypto::{KeyStore, RecordSigner};
use roster_integrity::pipeline::IntegrityPipeline;
use roster_integrity::user::{UserRecord, UserStore};

use cli::{Commands, RosterCli};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::ServerMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RosterCli::parse();

    match cli.command {
        Commands::Run(args) => run_server(args, cli.log_format).await,
        Commands::Init(args) => init_data_dir(args, cli.log_format),
        Commands::Verify(args) => verify_remote(args, cli.log_format).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Opens the key store, initializing it on first boot.
fn open_keys(data_dir: &std::path::Path) -> Result<Arc<KeyStore>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    let keys = KeyStore::in_data_dir(data_dir);
    keys.initialize()
        .with_context(|| format!("failed to initialize keys in {}", keys.dir().display()))?;
    Ok(Arc::new(keys))
}

/// Starts the API server and metrics endpoint.
async fn run_server(args: cli::RunArgs, format: LogFormat) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, format);

    let data_dir = &args.data.data_dir;
    tracing::info!(
        port = args.port,
        metrics_port = args.metrics_port,
        data_dir = %data_dir.display(),
        "starting roster-server"
    );

    // --- Keys ---
    let keys = open_keys(data_dir)?;
    tracing::info!(dir = %keys.dir().display(), "signing key ready");

    // --- Persistent storage ---
    let db_path = data_dir.join("db");
    let users = Arc::new(
        UserStore::open(&db_path, RecordSigner::new(Arc::clone(&keys)))
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), users = users.count(), "database opened");

    // --- Metrics ---
    let server_metrics =
        Arc::new(ServerMetrics::new().context("failed to register metrics")?);
    server_metrics.users_total.set(users.count() as i64);

    // --- Application state ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        keys,
        users,
        metrics: Arc::clone(&server_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("{}:{}", args.bind, args.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(server_metrics);
    let metrics_addr = format!("{}:{}", args.bind, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    tracing::info!("roster-server stopped");
    Ok(())
}

/// Creates the data directory and keypair, then prints the public key.
fn init_data_dir(args: cli::InitArgs, format: LogFormat) -> Result<()> {
    logging::init_logging("roster_server=info,roster_integrity=info", format);

    let data_dir = &args.data.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing data directory");

    let keys = open_keys(data_dir)?;
    let pem = keys.public_key().context("keys not loaded after initialization")?;

    println!("Roster initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Key directory  : {}", keys.dir().display());
    println!(
        "  Scheme         : {} / {} / {}",
        SIGNATURE_ALGORITHM, CURVE_NAME, HASH_ALGORITHM
    );
    println!();
    print!("{}", pem);

    Ok(())
}

/// Runs one refresh against a remote server and prints what verified.
async fn verify_remote(args: cli::VerifyArgs, format: LogFormat) -> Result<()> {
    logging::init_logging("roster_server=warn,roster_integrity=warn", format);

    let source = client::HttpSource::new(&args.api_url)?;
    let pipeline = IntegrityPipeline::new(source);
    let outcome = pipeline
        .refresh()
        .await
        .with_context(|| format!("verification against {} failed", args.api_url))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(outcome.trusted.as_slice())?);
    } else {
        print_table(&outcome.trusted);
        println!();
        println!(
            "{} received, {} trusted, {} rejected",
            outcome.received,
            outcome.trusted.len(),
            outcome.rejected()
        );
    }

    if outcome.rejected() > 0 {
        tracing::warn!(rejected = outcome.rejected(), "export contained unverifiable records");
    }
    Ok(())
}

fn print_table(records: &[UserRecord]) {
    let width = records
        .iter()
        .map(|r| r.email.len())
        .max()
        .unwrap_or(0)
        .max("EMAIL".len());

    println!(
        "{:>6}  {:<width$}  {:<6}  {:<8}  CREATED",
        "ID", "EMAIL", "ROLE", "STATUS"
    );
    for r in records {
        println!(
            "{:>6}  {:<width$}  {:<6}  {:<8}  {}",
            r.id,
            r.email,
            r.role.as_str(),
            r.status.as_str(),
            r.created_at
        );
    }
}

/// Prints version information to stdout.
fn print_version() {
    println!("roster-server {}", env!("CARGO_PKG_VERSION"));
    println!(
        "signing       {} {} {}",
        SIGNATURE_ALGORITHM, CURVE_NAME, HASH_ALGORITHM
    );
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// If a handler cannot be installed, that branch never fires and the other
/// one still does.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
