use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use coin_indexer::api::{self, AppState};
use coin_indexer::config::{self, Config};
use coin_indexer::db::Database;
use coin_indexer::monitor::MonitorSettings;
use coin_indexer::rpc::RpcClient;
use coin_indexer::supervisor::Supervisor;
use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Indexes ERC20 Transfer events from monitored token contracts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the configured contracts and store their transfers
    Index,
    /// Serve the query API over the existing database
    Serve,
    /// Index and serve in one process; contracts added over the API start immediately
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load().wrap_err("invalid configuration")?;
    let db = Database::open(&cfg.db_path)
        .wrap_err_with(|| format!("failed to open {}", cfg.db_path))?;

    match cli.command {
        Command::Index => {
            let supervisor = start_indexer(&cfg, &db).await?;
            signal::ctrl_c().await?;
            info!("Shutdown signal received, stopping...");
            supervisor.shutdown().await;
        }
        Command::Serve => {
            let shutdown = CancellationToken::new();
            let api = tokio::spawn(api::serve(
                bind_addr(&cfg)?,
                AppState { db, supervisor: None },
                shutdown.clone(),
            ));
            signal::ctrl_c().await?;
            info!("Shutdown signal received, stopping...");
            shutdown.cancel();
            api.await??;
        }
        Command::Run => {
            let supervisor = start_indexer(&cfg, &db).await?;
            let shutdown = CancellationToken::new();
            let mut api = tokio::spawn(api::serve(
                bind_addr(&cfg)?,
                AppState {
                    db,
                    supervisor: Some(Arc::clone(&supervisor)),
                },
                shutdown.clone(),
            ));

            tokio::select! {
                res = &mut api => match res {
                    Ok(Ok(())) => info!("API exited"),
                    Ok(Err(e)) => error!("API error: {:?}", e),
                    Err(e) => error!("API task panicked: {:?}", e),
                },
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping...");
                }
            }

            supervisor.shutdown().await;
            shutdown.cancel();
            if !api.is_finished() {
                if let Err(e) = api.await? {
                    error!("API error: {:?}", e);
                }
            }
        }
    }

    info!("coin-indexer stopped.");
    Ok(())
}

fn bind_addr(cfg: &Config) -> Result<SocketAddr> {
    format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .wrap_err("invalid HOST/PORT")
}

/// Record configured contracts in the registry, then start a monitor for
/// every active contract (configured or registered over the API earlier).
async fn start_indexer(cfg: &Config, db: &Database) -> Result<Arc<Supervisor>> {
    let endpoint = cfg.rpc_endpoint()?;
    let chain = RpcClient::new(endpoint, cfg.rpc_timeout)?;

    for contract in &cfg.contracts {
        db.upsert_contract(contract.clone()).await?;
    }
    let contracts: Vec<_> = db
        .contracts(true)
        .await?
        .iter()
        .map(|row| row.descriptor())
        .collect();

    let settings = MonitorSettings {
        poll_interval: cfg.poll_interval,
        max_chunk_width: cfg.max_chunk_width,
        confirmations: cfg.confirmations,
    };
    let store = Arc::new(db.clone());
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(chain),
        store.clone(),
        store,
        settings,
    ));

    let started = supervisor.start(contracts);
    if started == 0 {
        warn!("no active contracts; register one with POST /contracts");
    }
    info!(rpc = %endpoint, monitors = started, "indexer started");
    Ok(supervisor)
}
