//! StakePoints CLI: runs the staking points pipeline and inspects the ledger.
//!
//! # Commands
//! ```text
//! stakepoints run                         # default: subscribe and accrue until Ctrl-C
//! stakepoints points  <wallet> [--json]   # print one wallet's ledger entry
//! stakepoints applied <tx_hash> <index>   # was this log already accrued?
//! stakepoints info                        # resolved (non-secret) configuration
//! ```
//!
//! Only `run` needs the chain settings; `points` and `applied` read the
//! ledger with nothing but `DATABASE_URL`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use stakepoints_core::{
    AmountNormalizer, CheckpointStore, DedupKey, LedgerAccrualEngine, PointsStore, WalletAddress,
};
use stakepoints_evm::{connect_source, StakePipeline, StakedLogDecoder, STAKED_SIGNATURE};
use stakepoints_storage::{InMemoryPointsStore, PostgresPointsStore, SqlitePointsStore};

mod config;
mod telemetry;

use config::{redact_url, AppConfig, ChainConfig, DatabaseTarget};

#[derive(Parser)]
#[command(
    name = "stakepoints",
    about = "Accrue loyalty points from staking contract Staked events",
    long_about = "
StakePoints: listens for Staked(address,uint256,address) events and credits
amount * POINTS_PRECISION points (amount in 18-decimal token units) to the
onBehalfOf wallet. Each log is applied at most once.

ENVIRONMENT VARIABLES (a .env file is read if present):
  ENVIRONMENT                           dev | production
  LOCALHOST_RPC_URL                     RPC endpoint for dev (ws:// or http://)
  STEAKING_CONTRACT_ADDRESS_LOCALHOST   staking contract for dev
  MAINNET_RPC_URL                       RPC endpoint for production
  STEAKING_CONTRACT_ADDRESS_MAINNET     staking contract for production
  DATABASE_URL                          memory | sqlite:<path> | postgres://...
  POINTS_PRECISION                      points per token (default 100)
  START_BLOCK                           first block to scan (default: stored checkpoint, else head)
  CONFIRMATIONS                         blocks behind head (HTTP polling, default 0)
  POLL_INTERVAL_MS                      HTTP polling interval
  LOG_BATCH_SIZE                        blocks per eth_getLogs call (polling and backfill)
  MAX_IN_FLIGHT                         concurrent accruals (default 64)
  STORE_MAX_RETRIES                     retries for a busy store (default 5)
  LOG_LEVEL, LOG_JSON                   logging
",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted
    Run,

    /// Show the points ledger entry of a wallet
    Points {
        /// Wallet address (0x-prefixed, any case)
        wallet: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check whether a log has already been accrued
    Applied {
        /// Transaction hash of the log
        tx_hash: String,
        /// Position of the log within its block
        log_index: u64,
    },

    /// Print the resolved configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;
    telemetry::init_tracing(&config.log);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config).await,
        Commands::Points { wallet, json } => cmd_points(&config, &wallet, json).await,
        Commands::Applied { tx_hash, log_index } => cmd_applied(&config, &tx_hash, log_index).await,
        Commands::Info => {
            cmd_info(&config);
            Ok(())
        }
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(config: &AppConfig) -> Result<()> {
    let chain = ChainConfig::from_env().context("invalid chain configuration")?;
    let (store, checkpoints) = open_store(&config.database).await?;
    let normalizer = AmountNormalizer::new(chain.precision.clone())?;
    let engine = Arc::new(LedgerAccrualEngine::new(store, normalizer, chain.retry_policy()));

    let decoder = StakedLogDecoder::new(chain.contract.clone());
    let checkpoint = checkpoints
        .load_checkpoint(decoder.contract().as_str())
        .await
        .context("cannot read checkpoint")?;
    // START_BLOCK wins; otherwise replay from the last settled block.
    let start_block = chain.start_block.or(checkpoint);
    if chain.start_block.is_none() {
        if let Some(block) = checkpoint {
            info!(block, "resuming from stored checkpoint");
        }
    }

    let source = connect_source(&chain.rpc_url, decoder.filter(), chain.polling_options(start_block))?;
    let pipeline = StakePipeline::new(engine, source, decoder, chain.pipeline_config())
        .with_checkpoints(checkpoints);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested, draining in-flight accruals");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for Ctrl-C; stop the process externally");
                // Keep the sender alive so the pipeline is not told to stop.
                std::future::pending::<()>().await;
            }
        }
    });

    info!(
        environment = %chain.environment,
        rpc = %redact_url(&chain.rpc_url),
        contract = %chain.contract,
        store = %config.database,
        start_block = ?start_block,
        "starting stakepoints"
    );

    let report = pipeline.run(shutdown_rx).await.context("pipeline stopped")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_points(config: &AppConfig, wallet: &str, json: bool) -> Result<()> {
    let wallet = WalletAddress::parse(wallet)?;
    let (store, _) = open_store(&config.database).await?;
    let entry = store.entry(&wallet).await?;

    match (entry, json) {
        (Some(entry), true) => println!("{}", serde_json::to_string_pretty(&entry)?),
        (None, true) => println!("null"),
        (Some(entry), false) => println!("{}  {} points  (updated_at {})", wallet, entry.points, entry.updated_at),
        (None, false) => println!("{wallet}  no points recorded"),
    }
    Ok(())
}

async fn cmd_applied(config: &AppConfig, tx_hash: &str, log_index: u64) -> Result<()> {
    let key = DedupKey::new(tx_hash, log_index);
    let (store, _) = open_store(&config.database).await?;
    let applied = store.is_applied(&key).await?;
    println!("{key}  {}", if applied { "applied" } else { "not applied" });
    Ok(())
}

fn cmd_info(config: &AppConfig) {
    println!("StakePoints v{}", env!("CARGO_PKG_VERSION"));
    println!("  Event:            {STAKED_SIGNATURE}");
    println!("  Points store:     {}", config.database);

    let chain = match ChainConfig::from_env() {
        Ok(chain) => chain,
        Err(e) => {
            println!("  Chain settings:   unavailable ({e})");
            return;
        }
    };
    println!("  Environment:      {}", chain.environment);
    println!("  RPC endpoint:     {}", redact_url(&chain.rpc_url));
    println!("  Contract:         {}", chain.contract);
    println!("  Points per token: {}", chain.precision);
    match chain.start_block {
        Some(b) => println!("  Start block:      {b}"),
        None => println!("  Start block:      checkpoint, else chain head"),
    }
    println!("  Confirmations:    {}", chain.confirmations);
    println!("  Poll interval:    {} ms", chain.poll_interval.as_millis());
    println!("  Log batch size:   {} blocks/call", chain.batch_size);
    println!("  Max in flight:    {}", chain.max_in_flight);
    println!("  Store retries:    {}", chain.store_max_retries);
}

type Stores = (Arc<dyn PointsStore>, Arc<dyn CheckpointStore>);

/// Open the configured database as both the ledger and the checkpoint store.
async fn open_store(target: &DatabaseTarget) -> Result<Stores> {
    Ok(match target {
        DatabaseTarget::Memory => {
            warn!("using in-memory points store; balances are lost on exit");
            shared(InMemoryPointsStore::new())
        }
        DatabaseTarget::Sqlite(url) => shared(SqlitePointsStore::open(url).await?),
        DatabaseTarget::Postgres(url) => shared(PostgresPointsStore::connect(url).await?),
    })
}

fn shared<S>(store: S) -> Stores
where
    S: PointsStore + CheckpointStore + 'static,
{
    let store = Arc::new(store);
    (store.clone(), store)
}
