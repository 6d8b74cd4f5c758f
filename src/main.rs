//! Deposit Airdrop Relay
//!
//! Run modes:
//!   cargo run                    - Start watcher, settlement batcher and HTTP server
//!   cargo run -- run             - Same as above
//!   cargo run -- settle          - Run one settlement pass and exit
//!   cargo run -- status          - Print ledger counts

use deposit_airdrop::common::{
    self, AppConfig, AppError, ConfigError, EventCategory, LogEvent, LogLevel,
};
use deposit_airdrop::settlement::{BatcherConfig, SettlementBatcher, Token2022Executor};
use deposit_airdrop::storage::{LedgerStore, SqliteLedgerStore};
use deposit_airdrop::types::DepositStatus;
use deposit_airdrop::watcher::{
    DepositIngestor, DepositWatcher, RpcTransactionResolver, TransactionResolver,
};
use deposit_airdrop::{api, units};
use std::env;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");
    let rest = args.get(2..).unwrap_or(&[]);

    let result = match command {
        "run" => run_relay(rest).await,
        "settle" => run_settlement_once().await,
        "status" => show_status().await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        if e.is_fatal() {
            error!(code = e.error_code(), error = %e, "Fatal startup failure");
            eprintln!("Fatal [{}]: {}", e.error_code(), e);
            std::process::exit(1);
        }
        error!(code = e.error_code(), error = %e, "Relay exited with error");
        eprintln!("Error [{}]: {}", e.error_code(), e);
        std::process::exit(3);
    }
}

fn print_usage() {
    println!("Deposit Airdrop Relay");
    println!();
    println!("Usage:");
    println!("  deposit-airdrop [run] [--port <port>]   Start watcher, batcher and HTTP server");
    println!("  deposit-airdrop settle                  Run one settlement pass and exit");
    println!("  deposit-airdrop status                  Print ledger counts");
    println!();
    println!("Environment Variables:");
    println!("  SOL_VAULT_WALLET      Receiving address watched for deposits");
    println!("  SOLANA_PRIVATE        Base58 operator keypair funding payouts");
    println!("  SOL_TOKEN_ADDRESS     Token-2022 mint paid out");
    println!("  SOL_TOKEN_DECIMAL     Decimal count of the mint");
    println!("  SOLANA_RPC_URL        Solana RPC endpoint (default: devnet)");
    println!("  SOLANA_WS_URL         Solana websocket endpoint (default: derived)");
    println!("  PORT                  HTTP port (default: 5000)");
    println!("  DATABASE_URL          SQLite ledger (default: sqlite://data/deposits.db)");
    println!("  LOG_LEVEL, LOG_JSON   Logging configuration");
    println!();
    println!("Exit codes:");
    println!("  1  Configuration or startup failure");
    println!("  2  Unknown command");
    println!("  3  Ledger or RPC failure; a restart may succeed");
}

/// Parse `run` flags, returning the HTTP port
fn parse_run_args(args: &[String], default_port: u16) -> Result<u16, ConfigError> {
    let mut port = default_port;
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        if arg == "--port" {
            let value = args.next().ok_or_else(|| {
                ConfigError::InvalidValue("--port".to_string(), "missing value".to_string())
            })?;
            port = value
                .parse()
                .map_err(|e| ConfigError::InvalidValue("--port".to_string(), format!("{}", e)))?;
        }
    }
    Ok(port)
}

/// Load config, start logging and open the ledger
///
/// Any failure here is fatal.
async fn bootstrap() -> Result<(AppConfig, Arc<SqliteLedgerStore>), AppError> {
    let config = AppConfig::from_env()?;
    common::init_from_config(&config)?;

    let store = SqliteLedgerStore::open(&config.database_url).map_err(|e| {
        AppError::startup(format!("cannot open ledger {}: {}", config.database_url, e))
    })?;
    let stats = store
        .count_by_status()
        .await
        .map_err(|e| AppError::startup(format!("ledger unreadable: {}", e)))?;
    info!(database = %config.database_url, "{}", stats);

    Ok((config, Arc::new(store)))
}

/// Settle or release claims left in progress by an interrupted run
async fn recover_claims(batcher: &SettlementBatcher) -> Result<(), AppError> {
    let report = batcher.recover_interrupted().await?;
    if report.has_activity() {
        warn!("Recovered claims from a previous run: {}", report);
    }
    Ok(())
}

async fn run_relay(args: &[String]) -> Result<(), AppError> {
    let (config, store) = bootstrap().await?;
    let port = parse_run_args(args, config.port)?;

    config.print_summary();

    let ledger: Arc<dyn LedgerStore> = store;
    let batcher_config = BatcherConfig::from_app_config(&config);

    // Watcher
    let resolver = Arc::new(RpcTransactionResolver::new(&config.rpc_url));
    let start_slot = resolver.current_slot().await?;
    info!(slot = start_slot, "Watching deposits from slot");
    let ingestor = Arc::new(
        DepositIngestor::new(ledger.clone(), resolver, config.receiving_address)
            .with_resolve_timeout(config.resolve_timeout)
            .with_signature_lookback(config.signature_lookback)
            .with_min_slot(start_slot),
    );
    let watcher = DepositWatcher::new(config.ws_url.clone(), config.receiving_address)
        .start(ingestor);

    // Settlement
    let executor = Arc::new(Token2022Executor::new(
        &config.rpc_url,
        config.operator,
        config.token_mint,
        config.token_decimals,
    ));
    info!(
        operator = %executor.payer_pubkey(),
        source = %executor.source_account(),
        "Payout account"
    );
    let batcher = Arc::new(SettlementBatcher::new(ledger, executor, batcher_config));
    recover_claims(&batcher).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let batcher_task = batcher.start(shutdown_rx);

    // HTTP
    let (server_stop_tx, server_stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(api::start_server(port, async move {
        let _ = server_stop_rx.await;
    }));

    let event = LogEvent::new(LogLevel::Info, EventCategory::System, "relay_started").with_data(
        serde_json::json!({
            "receiving_address": config.receiving_address.to_string(),
            "token_mint": config.token_mint.to_string(),
            "port": port,
        }),
    );
    info!(target: "airdrop::system", "{}", event.to_json());

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            None
        }
        result = &mut server => Some(result),
    };

    // Stop settlement first so no payout starts during teardown.
    let _ = shutdown_tx.send(true);
    if let Err(e) = batcher_task.await {
        warn!(error = %e, "Settlement task failed");
    }

    watcher.shutdown().await;

    let _ = server_stop_tx.send(());
    let server_result = match early_exit {
        Some(result) => result,
        None => server.await,
    };

    let event = LogEvent::new(LogLevel::Info, EventCategory::System, "relay_stopped");
    info!(target: "airdrop::system", "{}", event.to_json());

    match server_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::startup(format!("HTTP server failed: {}", e))),
        Err(e) => Err(AppError::startup(format!("HTTP server task failed: {}", e))),
    }
}

async fn run_settlement_once() -> Result<(), AppError> {
    let (config, store) = bootstrap().await?;
    let batcher_config = BatcherConfig::from_app_config(&config);

    let executor = Arc::new(Token2022Executor::new(
        &config.rpc_url,
        config.operator,
        config.token_mint,
        config.token_decimals,
    ));
    let batcher = SettlementBatcher::new(store, executor, batcher_config);
    recover_claims(&batcher).await?;

    let report = batcher.run_once().await?;
    println!("Settlement run: {}", report);
    for signature in &report.payout_signatures {
        println!("  payout {}", signature);
    }
    Ok(())
}

async fn show_status() -> Result<(), AppError> {
    let database_url = env::var("DATABASE_URL")
        .unwrap_or_else(|_| common::config::DEFAULT_DATABASE_URL.to_string());
    let store = SqliteLedgerStore::open(&database_url)
        .map_err(|e| AppError::startup(format!("cannot open ledger {}: {}", database_url, e)))?;

    let stats = store.count_by_status().await?;
    println!("Ledger: {}", database_url);
    println!("{}", stats);

    let in_progress = store.get_by_status(DepositStatus::InProgress).await?;
    for record in in_progress {
        println!(
            "  in progress: {} {} -> {} (attempts: {}, payout: {})",
            record.signature,
            units::lamports_to_display(record.amount),
            record.sender,
            record.attempts,
            record.payout_signature.as_deref().unwrap_or("not signed")
        );
    }
    Ok(())
}
