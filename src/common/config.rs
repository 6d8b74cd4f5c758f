//! Environment-based Configuration
//!
//! All values come from environment variables (a `.env` file is loaded first
//! when present). The operator key is a secret and is never printed.
//!
//! # Required Environment Variables
//!
//! - `SOL_VAULT_WALLET` - Receiving address watched for deposits
//! - `SOLANA_PRIVATE` - Base58-encoded operator keypair that funds payouts
//! - `SOL_TOKEN_ADDRESS` - Token-2022 mint paid out to depositors
//! - `SOL_TOKEN_DECIMAL` - Decimal count of the mint
//!
//! # Optional Settings
//!
//! - `SOLANA_RPC_URL` - HTTP RPC endpoint (default: devnet)
//! - `SOLANA_WS_URL` - Websocket endpoint (default: derived from the RPC URL)
//! - `PORT` - HTTP listen port (default: 5000)
//! - `DATABASE_URL` - SQLite database (default: `sqlite://data/deposits.db`)
//! - `SETTLEMENT_INTERVAL_SECS` - Settlement period (default: 30)
//! - `SETTLEMENT_BATCH_SIZE` - Recipients per payout transaction (default: 10)
//! - `SETTLEMENT_CLAIM_LIMIT` - Records claimed per run (default: 100)
//! - `TRANSFER_TIMEOUT_SECS` - Payout submission bound (default: 90, longer than
//!   a blockhash stays valid)
//! - `RESOLVE_TIMEOUT_SECS` - Per-notification lookup bound (default: 10)
//! - `SIGNATURE_LOOKBACK` - Signatures fetched per account change (default: 10)
//! - `LOG_LEVEL` - Logging level (default: info)
//! - `LOG_JSON` - "1" or "true" for JSON log lines

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Solana devnet RPC endpoint
pub const DEVNET_RPC: &str = "https://api.devnet.solana.com";

/// Default SQLite location
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/deposits.db";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Main configuration struct
pub struct AppConfig {
    /// Solana HTTP RPC endpoint
    pub rpc_url: String,

    /// Solana websocket endpoint for subscriptions
    pub ws_url: String,

    /// Address watched for deposits
    pub receiving_address: Pubkey,

    /// Operator keypair that signs and funds payouts
    pub operator: Keypair,

    /// Token-2022 mint paid out
    pub token_mint: Pubkey,

    /// Decimal count of the mint
    pub token_decimals: u8,

    /// HTTP listen port
    pub port: u16,

    /// SQLite database location
    pub database_url: String,

    /// Period between settlement runs
    pub settlement_interval: Duration,

    /// Recipients per payout transaction
    pub batch_size: usize,

    /// Records claimed per settlement run
    pub claim_limit: usize,

    /// Bound on payout submission and confirmation
    pub transfer_timeout: Duration,

    /// Bound on resolving one notification
    pub resolve_timeout: Duration,

    /// Signatures looked up per account-change notification
    pub signature_lookback: usize,

    /// Log level
    pub log_level: String,

    /// Emit JSON log lines
    pub log_json: bool,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("receiving_address", &self.receiving_address)
            .field("operator", &self.operator.pubkey())
            .field("token_mint", &self.token_mint)
            .field("token_decimals", &self.token_decimals)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("settlement_interval", &self.settlement_interval)
            .field("batch_size", &self.batch_size)
            .field("claim_limit", &self.claim_limit)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = lookup("SOLANA_RPC_URL").unwrap_or_else(|| DEVNET_RPC.to_string());
        let ws_url = match lookup("SOLANA_WS_URL") {
            Some(url) => url,
            None => derive_ws_url(&rpc_url)?,
        };

        let receiving_address = parse_pubkey("SOL_VAULT_WALLET", &required(&lookup, "SOL_VAULT_WALLET")?)?;
        let operator = parse_keypair(&required(&lookup, "SOLANA_PRIVATE")?)?;
        let token_mint = parse_pubkey("SOL_TOKEN_ADDRESS", &required(&lookup, "SOL_TOKEN_ADDRESS")?)?;
        let token_decimals: u8 = parse_value("SOL_TOKEN_DECIMAL", &required(&lookup, "SOL_TOKEN_DECIMAL")?)?;

        let port: u16 = optional(&lookup, "PORT", 5000)?;
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let settlement_interval = Duration::from_secs(positive(&lookup, "SETTLEMENT_INTERVAL_SECS", 30)?);
        let batch_size = positive(&lookup, "SETTLEMENT_BATCH_SIZE", 10)? as usize;
        let claim_limit = positive(&lookup, "SETTLEMENT_CLAIM_LIMIT", 100)? as usize;
        let transfer_timeout = Duration::from_secs(positive(&lookup, "TRANSFER_TIMEOUT_SECS", 90)?);
        let resolve_timeout = Duration::from_secs(positive(&lookup, "RESOLVE_TIMEOUT_SECS", 10)?);
        let signature_lookback = positive(&lookup, "SIGNATURE_LOOKBACK", 10)? as usize;

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_json = lookup("LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            rpc_url,
            ws_url,
            receiving_address,
            operator,
            token_mint,
            token_decimals,
            port,
            database_url,
            settlement_interval,
            batch_size,
            claim_limit,
            transfer_timeout,
            resolve_timeout,
            signature_lookback,
            log_level,
            log_json,
        })
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== Deposit Airdrop Configuration ===");
        println!("Solana RPC: {}", self.rpc_url);
        println!("Solana WS: {}", self.ws_url);
        println!("Receiving Address: {}", self.receiving_address);
        println!("Operator: {}", self.operator.pubkey());
        println!("Token Mint: {} ({} decimals)", self.token_mint, self.token_decimals);
        println!("Database: {}", self.database_url);
        println!("HTTP Port: {}", self.port);
        println!(
            "Settlement: every {}s, {} per transaction, {} per run",
            self.settlement_interval.as_secs(),
            self.batch_size,
            self.claim_limit
        );
        println!("Log Level: {}", self.log_level);
        println!("=====================================");
    }
}

/// Derive the websocket endpoint from an HTTP RPC endpoint
pub fn derive_ws_url(rpc_url: &str) -> Result<String, ConfigError> {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else {
        Err(ConfigError::InvalidValue(
            "SOLANA_RPC_URL".to_string(),
            format!("expected http(s) URL, got {}", rpc_url),
        ))
    }
}

/// Decode a base58 secret key into a keypair
pub fn parse_keypair(secret: &str) -> Result<Keypair, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue("SOLANA_PRIVATE".to_string(), reason);

    let bytes = bs58::decode(secret.trim())
        .into_vec()
        .map_err(|e| invalid(format!("not base58: {}", e)))?;
    Keypair::try_from(bytes.as_slice()).map_err(|e| invalid(format!("not a keypair: {}", e)))
}

fn required<F>(lookup: &F, name: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => parse_value(name, &value),
        None => Ok(default),
    }
}

fn positive<F>(lookup: &F, name: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = optional(lookup, name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

fn parse_value<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn parse_pubkey(name: &str, value: &str) -> Result<Pubkey, ConfigError> {
    Pubkey::from_str(value.trim())
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, String> {
        let operator = Keypair::new();
        HashMap::from([
            ("SOL_VAULT_WALLET", Pubkey::new_unique().to_string()),
            ("SOLANA_PRIVATE", operator.to_base58_string()),
            ("SOL_TOKEN_ADDRESS", Pubkey::new_unique().to_string()),
            ("SOL_TOKEN_DECIMAL", "6".to_string()),
        ])
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_env()).unwrap();

        assert_eq!(config.rpc_url, DEVNET_RPC);
        assert_eq!(config.ws_url, "wss://api.devnet.solana.com");
        assert_eq!(config.token_decimals, 6);
        assert_eq!(config.port, 5000);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.settlement_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.transfer_timeout, Duration::from_secs(90));
        assert!(!config.log_json);
    }

    #[test]
    fn test_operator_key_round_trip() {
        let mut env = base_env();
        let operator = Keypair::new();
        env.insert("SOLANA_PRIVATE", operator.to_base58_string());

        let config = load(&env).unwrap();
        assert_eq!(config.operator.pubkey(), operator.pubkey());
    }

    #[test]
    fn test_missing_required() {
        let mut env = base_env();
        env.remove("SOL_TOKEN_ADDRESS");

        assert!(matches!(load(&env), Err(ConfigError::MissingEnvVar(v)) if v == "SOL_TOKEN_ADDRESS"));
    }

    #[test]
    fn test_invalid_values() {
        let mut env = base_env();
        env.insert("SOLANA_PRIVATE", "not-base58-0OIl".to_string());
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue(v, _)) if v == "SOLANA_PRIVATE"));

        let mut env = base_env();
        env.insert("SETTLEMENT_BATCH_SIZE", "0".to_string());
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue(v, _)) if v == "SETTLEMENT_BATCH_SIZE"));

        let mut env = base_env();
        env.insert("SOL_VAULT_WALLET", "nope".to_string());
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_ws_url_derivation() {
        assert_eq!(derive_ws_url("http://127.0.0.1:8899").unwrap(), "ws://127.0.0.1:8899");
        assert!(derive_ws_url("ftp://example").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let env = base_env();
        let config = load(&env).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(env["SOLANA_PRIVATE"].as_str()));
    }
}
