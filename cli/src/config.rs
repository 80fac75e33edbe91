//! Process configuration, resolved once from the environment at startup.
//!
//! `.env` files are honoured (loaded by `main` through `dotenvy`) but real
//! environment variables take precedence.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use stakepoints_core::error::PointsError;
use stakepoints_core::normalizer::DEFAULT_PRECISION;
use stakepoints_core::retry::RetryPolicy;
use stakepoints_core::types::WalletAddress;
use stakepoints_evm::{PipelineConfig, PollingOptions};

use crate::telemetry::LogConfig;

/// Deployment target; selects which RPC / contract variables are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Production,
}

impl Environment {
    fn rpc_key(self) -> &'static str {
        match self {
            Self::Dev => "LOCALHOST_RPC_URL",
            Self::Production => "MAINNET_RPC_URL",
        }
    }

    fn contract_key(self) -> &'static str {
        match self {
            Self::Dev => "STEAKING_CONTRACT_ADDRESS_LOCALHOST",
            Self::Production => "STEAKING_CONTRACT_ADDRESS_MAINNET",
        }
    }
}

impl FromStr for Environment {
    type Err = PointsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "production" | "prod" => Ok(Self::Production),
            other => Err(PointsError::Config(format!(
                "ENVIRONMENT must be 'dev' or 'production', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dev => "dev",
            Self::Production => "production",
        })
    }
}

/// Where the points ledger lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Memory,
    Sqlite(String),
    Postgres(String),
}

impl FromStr for DatabaseTarget {
    type Err = PointsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else if s.starts_with("sqlite:") {
            Ok(Self::Sqlite(s.to_string()))
        } else if s.starts_with("postgres://") || s.starts_with("postgresql://") {
            Ok(Self::Postgres(s.to_string()))
        } else {
            Err(PointsError::Config(format!(
                "DATABASE_URL must be 'memory', 'sqlite:<path>' or 'postgres://...', got '{}'",
                redact_url(s)
            )))
        }
    }
}

impl fmt::Display for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Sqlite(url) => f.write_str(url),
            Self::Postgres(url) => f.write_str(&redact_url(url)),
        }
    }
}

/// Settings every command needs: where the ledger is and how to log.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseTarget,
    pub log: LogConfig,
}

impl AppConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, PointsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PointsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = non_blank(&lookup);
        let database: DatabaseTarget = require(&get, "DATABASE_URL")?.parse()?;
        let log = LogConfig {
            level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            json: get("LOG_JSON").map(|v| parse_bool("LOG_JSON", &v)).transpose()?.unwrap_or(false),
        };
        Ok(Self { database, log })
    }
}

/// Settings for following the chain; only `run` needs them.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub environment: Environment,
    pub rpc_url: String,
    pub contract: WalletAddress,
    pub precision: BigDecimal,
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub poll_interval: Duration,
    pub batch_size: u64,
    pub max_in_flight: usize,
    pub store_max_retries: u32,
}

impl ChainConfig {
    pub fn from_env() -> Result<Self, PointsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PointsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = non_blank(&lookup);

        let environment: Environment = require(&get, "ENVIRONMENT")?.parse()?;
        let rpc_url = require(&get, environment.rpc_key())?.trim().to_string();
        let contract = WalletAddress::parse(&require(&get, environment.contract_key())?).map_err(|e| {
            PointsError::Config(format!("{}: {e}", environment.contract_key()))
        })?;

        let precision = match get("POINTS_PRECISION") {
            Some(raw) => BigDecimal::from_str(raw.trim())
                .map_err(|e| PointsError::Config(format!("POINTS_PRECISION '{raw}': {e}")))?,
            None => BigDecimal::from(DEFAULT_PRECISION),
        };

        let start_block = get("START_BLOCK").map(|v| parse_num("START_BLOCK", &v)).transpose()?;
        let confirmations = parse_or(&get, "CONFIRMATIONS", 0u64)?;
        let poll_interval = Duration::from_millis(parse_or(&get, "POLL_INTERVAL_MS", 2_000u64)?);
        let batch_size = parse_or(&get, "LOG_BATCH_SIZE", 1_000u64)?;
        let max_in_flight = parse_or(&get, "MAX_IN_FLIGHT", 64usize)?;
        let default_retries = RetryPolicy::default().max_retries.unwrap_or(5);
        let store_max_retries = parse_or(&get, "STORE_MAX_RETRIES", default_retries)?;

        if batch_size == 0 {
            return Err(PointsError::Config("LOG_BATCH_SIZE must be at least 1".into()));
        }
        if max_in_flight == 0 {
            return Err(PointsError::Config("MAX_IN_FLIGHT must be at least 1".into()));
        }

        Ok(Self {
            environment,
            rpc_url,
            contract,
            precision,
            start_block,
            confirmations,
            poll_interval,
            batch_size,
            max_in_flight,
            store_max_retries,
        })
    }

    /// Polling options starting at `start_block`, which may come from a
    /// stored checkpoint rather than `START_BLOCK`.
    pub fn polling_options(&self, start_block: Option<u64>) -> PollingOptions {
        PollingOptions {
            start_block,
            confirmations: self.confirmations,
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            ..PollingOptions::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_in_flight: self.max_in_flight,
            ..PipelineConfig::default()
        }
    }

    /// Store retry policy with `STORE_MAX_RETRIES` in place of the default budget.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: Some(self.store_max_retries),
            ..RetryPolicy::default()
        }
    }
}

fn non_blank<'a, F>(lookup: &'a F) -> impl Fn(&str) -> Option<String> + 'a
where
    F: Fn(&str) -> Option<String>,
{
    move |key: &str| lookup(key).filter(|v| !v.trim().is_empty())
}

fn require<G>(get: &G, key: &str) -> Result<String, PointsError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| PointsError::Config(format!("missing required variable {key}")))
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T, PointsError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| PointsError::Config(format!("{key} '{raw}': {e}")))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, PointsError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_num(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, PointsError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PointsError::Config(format!("{key} '{raw}' is not a boolean"))),
    }
}

/// Strip credentials and path (RPC providers embed API keys there) from a URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    if host.len() < rest.len() {
        format!("{scheme}://{host}/…")
    } else {
        format!("{scheme}://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    fn dev_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("ENVIRONMENT", "dev"),
            ("LOCALHOST_RPC_URL", "ws://127.0.0.1:8545"),
            ("STEAKING_CONTRACT_ADDRESS_LOCALHOST", CONTRACT),
            ("DATABASE_URL", "memory"),
        ]
    }

    #[test]
    fn dev_defaults() {
        let app = AppConfig::from_lookup(lookup(&dev_vars())).unwrap();
        assert_eq!(app.database, DatabaseTarget::Memory);
        assert_eq!(app.log, LogConfig::default());

        let cfg = ChainConfig::from_lookup(lookup(&dev_vars())).unwrap();
        assert_eq!(cfg.environment, Environment::Dev);
        assert_eq!(cfg.rpc_url, "ws://127.0.0.1:8545");
        assert_eq!(cfg.contract.as_str(), "0x5fbdb2315678afecb367f032d93f642f64180aa3");
        assert_eq!(cfg.precision, BigDecimal::from(100));
        assert_eq!(cfg.start_block, None);
        assert_eq!(cfg.confirmations, 0);
        assert_eq!(cfg.poll_interval, Duration::from_millis(2_000));
        assert_eq!(cfg.batch_size, 1_000);
        assert_eq!(cfg.max_in_flight, 64);
        assert_eq!(cfg.store_max_retries, 5);
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn production_reads_mainnet_keys() {
        let vars = [
            ("ENVIRONMENT", "production"),
            ("MAINNET_RPC_URL", "https://rpc.example/v3/secret"),
            ("STEAKING_CONTRACT_ADDRESS_MAINNET", CONTRACT),
            ("LOCALHOST_RPC_URL", "ws://ignored"),
            ("DATABASE_URL", "postgres://user:pw@db:5432/points"),
            ("POINTS_PRECISION", "2.5"),
            ("START_BLOCK", "19000000"),
            ("CONFIRMATIONS", "12"),
            ("STORE_MAX_RETRIES", "9"),
            ("LOG_JSON", "true"),
        ];
        let cfg = ChainConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(cfg.environment, Environment::Production);
        assert_eq!(cfg.rpc_url, "https://rpc.example/v3/secret");
        assert_eq!(cfg.precision, BigDecimal::from_str("2.5").unwrap());
        assert_eq!(cfg.start_block, Some(19_000_000));
        assert_eq!(cfg.polling_options(Some(7)).start_block, Some(7));
        assert_eq!(cfg.polling_options(None).confirmations, 12);
        assert_eq!(cfg.retry_policy().max_retries, Some(9));

        let app = AppConfig::from_lookup(lookup(&vars)).unwrap();
        assert!(app.log.json);
        assert_eq!(app.database.to_string(), "postgres://db:5432/…");
    }

    #[test]
    fn store_commands_need_only_database_url() {
        let vars = [("DATABASE_URL", "sqlite:./points.db")];
        let app = AppConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(app.database, DatabaseTarget::Sqlite("sqlite:./points.db".into()));

        assert!(matches!(
            ChainConfig::from_lookup(lookup(&vars)),
            Err(PointsError::Config(m)) if m.contains("ENVIRONMENT")
        ));
    }

    #[test]
    fn missing_and_invalid_values_are_config_errors() {
        let mut vars = dev_vars();
        vars.retain(|(k, _)| *k != "DATABASE_URL");
        assert!(matches!(
            AppConfig::from_lookup(lookup(&vars)),
            Err(PointsError::Config(m)) if m.contains("DATABASE_URL")
        ));

        for (key, value) in [("DATABASE_URL", "mysql://x"), ("LOG_JSON", "maybe")] {
            let mut vars = dev_vars();
            vars.retain(|(k, _)| *k != key);
            vars.push((key, value));
            let result = AppConfig::from_lookup(lookup(&vars));
            assert!(matches!(result, Err(PointsError::Config(_))), "{key}={value}");
        }

        for (key, value) in [
            ("ENVIRONMENT", "staging"),
            ("STEAKING_CONTRACT_ADDRESS_LOCALHOST", "0xABC"),
            ("LOCALHOST_RPC_URL", "  "),
            ("POINTS_PRECISION", "lots"),
            ("MAX_IN_FLIGHT", "0"),
        ] {
            let mut vars = dev_vars();
            vars.retain(|(k, _)| *k != key);
            vars.push((key, value));
            let result = ChainConfig::from_lookup(lookup(&vars));
            assert!(matches!(result, Err(PointsError::Config(_))), "{key}={value}");
        }
    }

    #[test]
    fn database_targets() {
        assert_eq!("memory".parse::<DatabaseTarget>().unwrap(), DatabaseTarget::Memory);
        assert_eq!(
            "sqlite:./points.db".parse::<DatabaseTarget>().unwrap(),
            DatabaseTarget::Sqlite("sqlite:./points.db".into())
        );
        assert!(matches!(
            "postgresql://localhost/points".parse::<DatabaseTarget>().unwrap(),
            DatabaseTarget::Postgres(_)
        ));
    }

    #[test]
    fn redaction() {
        assert_eq!(redact_url("wss://mainnet.infura.io/ws/v3/KEY"), "wss://mainnet.infura.io/…");
        assert_eq!(redact_url("http://127.0.0.1:8545"), "http://127.0.0.1:8545");
        assert_eq!(redact_url("postgres://u:p@h/db"), "postgres://h/…");
    }
}
