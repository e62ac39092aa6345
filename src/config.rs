//! Operator configuration.
//!
//! A single JSON file deserialized at startup. Every section has
//! working defaults; only the upstream node list (or a single
//! `upstream_url`) and the pool payout address are mandatory.
//! Validation failures refuse startup.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Base unit denomination (like satoshis for Bitcoin)
pub const COIN: u64 = 100_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub pool: PoolConfig,
    /// Convenience form: a single upstream URL with default tuning
    pub upstream_url: Option<String>,
    pub upstreams: Vec<UpstreamConfig>,
    pub upstream: UpstreamTuning,
    pub wallet: WalletConfig,
    pub pplns: PplnsConfig,
    pub unlocker: UnlockerConfig,
    pub payouts: PayoutsConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig { data_dir: "forgepool_data".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Address block templates pay out to (the pool wallet)
    pub address: String,
    /// Pool fee retained from each block reward, percent
    pub fee_percent: f64,
    /// Sliding share window used for hashrate and PPLNS, seconds
    pub hashrate_window_secs: u64,
    /// Block template refresh cadence, milliseconds
    pub job_refresh_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            address: String::new(),
            fee_percent: 1.0,
            hashrate_window_secs: 600,
            job_refresh_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_weight() -> u64 {
    1
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamTuning {
    pub health_check_interval_secs: u64,
    /// Consecutive failures before an upstream is marked unhealthy
    pub max_failures: u32,
    /// Consecutive successes before it is healthy again
    pub recovery_threshold: u32,
}

impl Default for UpstreamTuning {
    fn default() -> Self {
        UpstreamTuning { health_check_interval_secs: 5, max_failures: 3, recovery_threshold: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig { url: "http://127.0.0.1:8081/json_rpc".into(), timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PplnsConfig {
    /// Baseline window = window_factor × network difficulty
    pub window_factor: f64,
    /// Scale the window by the pool's share of the network hashrate
    pub dynamic: bool,
    pub min_window: u64,
    pub max_window: u64,
}

impl Default for PplnsConfig {
    fn default() -> Self {
        PplnsConfig { window_factor: 2.0, dynamic: false, min_window: 1, max_window: u64::MAX }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnlockerConfig {
    pub interval_secs: u64,
    pub immature_depth: u64,
    pub mature_depth: u64,
}

impl Default for UnlockerConfig {
    fn default() -> Self {
        UnlockerConfig { interval_secs: 60, immature_depth: 10, mature_depth: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PayoutsConfig {
    pub interval_secs: u64,
    /// Minimum confirmed balance before an address is paid, base units
    pub threshold: u64,
    pub max_addresses_per_tx: usize,
    /// Transfer fee deducted from each payout, percent
    pub tx_fee_percent: f64,
}

impl Default for PayoutsConfig {
    fn default() -> Self {
        PayoutsConfig {
            interval_secs: 3600,
            threshold: COIN / 10,
            max_addresses_per_tx: 100,
            tx_fee_percent: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub connection_limit: i64,
    /// Extra connection credits granted per valid share
    pub limit_jump: i64,
    pub malformed_limit: u64,
    /// Shares seen before the invalid-ratio check runs
    pub check_threshold: u64,
    /// Invalid-share percentage that earns a ban
    pub invalid_percent: u64,
    pub max_score: u32,
    pub score_reset_secs: u64,
    pub temp_ban_secs: u64,
    /// Window after startup during which connections are never limited
    pub grace_period_secs: u64,
    pub reset_interval_secs: u64,
    pub refresh_interval_secs: u64,
    /// OS packet-filter set to feed banned IPs into, if any
    pub ipset_name: Option<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            connection_limit: 30,
            limit_jump: 10,
            malformed_limit: 5,
            check_threshold: 100,
            invalid_percent: 50,
            max_score: 100,
            score_reset_secs: 60,
            temp_ban_secs: 300,
            grace_period_secs: 120,
            reset_interval_secs: 600,
            refresh_interval_secs: 120,
            ipset_name: None,
        }
    }
}

/// Load and validate a config file.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let mut config: Config = serde_json::from_str(&raw)?;
    normalize(&mut config)?;
    Ok(config)
}

/// Fold the single-URL convenience form into the upstream list and
/// check everything that would otherwise fail at 3am.
pub fn normalize(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(url) = config.upstream_url.take() {
        config.upstreams.push(UpstreamConfig {
            name: "default".into(),
            url,
            weight: default_weight(),
            timeout_ms: default_timeout_ms(),
        });
    }
    if config.upstreams.is_empty() {
        return Err(ConfigError::Invalid("no upstream nodes configured".into()));
    }
    if config.pool.address.is_empty() {
        return Err(ConfigError::Invalid("pool.address is required".into()));
    }
    if !(0.0..100.0).contains(&config.pool.fee_percent) {
        return Err(ConfigError::Invalid("pool.fee_percent must be in [0, 100)".into()));
    }
    if !(0.0..100.0).contains(&config.payouts.tx_fee_percent) {
        return Err(ConfigError::Invalid("payouts.tx_fee_percent must be in [0, 100)".into()));
    }
    if config.pool.job_refresh_ms == 0 {
        return Err(ConfigError::Invalid("pool.job_refresh_ms must be positive".into()));
    }
    if config.unlocker.mature_depth <= config.unlocker.immature_depth {
        return Err(ConfigError::Invalid(
            "unlocker.mature_depth must exceed immature_depth".into(),
        ));
    }
    if config.payouts.threshold == 0 || config.payouts.max_addresses_per_tx == 0 {
        return Err(ConfigError::Invalid("payouts.threshold and max_addresses_per_tx must be positive".into()));
    }
    let intervals = [
        ("upstream.health_check_interval_secs", config.upstream.health_check_interval_secs),
        ("unlocker.interval_secs", config.unlocker.interval_secs),
        ("payouts.interval_secs", config.payouts.interval_secs),
        ("policy.reset_interval_secs", config.policy.reset_interval_secs),
        ("policy.refresh_interval_secs", config.policy.refresh_interval_secs),
    ];
    for (name, value) in intervals {
        if value == 0 {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
    }
    Ok(())
}
