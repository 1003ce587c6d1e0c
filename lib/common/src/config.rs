//! Configuration for the coordinator and its clients, layered from an
//! optional TOML file and `KEYSTONE`-prefixed environment variables.

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use getset::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

/// Lower bound a caller-supplied global timeout is clamped to.
pub const MIN_TIMEOUT_MS: u64 = 1_000;

/// Upper bound a caller-supplied global timeout is clamped to.
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// Global timeout applied when the caller passes none (or zero).
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Upper bound for a branch-level timeout.
pub const MAX_BRANCH_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    #[builder(default = default_host())]
    pub host: String,
    #[serde(default = "default_port")]
    #[builder(default = default_port())]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8091
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct TransactionConfig {
    #[serde(default = "default_tx_timeout")]
    #[builder(default = default_tx_timeout())]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout")]
    #[builder(default = default_max_timeout())]
    pub max_timeout_ms: u64,
}

fn default_tx_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_timeout() -> u64 {
    MAX_TIMEOUT_MS
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct BranchConfig {
    #[serde(default = "default_branch_timeout")]
    #[builder(default = default_branch_timeout())]
    pub timeout_ms: u64,
}

fn default_branch_timeout() -> u64 {
    30_000
}

impl Default for BranchConfig {
    fn default() -> Self {
        BranchConfig::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout")]
    #[builder(default = default_lock_timeout())]
    pub timeout_ms: u64,
    #[serde(default = "default_lock_retry_interval")]
    #[builder(default = default_lock_retry_interval())]
    pub retry_interval_ms: u64,
    #[serde(default = "default_lock_max_retries")]
    #[builder(default = default_lock_max_retries())]
    pub max_retries: u32,
}

fn default_lock_timeout() -> u64 {
    10_000
}

fn default_lock_retry_interval() -> u64 {
    10
}

fn default_lock_max_retries() -> u32 {
    30
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig::builder().build()
    }
}

/// Phase-2 dispatch retry tuning. Attempt ceilings are per resource family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial")]
    #[builder(default = default_retry_initial())]
    pub initial_interval_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    #[builder(default = default_retry_multiplier())]
    pub multiplier: f64,
    #[serde(default = "default_retry_max_interval")]
    #[builder(default = default_retry_max_interval())]
    pub max_interval_ms: u64,
    #[serde(default)]
    #[builder(default)]
    pub max_attempts: MaxAttempts,
}

fn default_retry_initial() -> u64 {
    1_000
}

fn default_retry_multiplier() -> f64 {
    1.5
}

fn default_retry_max_interval() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct MaxAttempts {
    #[serde(default = "default_attempts_five")]
    #[builder(default = default_attempts_five())]
    pub at: u32,
    #[serde(default = "default_attempts_five")]
    #[builder(default = default_attempts_five())]
    pub tcc: u32,
    #[serde(default = "default_attempts_three")]
    #[builder(default = default_attempts_three())]
    pub http: u32,
    #[serde(default = "default_attempts_three")]
    #[builder(default = default_attempts_three())]
    pub mq: u32,
    #[serde(default = "default_attempts_three")]
    #[builder(default = default_attempts_three())]
    pub xa: u32,
}

fn default_attempts_five() -> u32 {
    5
}

fn default_attempts_three() -> u32 {
    3
}

impl Default for MaxAttempts {
    fn default() -> Self {
        MaxAttempts::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct ScanConfig {
    #[serde(default = "default_scan_interval")]
    #[builder(default = default_scan_interval())]
    pub interval_ms: u64,
}

fn default_scan_interval() -> u64 {
    60_000
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct RpcConfig {
    /// Wall-clock budget of one request/response exchange before the pending
    /// slot expires with a timeout.
    #[serde(default = "default_rpc_timeout")]
    #[builder(default = default_rpc_timeout())]
    pub request_timeout_ms: u64,
}

fn default_rpc_timeout() -> u64 {
    5_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct RetentionConfig {
    /// How long terminal records stay queryable before the scanner purges
    /// them.
    #[serde(default = "default_retention_grace")]
    #[builder(default = default_retention_grace())]
    pub grace_ms: u64,
}

fn default_retention_grace() -> u64 {
    86_400_000
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig::builder().build()
    }
}

/// The whole tunable surface of a coordinator process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct TxConfig {
    #[serde(default)]
    #[builder(default)]
    pub server: ServerConfig,
    #[serde(default)]
    #[builder(default)]
    pub tx: TransactionConfig,
    #[serde(default)]
    #[builder(default)]
    pub branch: BranchConfig,
    #[serde(default)]
    #[builder(default)]
    pub lock: LockConfig,
    #[serde(default)]
    #[builder(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    #[builder(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    #[builder(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    #[builder(default)]
    pub retention: RetentionConfig,
    #[serde(default = "default_failover")]
    #[builder(default = default_failover())]
    pub failover_enabled: bool,
}

fn default_failover() -> bool {
    true
}

impl Default for TxConfig {
    fn default() -> Self {
        TxConfig::builder().build()
    }
}

impl TxConfig {
    /// Load configuration from an optional TOML file layered with
    /// environment variables (`KEYSTONE__SERVER__PORT=9091` style).
    pub fn load(file_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::<config::builder::DefaultState>::default();
        if let Some(path) = file_path {
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(false));
        }
        let cfg: Config = builder
            .add_source(
                Environment::with_prefix("KEYSTONE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        cfg.try_deserialize::<TxConfig>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The caller's timeout is authoritative, clamped into
    /// [`MIN_TIMEOUT_MS`, `max_timeout_ms`]; zero means "use the default".
    pub fn clamp_global_timeout(&self, requested_ms: u64) -> u64 {
        let requested = if requested_ms == 0 {
            self.tx.default_timeout_ms
        } else {
            requested_ms
        };
        requested.clamp(MIN_TIMEOUT_MS, self.tx.max_timeout_ms)
    }

    pub fn clamp_branch_timeout(&self, requested_ms: u64) -> u64 {
        let requested = if requested_ms == 0 {
            self.branch.timeout_ms
        } else {
            requested_ms
        };
        requested.clamp(MIN_TIMEOUT_MS, MAX_BRANCH_TIMEOUT_MS)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_keys() {
        let cfg = TxConfig::default();
        assert_eq!(cfg.server.port, 8091);
        assert_eq!(cfg.tx.default_timeout_ms, 60_000);
        assert_eq!(cfg.tx.max_timeout_ms, 300_000);
        assert_eq!(cfg.branch.timeout_ms, 30_000);
        assert_eq!(cfg.lock.retry_interval_ms, 10);
        assert_eq!(cfg.lock.max_retries, 30);
        assert_eq!(cfg.retry.multiplier, 1.5);
        assert_eq!(cfg.retry.max_attempts.at, 5);
        assert_eq!(cfg.retry.max_attempts.http, 3);
        assert_eq!(cfg.scan.interval_ms, 60_000);
        assert_eq!(cfg.rpc.request_timeout_ms, 5_000);
        assert!(cfg.failover_enabled);
    }

    #[test]
    fn timeouts_snap_into_bounds() {
        let cfg = TxConfig::default();
        assert_eq!(cfg.clamp_global_timeout(0), 60_000);
        assert_eq!(cfg.clamp_global_timeout(10), 1_000);
        assert_eq!(cfg.clamp_global_timeout(10_000), 10_000);
        assert_eq!(cfg.clamp_global_timeout(900_000), 300_000);
        assert_eq!(cfg.clamp_branch_timeout(0), 30_000);
        assert_eq!(cfg.clamp_branch_timeout(600_000), 300_000);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
            [server]
            port = 9191

            [lock]
            max_retries = 5
            "#
        )
        .unwrap();
        let cfg = TxConfig::load(temp_file.path().to_str()).unwrap();
        assert_eq!(cfg.server.port, 9191);
        assert_eq!(cfg.lock.max_retries, 5);
        assert_eq!(cfg.tx.default_timeout_ms, 60_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = TxConfig::load(Some("/nonexistent/keystone.toml")).unwrap();
        assert_eq!(cfg, TxConfig::default());
    }
}
