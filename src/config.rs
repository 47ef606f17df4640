//! Configuration management for ln-gateway
//!
//! Configuration is loaded from a TOML file; every field has a default.
//!
//! # Example Configuration File
//!
//! ```toml
//! [node]
//! backend = "lnd"
//! network = "mainnet"
//!
//! [lnd]
//! rest_host = "127.0.0.1"
//! rest_port = 8080
//! tls_cert_path = "/home/lnd/.lnd/tls.cert"
//! macaroon_path = "/home/lnd/.lnd/data/chain/bitcoin/mainnet/admin.macaroon"
//!
//! [cln]
//! transport = "unix"
//! rpc_socket_path = "/home/cln/.lightning/bitcoin/lightning-rpc"
//!
//! [scheduler]
//! enable_forward_notifications = true
//! forward_poll_interval_secs = 10
//!
//! [api]
//! bind_address = "0.0.0.0:8081"
//! jwt_secret = "change-me"
//! ```

use crate::session::ProbeSettings;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend selection
    #[serde(default)]
    pub node: NodeConfig,

    /// LND connection
    #[serde(default)]
    pub lnd: LndConfig,

    /// Core Lightning connection
    #[serde(default)]
    pub cln: ClnConfig,

    /// External wallet lock; enables the lock-aware adapter when present
    #[serde(default)]
    pub lock: Option<LockConfig>,

    /// Initialization probe timing
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Pollers and listeners
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Lightning backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// LND
    #[default]
    Lnd,
    /// Core Lightning
    Cln,
}

/// Backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Which implementation runs behind the gateway
    #[serde(default)]
    pub backend: Backend,

    /// Network (mainnet, testnet, signet, regtest)
    #[serde(default = "default_network")]
    pub network: String,

    /// Timeout for regular backend calls in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            network: default_network(),
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}

fn default_network() -> String {
    "regtest".to_string()
}

fn default_rpc_timeout() -> u64 {
    30
}

/// LND REST connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LndConfig {
    /// REST host
    #[serde(default = "default_lnd_host")]
    pub rest_host: String,

    /// REST port
    #[serde(default = "default_lnd_port")]
    pub rest_port: u16,

    /// LND's self-signed TLS certificate (PEM)
    pub tls_cert_path: Option<PathBuf>,

    /// Macaroon file, sent hex encoded with every request
    pub macaroon_path: Option<PathBuf>,
}

impl Default for LndConfig {
    fn default() -> Self {
        Self {
            rest_host: default_lnd_host(),
            rest_port: default_lnd_port(),
            tls_cert_path: None,
            macaroon_path: None,
        }
    }
}

fn default_lnd_host() -> String {
    "127.0.0.1".to_string()
}

fn default_lnd_port() -> u16 {
    8080
}

impl LndConfig {
    /// Base URL of the REST proxy
    pub fn rest_url(&self) -> String {
        format!("https://{}:{}", self.rest_host, self.rest_port)
    }
}

/// How to reach Core Lightning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClnTransport {
    /// JSON-RPC over `lightning-rpc`
    #[default]
    Unix,
    /// clnrest
    Rest,
}

/// Core Lightning connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClnConfig {
    /// Transport
    #[serde(default)]
    pub transport: ClnTransport,

    /// Path of the `lightning-rpc` socket
    #[serde(default = "default_cln_socket")]
    pub rpc_socket_path: PathBuf,

    /// clnrest base URL
    #[serde(default = "default_cln_rest_url")]
    pub rest_url: String,

    /// Rune for clnrest
    pub rune: Option<String>,

    /// File holding the rune, used when `rune` is not set
    pub rune_path: Option<PathBuf>,

    /// clnrest TLS certificate (PEM)
    pub tls_cert_path: Option<PathBuf>,
}

impl Default for ClnConfig {
    fn default() -> Self {
        Self {
            transport: ClnTransport::default(),
            rpc_socket_path: default_cln_socket(),
            rest_url: default_cln_rest_url(),
            rune: None,
            rune_path: None,
            tls_cert_path: None,
        }
    }
}

fn default_cln_socket() -> PathBuf {
    dirs::home_dir()
        .map(|d| d.join(".lightning/bitcoin/lightning-rpc"))
        .unwrap_or_else(|| PathBuf::from("./lightning-rpc"))
}

fn default_cln_rest_url() -> String {
    "https://127.0.0.1:3010".to_string()
}

impl ClnConfig {
    /// The configured rune, read from `rune_path` if not given inline
    pub async fn resolve_rune(&self) -> anyhow::Result<String> {
        if let Some(rune) = &self.rune {
            return Ok(rune.clone());
        }
        let path = self
            .rune_path
            .as_ref()
            .context("Core Lightning REST transport needs `rune` or `rune_path`")?;
        let rune = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read rune {}", path.display()))?;
        Ok(rune.trim().to_string())
    }
}

/// External wallet lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// The wallet counts as locked while this file exists
    #[serde(default = "default_lock_flag_path")]
    pub lock_flag_path: PathBuf,

    /// Unlock command, program first; receives the password on stdin
    #[serde(default)]
    pub unlock_command: Vec<String>,

    /// How long to wait for the flag to clear after unlocking
    #[serde(default = "default_unlock_timeout")]
    pub unlock_timeout_secs: u64,

    /// Flag poll interval in milliseconds
    #[serde(default = "default_lock_poll")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_flag_path: default_lock_flag_path(),
            unlock_command: Vec::new(),
            unlock_timeout_secs: default_unlock_timeout(),
            poll_interval_ms: default_lock_poll(),
        }
    }
}

fn default_lock_flag_path() -> PathBuf {
    PathBuf::from("/var/run/ln-gateway/wallet.locked")
}

fn default_unlock_timeout() -> u64 {
    60
}

fn default_lock_poll() -> u64 {
    1000
}

impl LockConfig {
    /// Bound on the post-unlock wait
    pub fn unlock_timeout(&self) -> Duration {
        Duration::from_secs(self.unlock_timeout_secs)
    }

    /// Flag poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Initialization probe timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Delay between probes in milliseconds
    #[serde(default = "default_probe_retry")]
    pub retry_interval_ms: u64,

    /// Delay between probes after an unlock, in milliseconds
    #[serde(default = "default_probe_after_unlock")]
    pub after_unlock_interval_ms: u64,

    /// Upper bound for one probe call in seconds
    #[serde(default = "default_probe_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_probe_retry(),
            after_unlock_interval_ms: default_probe_after_unlock(),
            call_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_probe_retry() -> u64 {
    2000
}

fn default_probe_after_unlock() -> u64 {
    500
}

fn default_probe_timeout() -> u64 {
    10
}

/// Pollers and listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Node info poll interval in seconds
    #[serde(default = "default_info_interval")]
    pub info_interval_secs: u64,

    /// Wallet balance poll interval in seconds
    #[serde(default = "default_balance_interval")]
    pub balance_interval_secs: u64,

    /// Fee revenue poll interval in seconds
    #[serde(default = "default_fee_interval")]
    pub fee_revenue_interval_secs: u64,

    /// Delay of the refresh that follows a balance-changing operation
    #[serde(default = "default_balance_debounce")]
    pub balance_debounce_ms: u64,

    /// Publish successful forwards
    #[serde(default = "default_true")]
    pub enable_forward_notifications: bool,

    /// Forward list poll interval for backends without a forward stream
    #[serde(default = "default_forward_poll")]
    pub forward_poll_interval_secs: u64,

    /// Lowest accepted `forward_poll_interval_secs`
    #[serde(default = "default_min_forward_poll")]
    pub min_forward_poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            info_interval_secs: default_info_interval(),
            balance_interval_secs: default_balance_interval(),
            fee_revenue_interval_secs: default_fee_interval(),
            balance_debounce_ms: default_balance_debounce(),
            enable_forward_notifications: true,
            forward_poll_interval_secs: default_forward_poll(),
            min_forward_poll_interval_secs: default_min_forward_poll(),
        }
    }
}

fn default_info_interval() -> u64 {
    10
}

fn default_balance_interval() -> u64 {
    30
}

fn default_fee_interval() -> u64 {
    300
}

fn default_balance_debounce() -> u64 {
    2000
}

fn default_forward_poll() -> u64 {
    10
}

fn default_min_forward_poll() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl SchedulerConfig {
    /// Node info poll interval
    pub fn info_interval(&self) -> Duration {
        Duration::from_secs(self.info_interval_secs)
    }

    /// Balance poll interval
    pub fn balance_interval(&self) -> Duration {
        Duration::from_secs(self.balance_interval_secs)
    }

    /// Fee revenue poll interval
    pub fn fee_revenue_interval(&self) -> Duration {
        Duration::from_secs(self.fee_revenue_interval_secs)
    }

    /// Balance refresh delay
    pub fn balance_debounce(&self) -> Duration {
        Duration::from_millis(self.balance_debounce_ms)
    }

    /// Forward poll interval
    pub fn forward_poll_interval(&self) -> Duration {
        Duration::from_secs(self.forward_poll_interval_secs)
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// HS256 secret for bearer tokens; authentication is off when unset
    pub jwt_secret: Option<String>,

    /// SSE keep-alive interval in seconds
    #[serde(default = "default_sse_ping")]
    pub sse_ping_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
            jwt_secret: None,
            sse_ping_secs: default_sse_ping(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_sse_ping() -> u64 {
    15
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Timeout for regular backend calls
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.node.rpc_timeout_secs)
    }

    /// Probe loop timing
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            retry_interval: Duration::from_millis(self.probe.retry_interval_ms),
            after_unlock_interval: Duration::from_millis(self.probe.after_unlock_interval_ms),
            call_timeout: Duration::from_secs(self.probe.call_timeout_secs),
        }
    }

    /// Check if running on mainnet
    pub fn is_mainnet(&self) -> bool {
        self.node.network == "mainnet"
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let valid_networks = ["mainnet", "testnet", "signet", "regtest"];
        if !valid_networks.contains(&self.node.network.as_str()) {
            return Err(format!(
                "Invalid network: {}. Must be one of: {:?}",
                self.node.network, valid_networks
            ));
        }

        if self.node.backend == Backend::Lnd && self.lnd.rest_port == 0 {
            return Err("LND REST port cannot be 0".to_string());
        }

        if self.node.backend == Backend::Cln
            && self.cln.transport == ClnTransport::Rest
            && self.cln.rune.is_none()
            && self.cln.rune_path.is_none()
        {
            return Err("Core Lightning REST needs `rune` or `rune_path`".to_string());
        }

        if let Some(lock) = &self.lock {
            if lock.unlock_command.is_empty() {
                return Err("[lock] requires an unlock_command".to_string());
            }
            if lock.poll_interval_ms == 0 {
                return Err("[lock] poll_interval_ms cannot be 0".to_string());
            }
        }

        if self.probe.retry_interval_ms == 0 || self.probe.after_unlock_interval_ms == 0 {
            return Err("Probe intervals cannot be 0".to_string());
        }

        let s = &self.scheduler;
        for (name, secs) in [
            ("info_interval_secs", s.info_interval_secs),
            ("balance_interval_secs", s.balance_interval_secs),
            ("fee_revenue_interval_secs", s.fee_revenue_interval_secs),
            ("forward_poll_interval_secs", s.forward_poll_interval_secs),
        ] {
            if secs < 1 {
                return Err(format!("Scheduler interval {} must be at least 1s", name));
            }
        }

        if s.forward_poll_interval_secs < s.min_forward_poll_interval_secs {
            return Err(format!(
                "forward_poll_interval_secs ({}) is below the minimum of {}s",
                s.forward_poll_interval_secs, s.min_forward_poll_interval_secs
            ));
        }

        if self.api.sse_ping_secs == 0 {
            return Err("sse_ping_secs cannot be 0".to_string());
        }

        Ok(())
    }
}
