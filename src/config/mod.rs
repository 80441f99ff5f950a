use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use serde::Deserialize;
use url::Url;

use crate::chain::Address;

#[derive(Debug, clap::Parser)]
struct Args {
    #[clap(long, default_value = "sbt-rewards.toml", env = "SBT_REWARDS_CONFIG")]
    config: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
    pub db: DbConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub settlement: SettlementConfig,

    pub rewards: RewardsConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub http: Option<HttpConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ChainConfig {
    pub endpoint: Url,

    /// Name of the env variable holding the API key, if any
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_chain_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl ChainConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct WalletConfig {
    /// Base URL of the signing service
    pub endpoint: Url,

    #[serde(default = "default_wallet_token_env")]
    pub token_env: String,

    #[serde(default = "default_wallet_timeout")]
    pub timeout_secs: u64,
}

impl WalletConfig {
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DbConfig {
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Deserialize, Clone, Debug)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_queue_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,

    #[serde(default = "default_retry_cap")]
    pub retry_cap_secs: u64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    #[serde(default)]
    pub weights: PriorityWeights,
}

/// Relative share of claims given to each priority class
#[derive(Deserialize, Clone, Copy, Debug)]
pub struct PriorityWeights {
    pub critical: u32,
    pub urgent: u32,
    pub normal: u32,
    pub low: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ScannerConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_max_traversal_depth")]
    pub max_traversal_depth: usize,

    #[serde(default = "default_scan_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SettlementConfig {
    /// Pending approved rewards that trigger a mint right away
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: i64,

    /// Age of the oldest pending approved reward that triggers a mint
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// nanotons forwarded to each minted item
    #[serde(default = "default_forward_amount")]
    pub forward_amount: u64,

    /// nanotons attached per entry to the mint message
    #[serde(default = "default_attach_amount")]
    pub attach_amount: u64,

    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RewardsConfig {
    /// Collection that receives every accrued achievement
    pub collection: Address,

    /// Host serving the platform's own achievement metadata
    pub platform_domain: String,

    /// Content key granted once a user links an external account
    pub linked_account_content_ref: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_timeout")]
    pub timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Config {
    pub fn read() -> Result<Self> {
        let args = Args::parse();

        Self::read_from(args.config.as_path())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Delay before the next attempt of a task that already failed `retried` times
    pub fn backoff(&self, retried: u32) -> Duration {
        let factor = 1u64.checked_shl(retried).unwrap_or(u64::MAX);
        let secs = self
            .retry_base_secs
            .saturating_mul(factor)
            .min(self.retry_cap_secs);

        Duration::from_secs(secs)
    }
}

impl ScannerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

impl SettlementConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl MetadataConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_queue_poll_interval(),
            task_timeout_secs: default_task_timeout(),
            retry_base_secs: default_retry_base(),
            retry_cap_secs: default_retry_cap(),
            maintenance_interval_secs: default_maintenance_interval(),
            weights: PriorityWeights::default(),
        }
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            critical: 4,
            urgent: 3,
            normal: 2,
            low: 1,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_traversal_depth: default_max_traversal_depth(),
            retry_delay_secs: default_scan_retry_delay(),
            watchdog_interval_secs: default_watchdog_interval(),
            stall_timeout_secs: default_stall_timeout(),
            restart_delay_secs: default_restart_delay(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            batch_threshold: default_batch_threshold(),
            max_age_secs: default_max_age(),
            forward_amount: default_forward_amount(),
            attach_amount: default_attach_amount(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_metadata_timeout(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_chain_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_wallet_token_env() -> String {
    "SBT_REWARDS_WALLET_TOKEN".to_owned()
}

fn default_wallet_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    16
}

fn default_concurrency() -> usize {
    10
}

fn default_queue_poll_interval() -> u64 {
    500
}

fn default_task_timeout() -> u64 {
    120
}

fn default_retry_base() -> u64 {
    5
}

fn default_retry_cap() -> u64 {
    600
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_page_size() -> u32 {
    100
}

fn default_max_traversal_depth() -> usize {
    256
}

fn default_scan_retry_delay() -> u64 {
    10
}

fn default_watchdog_interval() -> u64 {
    60
}

fn default_stall_timeout() -> u64 {
    120
}

fn default_restart_delay() -> u64 {
    10
}

fn default_batch_threshold() -> i64 {
    20
}

fn default_max_age() -> u64 {
    3600
}

fn default_forward_amount() -> u64 {
    40_000_000
}

fn default_attach_amount() -> u64 {
    60_000_000
}

fn default_lease_ttl() -> u64 {
    300
}

fn default_metadata_timeout() -> u64 {
    3000
}

fn default_http_port() -> u16 {
    9500
}
