use alloy::primitives::{Address, ChainId};
use humantime_serde::Serde;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub db_dir: Option<PathBuf>,
    pub chain_id: ChainId,
    /// Endpoint the confirmed-event stream is opened against (ws, wss, http, https).
    pub stream_rpc: Url,
    /// Request/response endpoints used for contract reads.
    pub query_rpcs: Vec<Url>,
    #[serde(default = "default_query_rpc_cooldown")]
    pub query_rpc_cooldown: Serde<Duration>,
    pub contract_address: Address,
    pub contract_name: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Serde<Duration>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_backoff")]
    pub backoff: Serde<Duration>,
    /// Consecutive failed log queries before the operator is alerted. 0 disables.
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
    #[serde(default = "default_close_recheck_delay")]
    pub close_recheck_delay: Serde<Duration>,
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown: Serde<Duration>,
    pub alert: Option<AlertConfig>,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AlertConfig {
    pub webhook_url: Url,
    pub username: Option<String>,
}

fn default_query_rpc_cooldown() -> Serde<Duration> {
    Serde::from(Duration::from_secs(30))
}

fn default_poll_interval() -> Serde<Duration> {
    Serde::from(Duration::from_secs(5))
}

const fn default_confirmations() -> u64 {
    12
}

const fn default_chunk_size() -> u64 {
    2000
}

const fn default_concurrency() -> usize {
    4
}

fn default_backoff() -> Serde<Duration> {
    Serde::from(Duration::from_secs(2))
}

const fn default_failure_alert_threshold() -> u32 {
    5
}

fn default_close_recheck_delay() -> Serde<Duration> {
    Serde::from(Duration::from_secs(10))
}

fn default_alert_cooldown() -> Serde<Duration> {
    Serde::from(Duration::from_secs(60))
}
