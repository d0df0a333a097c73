//! Configuration section types

use serde::Deserialize;

use crate::oracle::MedianPopulation;
use crate::telemetry::LogFormat;

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Publisher identity stamped on every entry
    pub name: String,
    /// Source tag for consensus entries
    pub source: String,
    /// Base URL of the publish API
    pub api_url: String,
    /// EIP-712 domain name
    pub domain_name: String,
    /// EIP-712 domain version
    pub domain_version: String,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PusherConfig {
    /// Seconds between fetch rounds
    pub fetch_interval_secs: u64,
    /// Seconds between aggregate-and-publish cycles
    pub push_interval_secs: u64,
    /// Quotes older than this are evicted
    pub window_max_age_secs: u64,
    pub window_max_quotes: usize,
    /// Deadline for one whole fetch round
    pub fetch_timeout_secs: u64,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
    /// Extra publish attempts on transport errors
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
    /// `all_quotes` or `latest_per_source`
    #[serde(default)]
    pub median_population: MedianPopulation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Adapter names, e.g. ["bybit", "kucoin"]
    pub enabled: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    pub id: String,
    pub decimals: u32,
    #[serde(default)]
    pub is_abstract: bool,
    pub starknet_address: Option<String>,
    pub ethereum_address: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairKind {
    #[default]
    Spot,
    Future,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub base: String,
    pub quote: String,
    /// Overrides the base currency's decimals
    pub decimals: Option<u32>,
    #[serde(default)]
    pub kind: PairKind,
    /// Unix seconds, futures only; absent or 0 for perpetuals
    pub expiry: Option<u64>,
}
