//! Configuration management for the price pusher
//!
//! Loads from TOML/YAML files + environment variables via .env

mod types;

pub use types::*;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use ethers::types::Address;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::oracle::sources;
use crate::publisher::PublishDomain;
use crate::types::{Currency, Pair, TrackedPair};

pub const PRIVATE_KEY_ENV: &str = "PUBLISHER_PRIVATE_KEY";
pub const API_KEY_ENV: &str = "PRAGMA_API_KEY";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub publisher: PublisherConfig,
    pub pusher: PusherConfig,
    pub sources: SourcesConfig,
    pub logging: LoggingConfig,
    /// Added to (and overriding) the built-in currency table
    #[serde(default)]
    pub currencies: Vec<CurrencyConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>> {
    let builder = Config::builder()
        // Publisher defaults
        .set_default("publisher.name", "")?
        .set_default("publisher.source", crate::publisher::DEFAULT_SOURCE)?
        .set_default("publisher.api_url", "https://api.dev.pragma.build/node")?
        .set_default("publisher.domain_name", "Pragma")?
        .set_default("publisher.domain_version", "1")?
        // Pusher defaults
        .set_default("pusher.fetch_interval_secs", 10)?
        .set_default("pusher.push_interval_secs", 30)?
        .set_default("pusher.window_max_age_secs", 3600)?
        .set_default("pusher.window_max_quotes", 1024)?
        .set_default("pusher.fetch_timeout_secs", 8)?
        .set_default("pusher.request_timeout_secs", 5)?
        .set_default("pusher.max_retries", 2)?
        .set_default("pusher.retry_backoff_ms", 500)?
        .set_default("pusher.median_population", "all_quotes")?
        // Sources
        .set_default("sources.enabled", vec!["bybit", "kucoin"])?
        // Logging
        .set_default("logging.level", "info")?
        .set_default("logging.format", "pretty")?;
    Ok(builder)
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = with_defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PUSHER__*)
            .add_source(Environment::with_prefix("PUSHER").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Defaults overlaid with an inline TOML document
    pub fn from_toml(toml: &str) -> Result<Self> {
        with_defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "publisher={} source={} sources={:?} pairs={} fetch={}s push={}s max_age={}s",
            self.publisher.name,
            self.publisher.source,
            self.sources.enabled,
            self.pairs.len(),
            self.pusher.fetch_interval_secs,
            self.pusher.push_interval_secs,
            self.pusher.window_max_age_secs
        )
    }

    /// Reject configurations the pusher cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "publisher.name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.sources.enabled.is_empty() {
            return Err(ConfigError::Empty("source"));
        }
        if let Some(unknown) = self
            .sources
            .enabled
            .iter()
            .find(|name| !sources::SOURCE_NAMES.contains(&name.to_lowercase().as_str()))
        {
            return Err(ConfigError::UnknownSource(unknown.clone()));
        }

        let p = &self.pusher;
        for (field, value) in [
            ("pusher.fetch_interval_secs", p.fetch_interval_secs),
            ("pusher.push_interval_secs", p.push_interval_secs),
            ("pusher.window_max_age_secs", p.window_max_age_secs),
            ("pusher.fetch_timeout_secs", p.fetch_timeout_secs),
            ("pusher.request_timeout_secs", p.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if p.fetch_timeout_secs >= p.fetch_interval_secs {
            return Err(ConfigError::InvalidValue {
                field: "pusher.fetch_timeout_secs",
                reason: format!(
                    "must be shorter than the fetch interval ({}s)",
                    p.fetch_interval_secs
                ),
            });
        }
        if p.window_max_quotes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pusher.window_max_quotes",
                reason: "must be greater than zero".to_string(),
            });
        }

        self.tracked_pairs().map(|_| ())
    }

    /// Built-in currencies overlaid with the configured ones, keyed by id
    pub fn currency_table(&self) -> Result<HashMap<String, Currency>, ConfigError> {
        let mut table: HashMap<String, Currency> = builtin_currencies()
            .into_iter()
            .map(|c| (c.id().to_string(), c))
            .collect();

        for cfg in &self.currencies {
            let mut currency = Currency::new(&cfg.id, cfg.decimals, cfg.is_abstract);
            if let Some(address) = &cfg.starknet_address {
                currency = currency.with_starknet_address(address);
            }
            if let Some(address) = &cfg.ethereum_address {
                let parsed: Address = address.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "currencies.ethereum_address",
                    reason: format!("'{}' is not an address", address),
                })?;
                currency = currency.with_ethereum_address(parsed);
            }
            table.insert(currency.id().to_string(), currency);
        }
        Ok(table)
    }

    /// Resolve the configured pairs against the currency table
    pub fn tracked_pairs(&self) -> Result<Vec<TrackedPair>, ConfigError> {
        if self.pairs.is_empty() {
            return Err(ConfigError::Empty("pair"));
        }
        let table = self.currency_table()?;
        let lookup = |id: &str| {
            table
                .get(&id.to_uppercase())
                .cloned()
                .ok_or_else(|| ConfigError::UnknownCurrency(id.to_string()))
        };

        self.pairs
            .iter()
            .map(|cfg| {
                let mut pair = Pair::new(lookup(&cfg.base)?, lookup(&cfg.quote)?);
                if let Some(decimals) = cfg.decimals {
                    pair = pair.with_decimals(decimals);
                }
                match (cfg.kind, cfg.expiry) {
                    (PairKind::Spot, None) => Ok(TrackedPair::spot(pair)),
                    (PairKind::Spot, Some(_)) => Err(ConfigError::InvalidValue {
                        field: "pairs.expiry",
                        reason: format!("spot pair {} cannot have an expiry", pair),
                    }),
                    (PairKind::Future, expiry) => {
                        Ok(TrackedPair::future(pair, expiry.unwrap_or(0)))
                    }
                }
            })
            .collect()
    }

    pub fn domain(&self) -> PublishDomain {
        PublishDomain {
            name: self.publisher.domain_name.clone(),
            version: self.publisher.domain_version.clone(),
            chain_id: self.publisher.chain_id,
        }
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.pusher.fetch_interval_secs)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.pusher.push_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.pusher.fetch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.pusher.request_timeout_secs)
    }

    /// Signer key, from the environment only
    pub fn private_key() -> Option<String> {
        read_secret(PRIVATE_KEY_ENV)
    }

    /// Publish API key, from the environment only
    pub fn api_key() -> Option<String> {
        read_secret(API_KEY_ENV)
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

fn read_secret(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn builtin_currencies() -> Vec<Currency> {
    vec![
        Currency::new("BTC", 8, false),
        Currency::new("ETH", 18, false),
        Currency::new("SOL", 9, false),
        Currency::new("USD", 8, true),
        Currency::new("EUR", 8, true),
        Currency::new("USDT", 6, false),
        Currency::new("USDC", 6, false),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MedianPopulation;
    use crate::types::SettlementKind;
    use tokio_test::{assert_err, assert_ok};

    const BASIC: &str = r#"
        [publisher]
        name = "TEST_PUBLISHER"

        [[pairs]]
        base = "BTC"
        quote = "USD"

        [[pairs]]
        base = "eth"
        quote = "usd"
        decimals = 8

        [[pairs]]
        base = "BTC"
        quote = "USD"
        kind = "future"
    "#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = AppConfig::from_toml(BASIC).unwrap();
        assert_eq!(config.publisher.source, "AGGREGATED");
        assert_eq!(config.publisher.domain_name, "Pragma");
        assert_eq!(config.pusher.window_max_age_secs, 3600);
        assert_eq!(config.sources.enabled, vec!["bybit", "kucoin"]);
        assert_eq!(config.pusher.median_population, MedianPopulation::AllQuotes);
        assert_ok!(config.validate());
    }

    #[test]
    fn median_population_is_configurable() {
        let toml = format!("{}\n[pusher]\nmedian_population = \"latest_per_source\"\n", BASIC);
        let config = AppConfig::from_toml(&toml).unwrap();
        assert_eq!(
            config.pusher.median_population,
            MedianPopulation::LatestPerSource
        );
    }

    #[test]
    fn pairs_resolve_against_currency_table() {
        let config = AppConfig::from_toml(BASIC).unwrap();
        let pairs = assert_ok!(config.tracked_pairs());
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].pair.id(), "BTC/USD");
        assert_eq!(pairs[1].pair.decimals(), 8);
        assert_eq!(pairs[2].kind, SettlementKind::Future { expiry: 0 });
    }

    #[test]
    fn empty_pair_list_is_rejected() {
        let config = AppConfig::from_toml("[publisher]\nname = \"P\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Empty("pair"))));
    }

    #[test]
    fn empty_source_list_is_rejected() {
        let toml = format!("{}\n[sources]\nenabled = []\n", BASIC);
        let config = AppConfig::from_toml(&toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Empty("source"))));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let toml = format!("{}\n[pusher]\npush_interval_secs = 0\n", BASIC);
        let config = AppConfig::from_toml(&toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "pusher.push_interval_secs",
                ..
            })
        ));
    }

    #[test]
    fn fetch_timeout_must_be_shorter_than_interval() {
        let toml = format!(
            "{}\n[pusher]\nfetch_interval_secs = 10\nfetch_timeout_secs = 10\n",
            BASIC
        );
        let config = AppConfig::from_toml(&toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "pusher.fetch_timeout_secs",
                ..
            })
        ));

        let toml = format!(
            "{}\n[pusher]\nfetch_interval_secs = 10\nfetch_timeout_secs = 9\n",
            BASIC
        );
        let config = AppConfig::from_toml(&toml).unwrap();
        assert_ok!(config.validate());
    }

    #[test]
    fn unknown_currency_and_source_are_reported() {
        let toml = r#"
            [publisher]
            name = "P"
            [[pairs]]
            base = "DOGE"
            quote = "USD"
        "#;
        let config = AppConfig::from_toml(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownCurrency(id)) if id == "DOGE"
        ));

        let toml = format!("{}\n[sources]\nenabled = [\"nowhere\"]\n", BASIC);
        let config = AppConfig::from_toml(&toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownSource(_))
        ));
    }

    #[test]
    fn configured_currencies_extend_the_table() {
        let toml = r#"
            [publisher]
            name = "P"
            [[currencies]]
            id = "DOGE"
            decimals = 8
            starknet_address = "0x1234"
            ethereum_address = "0x4206931337dc273a630d328da6441786bfad668f"
            [[pairs]]
            base = "DOGE"
            quote = "USD"
        "#;
        let config = AppConfig::from_toml(toml).unwrap();
        let table = config.currency_table().unwrap();
        assert!(table["DOGE"].ethereum_address().is_some());
        assert_eq!(table["DOGE"].starknet_address(), Some("0x1234"));
        assert_ok!(config.validate());
    }

    #[test]
    fn spot_pair_with_expiry_is_rejected() {
        let toml = r#"
            [publisher]
            name = "P"
            [[pairs]]
            base = "BTC"
            quote = "USD"
            expiry = 1735000000
        "#;
        let config = AppConfig::from_toml(toml).unwrap();
        assert_err!(config.tracked_pairs());
    }

    #[test]
    fn digest_has_no_secrets() {
        let config = AppConfig::from_toml(BASIC).unwrap();
        let digest = config.digest();
        assert!(digest.contains("publisher=TEST_PUBLISHER"));
        assert!(digest.contains("pairs=3"));
        assert!(!digest.to_lowercase().contains("key"));
    }
}
