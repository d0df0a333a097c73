//! Price source implementations (Bybit, KuCoin)

mod bybit;
mod kucoin;

pub use bybit::BybitClient;
pub use kucoin::KucoinClient;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;

use crate::error::QueryError;
use crate::oracle::hop::HopSpec;
use crate::types::{Currency, Pair, SettlementKind};

/// What a source answers for one pair, before scaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuote {
    pub price: Decimal,
    /// Seconds
    pub timestamp: u64,
    pub volume: Option<Decimal>,
}

/// Capability contract every price source implements
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Source identifier stamped on every quote (e.g. "BYBIT")
    fn name(&self) -> &str;

    /// Currencies this source lists under another name
    fn hops(&self) -> HopSpec {
        HopSpec::default()
    }

    fn supports(&self, kind: SettlementKind) -> bool {
        kind == SettlementKind::Spot
    }

    /// Query one (possibly hop-substituted) pair
    async fn query(&self, pair: &Pair, kind: SettlementKind) -> Result<SourceQuote, QueryError>;

    /// Price of `from` in its stand-in `to`, looked up once per round.
    /// `None` means substituted answers are taken at face value.
    async fn hop_rate(&self, _from: &Currency, _to: &Currency) -> Result<Option<Decimal>, QueryError> {
        Ok(None)
    }
}

/// Names accepted by [`from_name`]
pub const SOURCE_NAMES: &[&str] = &["bybit", "kucoin"];

/// Build a source by its configured name
pub fn from_name(name: &str, request_timeout: Duration) -> Option<Box<dyn PriceSource>> {
    match name.to_lowercase().as_str() {
        "bybit" => Some(Box::new(BybitClient::new(request_timeout))),
        "kucoin" => Some(Box::new(KucoinClient::new(request_timeout))),
        _ => None,
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to build tuned HTTP client, using defaults");
            reqwest::Client::new()
        })
}

/// GET a JSON body, mapping 404 to `NotFound` and everything else to `Transient`
pub(crate) async fn get_json(
    client: &reqwest::Client,
    url: &str,
) -> Result<serde_json::Value, QueryError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| QueryError::Transient(e.to_string()))?;

    match response.status() {
        StatusCode::NOT_FOUND => Err(QueryError::NotFound),
        status if !status.is_success() => {
            Err(QueryError::Transient(format!("HTTP status {}", status)))
        }
        _ => response
            .json()
            .await
            .map_err(|e| QueryError::Transient(format!("invalid JSON body: {}", e))),
    }
}

pub(crate) fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn parse_decimal_accepts_strings_and_numbers() {
        assert_eq!(parse_decimal(&json!("42.5")), Some(dec!(42.5)));
        assert_eq!(parse_decimal(&json!(7)), Some(dec!(7)));
        assert_eq!(parse_decimal(&json!(null)), None);
        assert_eq!(parse_decimal(&json!("abc")), None);
    }

    #[test]
    fn from_name_is_case_insensitive() {
        let timeout = Duration::from_secs(5);
        assert_eq!(from_name("Bybit", timeout).unwrap().name(), "BYBIT");
        assert_eq!(from_name("kucoin", timeout).unwrap().name(), "KUCOIN");
        assert!(from_name("nowhere", timeout).is_none());
    }
}
