//! Bybit REST client
//!
//! Reads best bid/ask from the V5 tickers endpoint, spot and linear perpetuals.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::QueryError;
use crate::oracle::hop::{usd_via, HopSpec};
use crate::oracle::sources::{
    get_json, http_client, now_secs, parse_decimal, PriceSource, SourceQuote,
};
use crate::types::{Currency, Pair, SettlementKind};

const BYBIT_REST_URL: &str = "https://api.bybit.com/v5/market/tickers";

/// Bybit answers 200 with this code for unknown symbols
const UNKNOWN_SYMBOL: i64 = 10001;

/// Book read for the USDT per USD rate; USDC stands in for USD
const STABLE_BASE: &str = "USDC";
const STABLE_QUOTE: &str = "USDT";

#[derive(Debug, Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
}

impl BybitClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self::with_base_url(BYBIT_REST_URL, request_timeout)
    }

    pub fn with_base_url(base_url: &str, request_timeout: Duration) -> Self {
        Self {
            client: http_client(request_timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn format_url(&self, pair: &Pair, kind: SettlementKind) -> String {
        let category = if kind.is_future() { "linear" } else { "spot" };
        format!(
            "{}?category={}&symbol={}{}",
            self.base_url,
            category,
            pair.base().id(),
            pair.quote().id()
        )
    }

    fn stable_pair() -> Pair {
        Pair::new(
            Currency::new(STABLE_BASE, 6, false),
            Currency::new(STABLE_QUOTE, 6, false),
        )
    }

    fn parse_ticker(body: &Value) -> Result<SourceQuote, QueryError> {
        let code = body["retCode"].as_i64().unwrap_or_default();
        if code == UNKNOWN_SYMBOL {
            return Err(QueryError::NotFound);
        }
        if code != 0 {
            return Err(QueryError::Transient(format!(
                "Bybit retCode {}: {}",
                code,
                body["retMsg"].as_str().unwrap_or_default()
            )));
        }

        let ticker = body["result"]["list"]
            .get(0)
            .ok_or(QueryError::NotFound)?;
        let bid = parse_decimal(&ticker["bid1Price"])
            .ok_or_else(|| QueryError::Transient("missing bid1Price".to_string()))?;
        let ask = parse_decimal(&ticker["ask1Price"])
            .ok_or_else(|| QueryError::Transient("missing ask1Price".to_string()))?;

        let timestamp = body["time"]
            .as_u64()
            .map(|ms| ms / 1000)
            .unwrap_or_else(now_secs);

        Ok(SourceQuote {
            price: (bid + ask) / Decimal::TWO,
            timestamp,
            volume: parse_decimal(&ticker["volume24h"]),
        })
    }
}

#[async_trait]
impl PriceSource for BybitClient {
    fn name(&self) -> &str {
        "BYBIT"
    }

    fn hops(&self) -> HopSpec {
        usd_via("USDT", 6)
    }

    fn supports(&self, kind: SettlementKind) -> bool {
        // Dated futures use per-expiry symbols we do not map
        matches!(
            kind,
            SettlementKind::Spot | SettlementKind::Future { expiry: 0 }
        )
    }

    async fn query(&self, pair: &Pair, kind: SettlementKind) -> Result<SourceQuote, QueryError> {
        let url = self.format_url(pair, kind);
        tracing::debug!(source = "BYBIT", pair = %pair, url = %url, "Querying ticker");
        let body = get_json(&self.client, &url).await?;
        Self::parse_ticker(&body)
    }

    /// USD pairs are read off USDT books, so their mid price is divided by
    /// the USDC/USDT mid each round
    async fn hop_rate(&self, from: &Currency, to: &Currency) -> Result<Option<Decimal>, QueryError> {
        if from.id() != "USD" || to.id() != STABLE_QUOTE {
            return Ok(None);
        }
        let url = self.format_url(&Self::stable_pair(), SettlementKind::Spot);
        let body = get_json(&self.client, &url).await?;
        let rate = Self::parse_ticker(&body)?.price;
        tracing::debug!(source = "BYBIT", rate = %rate, "USDT per USD");
        Ok(Some(rate))
    }
}
