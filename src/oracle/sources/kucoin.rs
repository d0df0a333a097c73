//! KuCoin REST client
//!
//! Level-1 orderbook snapshot, spot only.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueryError;
use crate::oracle::hop::{usd_via, HopSpec};
use crate::oracle::sources::{get_json, http_client, parse_decimal, PriceSource, SourceQuote};
use crate::types::{Pair, SettlementKind};

const KUCOIN_REST_URL: &str = "https://api.kucoin.com/api/v1/market/orderbook/level1";

#[derive(Debug, Clone)]
pub struct KucoinClient {
    client: reqwest::Client,
    base_url: String,
}

impl KucoinClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self::with_base_url(KUCOIN_REST_URL, request_timeout)
    }

    pub fn with_base_url(base_url: &str, request_timeout: Duration) -> Self {
        Self {
            client: http_client(request_timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn format_url(&self, pair: &Pair) -> String {
        format!(
            "{}?symbol={}-{}",
            self.base_url,
            pair.base().id(),
            pair.quote().id()
        )
    }

    fn parse_level1(body: &Value) -> Result<SourceQuote, QueryError> {
        // Unknown symbols come back as 200 with `data: null`
        let data = match &body["data"] {
            Value::Null => return Err(QueryError::NotFound),
            data => data,
        };

        let price = parse_decimal(&data["price"])
            .ok_or_else(|| QueryError::Transient("missing price".to_string()))?;
        let timestamp = data["time"]
            .as_u64()
            .map(|ms| ms / 1000)
            .ok_or_else(|| QueryError::Transient("missing time".to_string()))?;

        Ok(SourceQuote {
            price,
            timestamp,
            volume: None,
        })
    }
}

#[async_trait]
impl PriceSource for KucoinClient {
    fn name(&self) -> &str {
        "KUCOIN"
    }

    fn hops(&self) -> HopSpec {
        usd_via("USDT", 6)
    }

    async fn query(&self, pair: &Pair, _kind: SettlementKind) -> Result<SourceQuote, QueryError> {
        let url = self.format_url(pair);
        tracing::debug!(source = "KUCOIN", pair = %pair, url = %url, "Querying level1");
        let body = get_json(&self.client, &url).await?;
        Self::parse_level1(&body)
    }
}
