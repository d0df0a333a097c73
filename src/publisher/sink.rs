//! Publish sinks
//!
//! Where a signed batch ends up: the HTTP publish API or an external chain
//! client.

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::transaction::eip712::TypedData;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::error::PublishError;
use crate::publisher::PublishBatch;

const PUBLISH_PATH: &str = "/v1/data/publish";
const PUBLISH_FUTURE_PATH: &str = "/v1/data/publish_future";

/// Delivery target for signed batches
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublishSink: Send + Sync {
    fn name(&self) -> &str;

    /// Submit one signed batch, returning the acknowledgement
    async fn submit(&self, batch: &PublishBatch) -> Result<Value, PublishError>;
}

/// REST client for the offchain publish API
pub struct HttpSink {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpSink {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, PublishError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key)
                .map_err(|e| PublishError::InvariantViolation(format!("invalid API key: {}", e)))?,
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn endpoint(&self, future: bool) -> String {
        let path = if future {
            PUBLISH_FUTURE_PATH
        } else {
            PUBLISH_PATH
        };
        format!("{}{}", self.base_url, path)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// `{signature: [r, s, v], entries: [...]}`
    pub fn body(batch: &PublishBatch) -> Value {
        json!({
            "signature": batch.signature(),
            "entries": batch.entries(),
        })
    }
}

#[async_trait]
impl PublishSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, batch: &PublishBatch) -> Result<Value, PublishError> {
        let url = self.endpoint(batch.is_future());
        tracing::debug!(url = %url, entries = batch.len(), "POST publish batch");

        let response = self
            .client
            .post(&url)
            .header("PRAGMA-TIMESTAMP", batch.timestamp().to_string())
            .header("PRAGMA-SIGNATURE-EXPIRATION", batch.expiration().to_string())
            .json(&Self::body(batch))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        // The batch is in; nothing past this point may look retryable
        let body = response
            .text()
            .await
            .map_err(|e| PublishError::InvalidAck(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| PublishError::InvalidAck(e.to_string()))
    }
}

/// Chain-side invocation; verification and nonces are the client's job
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn invoke(&self, typed: &TypedData, signature: &[String]) -> Result<Value, PublishError>;
}

/// Hands signed batches to a [`ChainClient`]
pub struct OnchainSink<C> {
    client: C,
}

impl<C: ChainClient> OnchainSink<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: ChainClient> PublishSink for OnchainSink<C> {
    fn name(&self) -> &str {
        "onchain"
    }

    async fn submit(&self, batch: &PublishBatch) -> Result<Value, PublishError> {
        self.client
            .invoke(batch.typed_data(), batch.signature())
            .await
    }
}
