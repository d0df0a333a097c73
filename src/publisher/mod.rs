//! Publisher - Signs consensus entries and ships them to a sink
//!
//! Entries are split by settlement kind. Each non-empty partition becomes
//! one [`PublishBatch`], signed over an EIP-712 `Request` and submitted on
//! its own; the two partitions run concurrently and report independently.

pub mod signing;
pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use ethers::types::transaction::eip712::TypedData;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::error::PublishError;
use crate::types::ConsensusEntry;

pub use signing::{PublishDomain, PublishSigner, WalletSigner};
pub use sink::{ChainClient, HttpSink, OnchainSink, PublishSink};

/// Signature validity window (24h)
pub const SIGNATURE_TTL_SECS: u64 = 24 * 3600;

pub const DEFAULT_SOURCE: &str = "AGGREGATED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryBase {
    pub publisher: String,
    pub source: String,
    pub timestamp: u64,
}

/// Wire form of one entry, shared by the HTTP body and the typed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerializedEntry {
    pub base: EntryBase,
    pub pair_id: String,
    /// Decimal string, u128 does not fit a JSON number
    pub price: String,
    pub volume: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp: Option<u64>,
}

/// Entries of a single settlement kind, with the request that covers them
#[derive(Debug, Clone)]
pub struct PublishBatch {
    future: bool,
    entries: Vec<SerializedEntry>,
    typed_data: TypedData,
    signature: Vec<String>,
    timestamp: u64,
    expiration: u64,
}

impl PublishBatch {
    /// Build an unsigned batch. Every entry must match `future`.
    pub fn build(
        future: bool,
        entries: &[ConsensusEntry],
        publisher: &str,
        source: &str,
        domain: &PublishDomain,
        now: u64,
    ) -> Result<Self, PublishError> {
        if entries.is_empty() {
            return Err(PublishError::InvariantViolation(
                "publish batch has no entries".to_string(),
            ));
        }

        let serialized = entries
            .iter()
            .map(|entry| {
                if entry.kind.is_future() != future {
                    return Err(PublishError::InvariantViolation(format!(
                        "{} entry {} in a {} batch",
                        entry.kind,
                        entry.pair_id,
                        if future { "future" } else { "spot" }
                    )));
                }
                if entry.pair_id.is_empty() {
                    return Err(PublishError::InvariantViolation(
                        "entry without pair id".to_string(),
                    ));
                }
                Ok(SerializedEntry {
                    base: EntryBase {
                        publisher: publisher.to_string(),
                        source: source.to_string(),
                        timestamp: entry.timestamp,
                    },
                    pair_id: entry.pair_id.clone(),
                    price: entry.price.to_string(),
                    volume: entry.volume.to_string(),
                    expiration_timestamp: entry.kind.expiry(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let message = serde_json::to_value(&serialized)
            .map_err(|e| PublishError::InvariantViolation(e.to_string()))?;

        Ok(Self {
            future,
            typed_data: signing::request_typed_data(domain, future, message),
            entries: serialized,
            signature: Vec::new(),
            timestamp: now,
            expiration: now + SIGNATURE_TTL_SECS,
        })
    }

    pub fn is_future(&self) -> bool {
        self.future
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SerializedEntry] {
        &self.entries
    }

    pub fn typed_data(&self) -> &TypedData {
        &self.typed_data
    }

    /// `[r, s, v]`, empty until signed
    pub fn signature(&self) -> &[String] {
        &self.signature
    }

    pub(crate) fn set_signature(&mut self, signature: Vec<String>) {
        self.signature = signature;
    }

    /// Signing time, seconds
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn expiration(&self) -> u64 {
        self.expiration
    }
}

/// Transport retry policy: linear backoff with up to 20% jitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: usize) -> Duration {
        let base_ms = (self.backoff.as_millis() as u64).saturating_mul(attempt as u64);
        let jitter_cap = base_ms / 5;
        let jitter_ms = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        Duration::from_millis(base_ms.saturating_add(jitter_ms))
    }
}

/// Result of one partition
#[derive(Debug)]
pub struct PartitionOutcome {
    pub entries: usize,
    pub result: Result<Value, PublishError>,
}

/// Per-kind results of one publish call; `None` when a kind had no entries
#[derive(Debug, Default)]
pub struct PublishOutcome {
    pub spot: Option<PartitionOutcome>,
    pub future: Option<PartitionOutcome>,
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        self.partitions().all(|(_, p)| p.result.is_ok())
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&'static str, &PartitionOutcome)> {
        [("spot", self.spot.as_ref()), ("future", self.future.as_ref())]
            .into_iter()
            .filter_map(|(kind, p)| p.map(|p| (kind, p)))
    }
}

pub struct Publisher {
    signer: Option<Arc<dyn PublishSigner>>,
    sink: Arc<dyn PublishSink>,
    publisher: String,
    source: String,
    domain: PublishDomain,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(sink: Arc<dyn PublishSink>, publisher: impl Into<String>) -> Self {
        Self {
            signer: None,
            sink,
            publisher: publisher.into(),
            source: DEFAULT_SOURCE.to_string(),
            domain: PublishDomain::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn PublishSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_domain(mut self, domain: PublishDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    pub async fn publish(&self, entries: &[ConsensusEntry]) -> Result<PublishOutcome, PublishError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.publish_at(entries, now).await
    }

    /// Split, sign and submit. A missing signer or a malformed partition
    /// fails the whole call before anything is signed.
    pub async fn publish_at(
        &self,
        entries: &[ConsensusEntry],
        now: u64,
    ) -> Result<PublishOutcome, PublishError> {
        let signer = self.signer.as_ref().ok_or(PublishError::SigningUnavailable)?;

        let (future, spot): (Vec<ConsensusEntry>, Vec<ConsensusEntry>) =
            entries.iter().cloned().partition(|e| e.kind.is_future());

        let spot_batch = self.batch(false, &spot, now)?;
        let future_batch = self.batch(true, &future, now)?;

        let (spot, future) = tokio::join!(
            self.sign_and_submit(&**signer, spot_batch),
            self.sign_and_submit(&**signer, future_batch)
        );
        Ok(PublishOutcome { spot, future })
    }

    fn batch(
        &self,
        future: bool,
        entries: &[ConsensusEntry],
        now: u64,
    ) -> Result<Option<PublishBatch>, PublishError> {
        if entries.is_empty() {
            return Ok(None);
        }
        PublishBatch::build(future, entries, &self.publisher, &self.source, &self.domain, now)
            .map(Some)
    }

    async fn sign_and_submit(
        &self,
        signer: &dyn PublishSigner,
        batch: Option<PublishBatch>,
    ) -> Option<PartitionOutcome> {
        let mut batch = batch?;
        let entries = batch.len();
        let result = match signer.sign_typed(batch.typed_data()).await {
            Ok(signature) => {
                batch.set_signature(signing::signature_parts(&signature));
                self.submit_with_retry(&batch).await
            }
            Err(e) => Err(e),
        };
        Some(PartitionOutcome { entries, result })
    }

    async fn submit_with_retry(&self, batch: &PublishBatch) -> Result<Value, PublishError> {
        let mut attempt = 0;
        loop {
            match self.sink.submit(batch).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        future = batch.is_future(),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
