//! Price pusher - the long-running poll loop
//!
//! Fetch rounds feed the aggregation windows on one cadence; aggregation and
//! publishing run on another. Nothing that fails inside a cycle stops the
//! loop, only the shutdown signal does.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::AggregationError;
use crate::oracle::{FetchOrchestrator, PriceAggregator};
use crate::publisher::{PublishOutcome, Publisher};
use crate::types::{ConsensusEntry, SettlementKind, TrackedPair};

#[derive(Debug, Clone, Copy)]
pub struct PusherIntervals {
    pub fetch: Duration,
    pub push: Duration,
    /// Deadline for one fetch round
    pub fetch_timeout: Duration,
}

pub struct PricePusher {
    orchestrator: FetchOrchestrator,
    aggregator: PriceAggregator,
    publisher: Publisher,
    /// Windows to aggregate each push cycle, deduplicated
    targets: Vec<(String, SettlementKind)>,
    intervals: PusherIntervals,
}

impl PricePusher {
    pub fn new(
        orchestrator: FetchOrchestrator,
        aggregator: PriceAggregator,
        publisher: Publisher,
        pairs: &[TrackedPair],
        intervals: PusherIntervals,
    ) -> Self {
        let mut seen = HashSet::new();
        let targets = pairs
            .iter()
            .map(|tracked| (tracked.pair.id(), tracked.kind))
            .filter(|target| seen.insert(target.clone()))
            .collect();

        Self {
            orchestrator,
            aggregator,
            publisher,
            targets,
            intervals,
        }
    }

    /// One fetch round, ingested into the windows. Returns accepted quotes.
    pub async fn fetch_cycle(&mut self) -> usize {
        let quotes = self
            .orchestrator
            .fetch_quotes(self.intervals.fetch_timeout)
            .await;
        let received = quotes.len();
        let accepted = self.aggregator.ingest_all(quotes, now_secs());

        tracing::debug!(received, accepted, "Quotes ingested");
        accepted
    }

    /// Consensus entries for every tracked window that has data at `now`
    pub fn collect_entries(&mut self, now: u64) -> Vec<ConsensusEntry> {
        let mut entries = Vec::with_capacity(self.targets.len());
        for (pair_id, kind) in &self.targets {
            match self.aggregator.aggregate_at(pair_id, *kind, now) {
                Ok(entry) => entries.push(entry),
                Err(AggregationError::InsufficientData { .. }) => {
                    tracing::debug!(pair = %pair_id, kind = %kind, "No fresh quotes, skipping");
                }
            }
        }
        entries
    }

    /// Aggregate and publish. `None` when there was nothing to publish.
    pub async fn push_cycle(&mut self) -> Option<PublishOutcome> {
        let now = now_secs();
        let entries = self.collect_entries(now);
        if entries.is_empty() {
            tracing::info!("No assets to push");
            return None;
        }

        tracing::info!("processing {} new asset(s) to push...", entries.len());
        match self.publisher.publish_at(&entries, now).await {
            Ok(outcome) => {
                for (kind, partition) in outcome.partitions() {
                    match &partition.result {
                        Ok(_) => tracing::info!(
                            kind = kind,
                            "published {} entrie(s)",
                            partition.entries
                        ),
                        Err(e) => tracing::error!(
                            kind = kind,
                            "could not publish entrie(s): {}",
                            e
                        ),
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                tracing::error!("could not publish entrie(s): {}", e);
                None
            }
        }
    }

    /// Run until `shutdown` flips to true or its sender goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut fetch_tick = tokio::time::interval(self.intervals.fetch);
        fetch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut push_tick = tokio::time::interval(self.intervals.push);
        push_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            sources = ?self.orchestrator.source_names(),
            pairs = self.targets.len(),
            fetch_secs = self.intervals.fetch.as_secs(),
            push_secs = self.intervals.push.as_secs(),
            max_age_secs = self.aggregator.max_age(),
            "Price pusher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = push_tick.tick() => {
                    self.push_cycle().await;
                    // Next tick one full period after the cycle ends
                    push_tick.reset();
                }

                _ = fetch_tick.tick() => {
                    self.fetch_cycle().await;
                    fetch_tick.reset();
                }
            }
        }

        tracing::info!("Price pusher stopped");
        Ok(())
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
