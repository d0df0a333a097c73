//! Oracle Aggregator - Reduces raw quotes to one consensus price per pair
//!
//! Every (pair, settlement kind) owns a time-ordered window of recent quotes.
//! Quotes older than the window's max age are evicted before each ingest and
//! each aggregation; the consensus price is the median of what remains.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;

use crate::error::AggregationError;
use crate::types::{ConsensusEntry, Quote, SettlementKind};

/// Which quotes in a window take part in the median
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MedianPopulation {
    /// Every quote still in the window
    #[default]
    AllQuotes,
    /// Only the most recent quote of each source
    LatestPerSource,
}

/// Bounded-age buffer of recent quotes for one pair
#[derive(Debug, Clone)]
pub struct AggregationWindow {
    pair_id: String,
    kind: SettlementKind,
    decimals: u32,
    /// Ordered by timestamp, oldest first
    quotes: VecDeque<Quote>,
    max_age: u64,
    max_quotes: usize,
    population: MedianPopulation,
    /// Everything strictly older than this has been evicted for good
    watermark: u64,
}

impl AggregationWindow {
    pub fn new(
        pair_id: impl Into<String>,
        kind: SettlementKind,
        decimals: u32,
        max_age: u64,
        max_quotes: usize,
    ) -> Self {
        Self {
            pair_id: pair_id.into(),
            kind,
            decimals,
            quotes: VecDeque::new(),
            max_age,
            max_quotes: max_quotes.max(1),
            population: MedianPopulation::default(),
            watermark: 0,
        }
    }

    pub fn with_population(mut self, population: MedianPopulation) -> Self {
        self.population = population;
        self
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Drop quotes with `now - timestamp > max_age`. Returns how many went.
    pub fn evict(&mut self, now: u64) -> usize {
        self.watermark = self.watermark.max(now.saturating_sub(self.max_age));
        let before = self.quotes.len();
        while self
            .quotes
            .front()
            .is_some_and(|q| q.timestamp < self.watermark)
        {
            self.quotes.pop_front();
        }
        before - self.quotes.len()
    }

    /// Insert in time order. Quotes behind the eviction watermark are refused.
    pub fn ingest(&mut self, quote: Quote, now: u64) -> bool {
        self.evict(now);
        if quote.timestamp < self.watermark {
            return false;
        }
        let at = self
            .quotes
            .partition_point(|q| q.timestamp <= quote.timestamp);
        self.quotes.insert(at, quote);
        while self.quotes.len() > self.max_quotes {
            self.quotes.pop_front();
        }
        true
    }

    pub fn aggregate(&mut self, now: u64) -> Result<ConsensusEntry, AggregationError> {
        let evicted = self.evict(now);
        if evicted > 0 {
            tracing::trace!(pair = %self.pair_id, evicted, "Evicted stale quotes");
        }

        let population: Vec<&Quote> = match self.population {
            MedianPopulation::AllQuotes => self.quotes.iter().collect(),
            MedianPopulation::LatestPerSource => {
                // Oldest first, so later quotes overwrite
                let mut latest: HashMap<&str, &Quote> = HashMap::new();
                for quote in &self.quotes {
                    latest.insert(quote.source.as_str(), quote);
                }
                latest.into_values().collect()
            }
        };

        let mut prices: Vec<u128> = population.iter().map(|q| q.price).collect();
        prices.sort_unstable();
        let price = median(&prices).ok_or_else(|| AggregationError::InsufficientData {
            pair: self.pair_id.clone(),
            max_age: self.max_age,
        })?;

        let sources: HashSet<&str> = population.iter().map(|q| q.source.as_str()).collect();
        let volume = population
            .iter()
            .filter_map(|q| q.volume)
            .fold(0u128, u128::saturating_add);

        Ok(ConsensusEntry {
            pair_id: self.pair_id.clone(),
            price,
            decimals: self.decimals,
            timestamp: now,
            num_sources: sources.len(),
            volume,
            kind: self.kind,
        })
    }
}

/// Median of sorted fixed-point prices; even lengths average the two middle
/// values, rounding half up.
pub fn median(sorted: &[u128]) -> Option<u128> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        return Some(sorted[n / 2]);
    }
    Some(midpoint(sorted[n / 2 - 1], sorted[n / 2]))
}

/// (a + b) / 2 rounded half up, without overflowing
fn midpoint(a: u128, b: u128) -> u128 {
    a / 2 + b / 2 + (a % 2 + b % 2 + 1) / 2
}

/// Per-pair windows, one writer
pub struct PriceAggregator {
    windows: HashMap<(String, SettlementKind), AggregationWindow>,
    /// Maximum age of quotes to consider (seconds)
    max_age: u64,
    /// Capacity bound per window, oldest dropped first
    max_quotes: usize,
    population: MedianPopulation,
}

impl PriceAggregator {
    pub fn new(max_age: u64, max_quotes: usize) -> Self {
        Self {
            windows: HashMap::new(),
            max_age,
            max_quotes,
            population: MedianPopulation::default(),
        }
    }

    /// Applies to windows created from here on
    pub fn with_population(mut self, population: MedianPopulation) -> Self {
        self.population = population;
        self
    }

    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    pub fn ingest(&mut self, quote: Quote) -> bool {
        self.ingest_at(quote, now_secs())
    }

    /// Add a quote to its pair's window, evicting stale entries first
    pub fn ingest_at(&mut self, quote: Quote, now: u64) -> bool {
        let key = (quote.pair_id.clone(), quote.kind);
        let (max_age, max_quotes, population) = (self.max_age, self.max_quotes, self.population);
        let window = self.windows.entry(key).or_insert_with(|| {
            AggregationWindow::new(
                quote.pair_id.clone(),
                quote.kind,
                quote.decimals,
                max_age,
                max_quotes,
            )
            .with_population(population)
        });

        let (pair, source, ts) = (quote.pair_id.clone(), quote.source.clone(), quote.timestamp);
        let accepted = window.ingest(quote, now);
        if !accepted {
            tracing::debug!(pair = %pair, source = %source, timestamp = ts, "Refused stale quote");
        }
        accepted
    }

    /// Ingest a fetch round; returns how many quotes were accepted
    pub fn ingest_all(&mut self, quotes: impl IntoIterator<Item = Quote>, now: u64) -> usize {
        quotes
            .into_iter()
            .map(|q| self.ingest_at(q, now))
            .filter(|accepted| *accepted)
            .count()
    }

    pub fn aggregate(
        &mut self,
        pair_id: &str,
        kind: SettlementKind,
    ) -> Result<ConsensusEntry, AggregationError> {
        self.aggregate_at(pair_id, kind, now_secs())
    }

    pub fn aggregate_at(
        &mut self,
        pair_id: &str,
        kind: SettlementKind,
        now: u64,
    ) -> Result<ConsensusEntry, AggregationError> {
        match self.windows.get_mut(&(pair_id.to_string(), kind)) {
            Some(window) => window.aggregate(now),
            None => Err(AggregationError::InsufficientData {
                pair: pair_id.to_string(),
                max_age: self.max_age,
            }),
        }
    }

    /// Aggregate every known window
    pub fn aggregate_all(&mut self, now: u64) -> Vec<Result<ConsensusEntry, AggregationError>> {
        self.windows
            .values_mut()
            .map(|window| window.aggregate(now))
            .collect()
    }

    pub fn window_len(&self, pair_id: &str, kind: SettlementKind) -> usize {
        self.windows
            .get(&(pair_id.to_string(), kind))
            .map(AggregationWindow::len)
            .unwrap_or(0)
    }
}

impl Default for PriceAggregator {
    fn default() -> Self {
        Self::new(3600, 1024) // 1h max age, 1024 quotes per window
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
