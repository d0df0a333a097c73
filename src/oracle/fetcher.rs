//! Fetch orchestration
//!
//! Fans out one query per (source, tracked pair), joins them under a single
//! round deadline and hands back every outcome as a value. A slow or failing
//! source only ever costs its own pairs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::time::Instant;

use crate::error::{ConfigError, FetchError, QueryError};
use crate::oracle::hop::{HopLeg, HopRouter};
use crate::oracle::sources::{PriceSource, SourceQuote};
use crate::types::{scale_to_fixed, Currency, Pair, Quote, SettlementKind, TrackedPair};

/// Stand-in rates for one round, keyed by the requested currency id
type HopRates = HashMap<String, Result<Option<Decimal>, QueryError>>;

/// One source together with the pairs it is asked for
pub struct SourceFetcher {
    source: Arc<dyn PriceSource>,
    router: HopRouter,
    pairs: Vec<TrackedPair>,
    publisher: String,
}

impl SourceFetcher {
    pub fn new(
        source: Arc<dyn PriceSource>,
        pairs: Vec<TrackedPair>,
        publisher: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if pairs.is_empty() {
            return Err(ConfigError::Empty("pair"));
        }
        let router = HopRouter::new(source.hops());
        Ok(Self {
            source,
            router,
            pairs,
            publisher: publisher.into(),
        })
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Fetch one pair, falling back to a two-leg hop when the source has no
    /// direct quote.
    pub async fn fetch_pair(&self, tracked: &TrackedPair) -> Result<Quote, FetchError> {
        let rates = self.hop_rates(std::slice::from_ref(tracked), None).await;
        self.fetch_pair_at(tracked, &rates).await
    }

    async fn fetch_pair_at(&self, tracked: &TrackedPair, rates: &HopRates) -> Result<Quote, FetchError> {
        let pair = &tracked.pair;
        let resolved = self.router.resolve(pair);

        let answer = match self.source.query(&resolved, tracked.kind).await {
            Ok(answer) => self.correct_substituted(pair, answer, rates)?,
            Err(QueryError::NotFound) => self.fetch_via_hop(pair, tracked.kind).await?,
            Err(QueryError::Transient(reason)) => {
                return Err(FetchError::Transient {
                    pair: pair.id(),
                    source_id: self.name().to_string(),
                    reason,
                })
            }
        };

        self.to_quote(tracked, answer)
    }

    /// Stand-in rates for every currency the given pairs substitute
    async fn hop_rates(&self, pairs: &[TrackedPair], deadline: Option<Instant>) -> HopRates {
        let mut wanted: HashMap<&str, (&Currency, &Currency)> = HashMap::new();
        for tracked in pairs {
            if let Some((_, from, to)) = self.router.substitution(&tracked.pair) {
                wanted.entry(from.id()).or_insert((from, to));
            }
        }

        let lookups = wanted.into_iter().map(|(id, (from, to))| async move {
            let lookup = self.source.hop_rate(from, to);
            let rate = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, lookup)
                    .await
                    .unwrap_or_else(|_| Err(QueryError::Transient("round deadline passed".into()))),
                None => lookup.await,
            };
            (id.to_string(), rate)
        });

        join_all(lookups).await.into_iter().collect()
    }

    /// A direct answer for a rewritten pair is in stand-in units until the
    /// round's rate is applied
    fn correct_substituted(
        &self,
        pair: &Pair,
        answer: SourceQuote,
        rates: &HopRates,
    ) -> Result<SourceQuote, FetchError> {
        let Some((leg, from, to)) = self.router.substitution(pair) else {
            return Ok(answer);
        };
        let transient = |reason: String| FetchError::Transient {
            pair: pair.id(),
            source_id: self.name().to_string(),
            reason,
        };

        match rates.get(from.id()) {
            Some(Ok(Some(rate))) => HopRouter::convert(answer, leg, *rate)
                .map_err(|_| transient(format!("unusable {}/{} rate {}", from.id(), to.id(), rate))),
            Some(Ok(None)) | None => Ok(answer),
            Some(Err(e)) => Err(transient(format!("no {}/{} rate: {}", from.id(), to.id(), e))),
        }
    }

    async fn fetch_via_hop(
        &self,
        pair: &Pair,
        kind: SettlementKind,
    ) -> Result<SourceQuote, FetchError> {
        let Some((base_leg, quote_leg)) = self.router.legs(pair) else {
            return Err(FetchError::NotFound {
                pair: pair.id(),
                source_id: self.name().to_string(),
            });
        };

        let hop_failed = |leg: HopLeg| FetchError::HopFailed {
            pair: pair.id(),
            source_id: self.name().to_string(),
            currency: match leg {
                HopLeg::Base => pair.base().id().to_string(),
                HopLeg::Quote => pair.quote().id().to_string(),
            },
        };

        tracing::debug!(
            source = %self.name(),
            pair = %pair,
            base_leg = %base_leg,
            quote_leg = %quote_leg,
            "No direct quote, hopping"
        );

        let (base_answer, quote_answer) = tokio::join!(
            self.source.query(&base_leg, kind),
            self.source.query(&quote_leg, kind)
        );
        let base_answer = base_answer.map_err(|_| hop_failed(HopLeg::Base))?;
        let quote_answer = quote_answer.map_err(|_| hop_failed(HopLeg::Quote))?;

        HopRouter::combine(&base_answer, &quote_answer).map_err(hop_failed)
    }

    fn to_quote(&self, tracked: &TrackedPair, answer: SourceQuote) -> Result<Quote, FetchError> {
        let pair = &tracked.pair;
        let invalid = |reason: String| FetchError::InvalidPrice {
            pair: pair.id(),
            source_id: self.name().to_string(),
            reason,
        };

        let price = scale_to_fixed(answer.price, pair.decimals())
            .ok_or_else(|| invalid(format!("cannot scale {}", answer.price)))?;
        if price == 0 {
            return Err(invalid("zero price".to_string()));
        }
        let volume = answer
            .volume
            .and_then(|v| scale_to_fixed(v, pair.decimals()));

        tracing::debug!(
            source = %self.name(),
            pair = %pair,
            price = price,
            timestamp = answer.timestamp,
            "Fetched price"
        );

        Ok(Quote {
            pair_id: pair.id(),
            price,
            decimals: pair.decimals(),
            timestamp: answer.timestamp,
            source: self.name().to_string(),
            publisher: self.publisher.clone(),
            volume,
            kind: tracked.kind,
        })
    }

    /// Fetch every supported pair concurrently; anything unfinished at
    /// `deadline` is reported as a timeout.
    pub async fn fetch_all(&self, deadline: Instant) -> Vec<Result<Quote, FetchError>> {
        let supported = self
            .pairs
            .iter()
            .filter(|tracked| {
                let supported = self.source.supports(tracked.kind);
                if !supported {
                    tracing::debug!(
                        source = %self.name(),
                        pair = %tracked,
                        "Skipping unsupported settlement kind"
                    );
                }
                supported
            })
            .collect::<Vec<_>>();
        let rates = self.hop_rates(&self.pairs, Some(deadline)).await;
        let rates = &rates;

        let tasks = supported.into_iter().map(|tracked| async move {
            match tokio::time::timeout_at(deadline, self.fetch_pair_at(tracked, rates)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout {
                    pair: tracked.pair.id(),
                    source_id: self.name().to_string(),
                }),
            }
        });

        join_all(tasks).await
    }
}

/// Drives every configured source concurrently
pub struct FetchOrchestrator {
    fetchers: Vec<SourceFetcher>,
}

impl FetchOrchestrator {
    pub fn new(fetchers: Vec<SourceFetcher>) -> Result<Self, ConfigError> {
        if fetchers.is_empty() {
            return Err(ConfigError::Empty("source"));
        }
        Ok(Self { fetchers })
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.fetchers.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    pub fn add_fetcher(&mut self, fetcher: SourceFetcher) {
        tracing::info!(source = %fetcher.name(), "Source added");
        self.fetchers.push(fetcher);
    }

    /// Replace the whole source set; an empty set is refused and the current
    /// one kept.
    pub fn set_fetchers(&mut self, fetchers: Vec<SourceFetcher>) -> Result<(), ConfigError> {
        if fetchers.is_empty() {
            return Err(ConfigError::Empty("source"));
        }
        self.fetchers = fetchers;
        Ok(())
    }

    /// Remove a source by name. Removing the last one is refused.
    pub fn remove_fetcher(&mut self, name: &str) -> Result<SourceFetcher, ConfigError> {
        let index = self
            .fetchers
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))?;
        if self.fetchers.len() == 1 {
            return Err(ConfigError::Empty("source"));
        }
        tracing::info!(source = %name, "Source removed");
        Ok(self.fetchers.remove(index))
    }

    /// One fetch round: all sources, all pairs, one deadline.
    ///
    /// Result order is unspecified.
    pub async fn fetch(&self, timeout: Duration) -> Vec<Result<Quote, FetchError>> {
        let deadline = Instant::now() + timeout;
        let rounds = join_all(self.fetchers.iter().map(|f| f.fetch_all(deadline))).await;
        let results: Vec<_> = rounds.into_iter().flatten().collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        tracing::info!(
            sources = self.fetchers.len(),
            fetched = results.len() - failed,
            failed = failed,
            "Fetch round complete"
        );
        results
    }

    /// Like [`fetch`](Self::fetch) but logs and drops failures
    pub async fn fetch_quotes(&self, timeout: Duration) -> Vec<Quote> {
        self.fetch(timeout)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(quote) => Some(quote),
                Err(e) => {
                    tracing::warn!(
                        pair = %e.pair(),
                        source = %e.source_name(),
                        error = %e,
                        "Fetch failed"
                    );
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::hop::HopSpec;
    use crate::types::Currency;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Answers from a per-pair script; unscripted pairs are not found
    struct ScriptedSource {
        name: &'static str,
        hops: HopSpec,
        answers: Mutex<HashMap<String, VecDeque<Result<SourceQuote, QueryError>>>>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
        rate: Option<Result<Decimal, QueryError>>,
        rate_lookups: Mutex<usize>,
    }

    impl ScriptedSource {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                hops: HopSpec::new(),
                answers: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                delay: None,
                rate: None,
                rate_lookups: Mutex::new(0),
            }
        }

        fn with_rate(mut self, rate: Result<Decimal, QueryError>) -> Self {
            self.rate = Some(rate);
            self
        }

        fn with_hops(mut self, hops: HopSpec) -> Self {
            self.hops = hops;
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn answer(self, pair_id: &str, answer: Result<SourceQuote, QueryError>) -> Self {
            self.answers
                .lock()
                .unwrap()
                .entry(pair_id.to_string())
                .or_default()
                .push_back(answer);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        fn name(&self) -> &str {
            self.name
        }

        fn hops(&self) -> HopSpec {
            self.hops.clone()
        }

        async fn query(
            &self,
            pair: &Pair,
            _kind: SettlementKind,
        ) -> Result<SourceQuote, QueryError> {
            self.calls.lock().unwrap().push(pair.id());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.answers
                .lock()
                .unwrap()
                .get_mut(&pair.id())
                .and_then(|answers| answers.pop_front())
                .unwrap_or(Err(QueryError::NotFound))
        }

        async fn hop_rate(&self, _from: &Currency, _to: &Currency) -> Result<Option<Decimal>, QueryError> {
            *self.rate_lookups.lock().unwrap() += 1;
            self.rate.clone().transpose()
        }
    }

    fn quote(price: Decimal, timestamp: u64) -> Result<SourceQuote, QueryError> {
        Ok(SourceQuote {
            price,
            timestamp,
            volume: None,
        })
    }

    fn x_usd() -> TrackedPair {
        TrackedPair::spot(Pair::new(
            Currency::new("X", 8, false),
            Currency::new("USD", 8, true),
        ))
    }

    fn usdc_hop() -> HopSpec {
        HopSpec::new().with_hop("USD", Currency::new("USDC", 6, false))
    }

    fn fetcher(source: Arc<ScriptedSource>, pairs: Vec<TrackedPair>) -> SourceFetcher {
        SourceFetcher::new(source, pairs, "TEST_PUBLISHER").unwrap()
    }

    #[tokio::test]
    async fn direct_quote_is_scaled_to_pair_decimals() {
        let source = Arc::new(ScriptedSource::new("A").answer("X/USD", quote(dec!(1.5), 100)));
        let f = fetcher(source.clone(), vec![x_usd()]);

        let q = f.fetch_pair(&x_usd()).await.unwrap();
        assert_eq!(q.price, 150_000_000);
        assert_eq!(q.timestamp, 100);
        assert_eq!(q.source, "A");
        assert_eq!(q.publisher, "TEST_PUBLISHER");
        assert_eq!(source.calls(), vec!["X/USD"]);
    }

    #[tokio::test]
    async fn not_found_without_hop_entry_is_surfaced() {
        let source = Arc::new(ScriptedSource::new("A"));
        let f = fetcher(source.clone(), vec![x_usd()]);

        let err = f.fetch_pair(&x_usd()).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::NotFound {
                pair: "X/USD".into(),
                source_id: "A".into()
            }
        );
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn hop_fallback_issues_two_legs_and_divides() {
        let source = Arc::new(
            ScriptedSource::new("A")
                .with_hops(usdc_hop())
                .answer("X/USDC", Err(QueryError::NotFound))
                .answer("X/USDC", quote(dec!(20), 100))
                .answer("USD/USDC", quote(dec!(0.5), 103)),
        );
        let f = fetcher(source.clone(), vec![x_usd()]);

        let q = f.fetch_pair(&x_usd()).await.unwrap();
        assert_eq!(q.pair_id, "X/USD");
        assert_eq!(q.price, 4_000_000_000);
        assert_eq!(q.timestamp, 103);

        let calls = source.calls();
        assert_eq!(calls.len(), 3);
        let legs: Vec<&str> = calls[1..].iter().map(String::as_str).collect();
        assert!(legs.contains(&"X/USDC"));
        assert!(legs.contains(&"USD/USDC"));
    }

    #[tokio::test]
    async fn hop_failure_names_the_failing_leg() {
        let source = Arc::new(
            ScriptedSource::new("A")
                .with_hops(usdc_hop())
                .answer("X/USDC", Err(QueryError::NotFound))
                .answer("X/USDC", quote(dec!(0.02), 100)),
        );
        let f = fetcher(source.clone(), vec![x_usd()]);

        let err = f.fetch_pair(&x_usd()).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::HopFailed {
                pair: "X/USD".into(),
                source_id: "A".into(),
                currency: "USD".into()
            }
        );

        let source = Arc::new(
            ScriptedSource::new("A")
                .with_hops(usdc_hop())
                .answer("USD/USDC", quote(dec!(1), 100)),
        );
        let f = fetcher(source, vec![x_usd()]);
        match f.fetch_pair(&x_usd()).await {
            Err(FetchError::HopFailed { currency, .. }) => assert_eq!(currency, "X"),
            other => panic!("expected hop failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn substituted_answer_is_converted_at_round_rate() {
        let y_usd = TrackedPair::spot(Pair::new(
            Currency::new("Y", 8, false),
            Currency::new("USD", 8, true),
        ));
        let x_eur = TrackedPair::spot(Pair::new(
            Currency::new("X", 8, false),
            Currency::new("EUR", 8, true),
        ));
        let source = Arc::new(
            ScriptedSource::new("A")
                .with_hops(usdc_hop())
                .with_rate(Ok(dec!(1.25)))
                .answer("X/USDC", quote(dec!(2.5), 100))
                .answer("Y/USDC", quote(dec!(5), 100))
                .answer("X/EUR", quote(dec!(3), 100)),
        );
        let f = fetcher(source.clone(), vec![x_usd(), y_usd, x_eur]);

        let results = f.fetch_all(Instant::now() + Duration::from_secs(1)).await;
        let prices: Vec<u128> = results.into_iter().map(|r| r.unwrap().price).collect();
        // 2.5 USDC / 1.25 USDC per USD; EUR is not rewritten
        assert_eq!(prices, vec![200_000_000, 400_000_000, 300_000_000]);
        assert_eq!(*source.rate_lookups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_round_rate_fails_only_substituted_pairs() {
        let x_eur = TrackedPair::spot(Pair::new(
            Currency::new("X", 8, false),
            Currency::new("EUR", 8, true),
        ));
        let source = Arc::new(
            ScriptedSource::new("A")
                .with_hops(usdc_hop())
                .with_rate(Err(QueryError::Transient("HTTP status 502".into())))
                .answer("X/USDC", quote(dec!(2.5), 100))
                .answer("X/EUR", quote(dec!(3), 100)),
        );
        let f = fetcher(source, vec![x_usd(), x_eur]);

        let results = f.fetch_all(Instant::now() + Duration::from_secs(1)).await;
        assert!(matches!(
            &results[0],
            Err(FetchError::Transient { reason, .. }) if reason.contains("USD/USDC")
        ));
        assert_eq!(results[1].as_ref().unwrap().price, 300_000_000);
    }

    #[tokio::test]
    async fn transient_direct_failure_does_not_hop() {
        let source = Arc::new(
            ScriptedSource::new("A")
                .with_hops(usdc_hop())
                .answer("X/USDC", Err(QueryError::Transient("HTTP status 502".into()))),
        );
        let f = fetcher(source.clone(), vec![x_usd()]);

        let err = f.fetch_pair(&x_usd()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn slow_source_times_out_without_sinking_siblings() {
        let fast = Arc::new(ScriptedSource::new("FAST").answer("X/USD", quote(dec!(2), 100)));
        let slow = Arc::new(
            ScriptedSource::new("SLOW")
                .with_delay(Duration::from_secs(30))
                .answer("X/USD", quote(dec!(2), 100)),
        );
        let orchestrator = FetchOrchestrator::new(vec![
            fetcher(fast, vec![x_usd()]),
            fetcher(slow, vec![x_usd()]),
        ])
        .unwrap();

        let started = std::time::Instant::now();
        let results = orchestrator.fetch(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .any(|r| matches!(r, Ok(q) if q.source == "FAST")));
        assert!(results.iter().any(|r| matches!(
            r,
            Err(FetchError::Timeout { source_id, .. }) if source_id == "SLOW"
        )));
    }

    #[tokio::test]
    async fn fetch_quotes_drops_failures() {
        let good = Arc::new(ScriptedSource::new("GOOD").answer("X/USD", quote(dec!(1), 1)));
        let bad = Arc::new(ScriptedSource::new("BAD"));
        let orchestrator = FetchOrchestrator::new(vec![
            fetcher(good, vec![x_usd()]),
            fetcher(bad, vec![x_usd()]),
        ])
        .unwrap();

        let quotes = orchestrator.fetch_quotes(Duration::from_secs(1)).await;
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].source, "GOOD");
    }

    #[tokio::test]
    async fn unsupported_kinds_are_skipped() {
        let source = Arc::new(ScriptedSource::new("A").answer("X/USD", quote(dec!(1), 1)));
        let perp = TrackedPair::future(x_usd().pair, 0);
        let f = fetcher(source.clone(), vec![x_usd(), perp]);

        let results = f.fetch_all(Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(source.calls(), vec!["X/USD"]);
    }

    #[test]
    fn empty_configurations_are_rejected() {
        assert!(matches!(
            FetchOrchestrator::new(Vec::new()),
            Err(ConfigError::Empty("source"))
        ));
        let source = Arc::new(ScriptedSource::new("A"));
        assert!(matches!(
            SourceFetcher::new(source, Vec::new(), "P"),
            Err(ConfigError::Empty("pair"))
        ));
    }

    #[test]
    fn removing_last_source_is_rejected() {
        let a = Arc::new(ScriptedSource::new("A"));
        let b = Arc::new(ScriptedSource::new("B"));
        let mut orchestrator = FetchOrchestrator::new(vec![fetcher(a, vec![x_usd()])]).unwrap();
        orchestrator.add_fetcher(fetcher(b, vec![x_usd()]));

        assert!(orchestrator.remove_fetcher("A").is_ok());
        assert!(matches!(
            orchestrator.remove_fetcher("B"),
            Err(ConfigError::Empty("source"))
        ));
        assert_eq!(orchestrator.source_names(), vec!["B"]);
        assert!(matches!(
            orchestrator.remove_fetcher("C"),
            Err(ConfigError::UnknownSource(_))
        ));
        assert!(orchestrator.set_fetchers(Vec::new()).is_err());
        assert_eq!(orchestrator.len(), 1);
    }
}
