//! Currency hop routing
//!
//! Sources rarely list every pair we track. A source that only quotes against
//! USDT can still price X/USD: the pair is first rewritten to X/USDT, and if
//! that has no data either, X/USDT and USD/USDT are fetched separately and
//! divided.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::oracle::sources::SourceQuote;
use crate::types::{Currency, Pair};

/// Virtual currency id -> concrete currency the source actually lists
#[derive(Debug, Clone, Default)]
pub struct HopSpec {
    hops: HashMap<String, Currency>,
}

impl HopSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hop(mut self, from: &str, to: Currency) -> Self {
        self.hops.insert(from.to_uppercase(), to);
        self
    }

    pub fn get(&self, currency_id: &str) -> Option<&Currency> {
        self.hops.get(currency_id)
    }
}

/// Which leg of a hop failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopLeg {
    /// (base, hop)
    Base,
    /// (quote, hop)
    Quote,
}

/// Pure routing decisions for one source's [`HopSpec`]
#[derive(Debug, Clone, Default)]
pub struct HopRouter {
    spec: HopSpec,
}

impl HopRouter {
    pub fn new(spec: HopSpec) -> Self {
        Self { spec }
    }

    /// The pair to ask the source for.
    ///
    /// The quote currency is substituted when it has a hop entry, otherwise
    /// the base currency is. Precision stays that of the requested pair.
    pub fn resolve(&self, pair: &Pair) -> Pair {
        let decimals = pair.decimals();
        if let Some(hop) = self.mapped(pair.quote()) {
            return Pair::new(pair.base().clone(), hop.clone()).with_decimals(decimals);
        }
        if let Some(hop) = self.mapped(pair.base()) {
            return Pair::new(hop.clone(), pair.quote().clone()).with_decimals(decimals);
        }
        pair.clone()
    }

    /// Which side [`resolve`](Self::resolve) rewrites, with the requested
    /// currency and its stand-in
    pub fn substitution<'a>(&'a self, pair: &'a Pair) -> Option<(HopLeg, &'a Currency, &'a Currency)> {
        if let Some(hop) = self.mapped(pair.quote()) {
            return Some((HopLeg::Quote, pair.quote(), hop));
        }
        self.mapped(pair.base())
            .map(|hop| (HopLeg::Base, pair.base(), hop))
    }

    /// Stand-in currency for the two-leg fallback, if the pair has one
    pub fn hop_currency(&self, pair: &Pair) -> Option<&Currency> {
        self.mapped(pair.quote()).or_else(|| self.mapped(pair.base()))
    }

    /// The two legs to query when `pair` has no direct quote
    pub fn legs(&self, pair: &Pair) -> Option<(Pair, Pair)> {
        let hop = self.hop_currency(pair)?;
        Some((
            Pair::new(pair.base().clone(), hop.clone()),
            Pair::new(pair.quote().clone(), hop.clone()),
        ))
    }

    /// price(base, quote) = price(base, hop) / price(quote, hop).
    ///
    /// Carries the more recent timestamp. Fails on the quote leg when its price
    /// is zero.
    pub fn combine(base_leg: &SourceQuote, quote_leg: &SourceQuote) -> Result<SourceQuote, HopLeg> {
        if quote_leg.price.is_zero() {
            return Err(HopLeg::Quote);
        }
        let price = base_leg
            .price
            .checked_div(quote_leg.price)
            .ok_or(HopLeg::Quote)?;
        Ok(SourceQuote {
            price,
            timestamp: base_leg.timestamp.max(quote_leg.timestamp),
            volume: None,
        })
    }

    /// Re-express a direct answer for the substituted pair in the requested
    /// currency. `rate` is the price of the requested currency in its
    /// stand-in, e.g. USDT per USD.
    pub fn convert(answer: SourceQuote, leg: HopLeg, rate: Decimal) -> Result<SourceQuote, HopLeg> {
        if rate.is_zero() {
            return Err(leg);
        }
        match leg {
            HopLeg::Quote => Ok(SourceQuote {
                price: answer.price.checked_div(rate).ok_or(leg)?,
                ..answer
            }),
            HopLeg::Base => Ok(SourceQuote {
                price: answer.price.checked_mul(rate).ok_or(leg)?,
                volume: answer.volume.and_then(|v| v.checked_div(rate)),
                timestamp: answer.timestamp,
            }),
        }
    }

    fn mapped(&self, currency: &Currency) -> Option<&Currency> {
        self.spec
            .get(currency.id())
            .filter(|hop| hop.id() != currency.id())
    }
}

/// Convenience for adapters that quote against a single stablecoin
pub fn usd_via(stable: &str, decimals: u32) -> HopSpec {
    HopSpec::new().with_hop("USD", Currency::new(stable, decimals, false))
}
