//! Core types used throughout the pusher
//!
//! Defines currencies, pairs, raw quotes and consensus entries.

use ethers::types::Address;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A priced asset or unit of account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Currency {
    id: String,
    decimals: u32,
    is_abstract: bool,
    starknet_address: Option<String>,
    ethereum_address: Option<Address>,
}

impl Currency {
    pub fn new(id: impl Into<String>, decimals: u32, is_abstract: bool) -> Self {
        Self {
            id: id.into().to_uppercase(),
            decimals,
            is_abstract,
            starknet_address: None,
            ethereum_address: None,
        }
    }

    pub fn with_starknet_address(mut self, address: impl Into<String>) -> Self {
        self.starknet_address = Some(address.into());
        self
    }

    pub fn with_ethereum_address(mut self, address: Address) -> Self {
        self.ethereum_address = Some(address);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// Abstract currencies (e.g. USD) have no on-chain representation
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn starknet_address(&self) -> Option<&str> {
        self.starknet_address.as_deref()
    }

    pub fn ethereum_address(&self) -> Option<Address> {
        self.ethereum_address
    }
}

impl PartialEq for Currency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Currency {}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Ordered (base, quote) currency pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    base: Currency,
    quote: Currency,
    decimals: Option<u32>,
}

impl Pair {
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self {
            base,
            quote,
            decimals: None,
        }
    }

    /// Override the precision otherwise inherited from the base currency
    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn base(&self) -> &Currency {
        &self.base
    }

    pub fn quote(&self) -> &Currency {
        &self.quote
    }

    /// Canonical identifier, e.g. "BTC/USD"
    pub fn id(&self) -> String {
        format!("{}/{}", self.base.id(), self.quote.id())
    }

    pub fn decimals(&self) -> u32 {
        self.decimals.unwrap_or(self.base.decimals())
    }
}

impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        self.base.id() == other.base.id() && self.quote.id() == other.quote.id()
    }
}

impl Eq for Pair {}

impl Hash for Pair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.id().hash(state);
        self.quote.id().hash(state);
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base.id(), self.quote.id())
    }
}

/// How an entry settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SettlementKind {
    Spot,
    /// `expiry` is a unix timestamp in seconds, 0 for perpetuals
    Future { expiry: u64 },
}

impl Default for SettlementKind {
    fn default() -> Self {
        SettlementKind::Spot
    }
}

impl SettlementKind {
    pub fn is_future(&self) -> bool {
        matches!(self, SettlementKind::Future { .. })
    }

    pub fn expiry(&self) -> Option<u64> {
        match self {
            SettlementKind::Spot => None,
            SettlementKind::Future { expiry } => Some(*expiry),
        }
    }
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementKind::Spot => write!(f, "SPOT"),
            SettlementKind::Future { expiry: 0 } => write!(f, "PERP"),
            SettlementKind::Future { expiry } => write!(f, "FUTURE@{}", expiry),
        }
    }
}

/// A pair together with the settlement kind it is tracked under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedPair {
    pub pair: Pair,
    pub kind: SettlementKind,
}

impl TrackedPair {
    pub fn spot(pair: Pair) -> Self {
        Self {
            pair,
            kind: SettlementKind::Spot,
        }
    }

    pub fn future(pair: Pair, expiry: u64) -> Self {
        Self {
            pair,
            kind: SettlementKind::Future { expiry },
        }
    }
}

impl fmt::Display for TrackedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.pair, self.kind)
    }
}

/// One raw price observation from one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub pair_id: String,
    /// Fixed-point price scaled by `decimals`
    pub price: u128,
    pub decimals: u32,
    /// Observation time in seconds
    pub timestamp: u64,
    pub source: String,
    pub publisher: String,
    pub volume: Option<u128>,
    pub kind: SettlementKind,
}

/// Aggregated, canonical price for one pair at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusEntry {
    pub pair_id: String,
    pub price: u128,
    pub decimals: u32,
    /// Aggregation time in seconds
    pub timestamp: u64,
    pub num_sources: usize,
    pub volume: u128,
    pub kind: SettlementKind,
}

/// Scale a decimal amount to a fixed-point integer with `decimals` places.
///
/// Returns `None` for negative amounts or when the result does not fit.
pub fn scale_to_fixed(amount: Decimal, decimals: u32) -> Option<u128> {
    if amount.is_sign_negative() {
        return None;
    }
    let factor = Decimal::try_from_i128_with_scale(10i128.checked_pow(decimals)?, 0).ok()?;
    amount
        .checked_mul(factor)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u128()
}
