//! Oracle module - Multi-source price collection and aggregation
//!
//! Sources are queried through their hop routing, fetched concurrently under
//! a round deadline, and reduced to one median price per pair.

mod aggregator;
mod fetcher;
pub mod hop;
pub mod sources;

pub use aggregator::{median, AggregationWindow, MedianPopulation, PriceAggregator};
pub use fetcher::{FetchOrchestrator, SourceFetcher};
pub use hop::{HopLeg, HopRouter, HopSpec};
pub use sources::{PriceSource, SourceQuote};
