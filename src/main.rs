use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use price_pusher::config::AppConfig;
use price_pusher::error::ConfigError;
use price_pusher::oracle::{sources, FetchOrchestrator, PriceAggregator, SourceFetcher};
use price_pusher::publisher::{HttpSink, PublishSigner, PublishSink, Publisher, RetryPolicy, WalletSigner};
use price_pusher::pusher::{PricePusher, PusherIntervals};
use price_pusher::telemetry;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    telemetry::init_logging(&config.logging.level, config.logging.format)?;

    config.validate().context("Invalid configuration")?;
    tracing::info!(config = %config.digest(), "Configuration loaded");

    let pairs = config.tracked_pairs()?;

    // Sources
    let mut fetchers = Vec::with_capacity(config.sources.enabled.len());
    for name in &config.sources.enabled {
        let source = sources::from_name(name, config.request_timeout())
            .ok_or_else(|| ConfigError::UnknownSource(name.clone()))?;
        fetchers.push(SourceFetcher::new(
            Arc::from(source),
            pairs.clone(),
            config.publisher.name.as_str(),
        )?);
    }
    let orchestrator = FetchOrchestrator::new(fetchers)?;

    let aggregator = PriceAggregator::new(
        config.pusher.window_max_age_secs,
        config.pusher.window_max_quotes,
    )
    .with_population(config.pusher.median_population);

    // Publishing
    let api_key = AppConfig::api_key().unwrap_or_else(|| {
        tracing::warn!("PRAGMA_API_KEY not set, publish requests will be unauthenticated");
        String::new()
    });
    let sink = HttpSink::new(&config.publisher.api_url, &api_key, config.request_timeout())?;
    tracing::info!(sink = %sink.name(), url = %config.publisher.api_url, "Publish sink ready");

    let mut publisher = Publisher::new(Arc::new(sink), config.publisher.name.as_str())
        .with_source(config.publisher.source.as_str())
        .with_domain(config.domain())
        .with_retry(RetryPolicy {
            max_retries: config.pusher.max_retries,
            backoff: Duration::from_millis(config.pusher.retry_backoff_ms),
        });
    match AppConfig::private_key() {
        Some(key) => {
            let signer = WalletSigner::from_private_key(&key)?;
            tracing::info!(address = ?signer.address(), "Offchain signer loaded");
            publisher = publisher.with_signer(Arc::new(signer));
        }
        None => tracing::warn!("No offchain signer set, every publish will fail"),
    }

    // Shutdown on Ctrl-C
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let intervals = PusherIntervals {
        fetch: config.fetch_interval(),
        push: config.push_interval(),
        fetch_timeout: config.fetch_timeout(),
    };
    PricePusher::new(orchestrator, aggregator, publisher, &pairs, intervals)
        .run(shutdown_rx)
        .await
}
