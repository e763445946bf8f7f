//! Quote refresh for the ticker strip and the detail panel.
//!
//! Symbols with a fresh cache entry are served from the cache. The rest are
//! fetched in batches (default 5 concurrent requests) with a fixed pause
//! between batches to stay under the provider's per-second limit. A failed
//! fetch keeps the last known value on screen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use stockdesk_core::config::MarketConfig;
use stockdesk_core::models::{Fundamentals, Quote};
use stockdesk_core::{Clock, MarketDataProvider, MarketError, TtlCache};
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub quotes: Vec<Quote>,
    pub cached: usize,
    pub fetched: usize,
    /// Symbols whose fetch failed but an older quote was served.
    pub stale: Vec<String>,
    /// Symbols with no quote at all.
    pub failed: Vec<String>,
}

pub struct QuoteService {
    provider: Arc<dyn MarketDataProvider>,
    quotes: Mutex<TtlCache<String, Quote>>,
    fundamentals: Mutex<TtlCache<String, Fundamentals>>,
    batch_size: usize,
    batch_delay: Duration,
}

impl QuoteService {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        clock: Arc<dyn Clock>,
        config: &MarketConfig,
    ) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_seconds);
        Self {
            provider,
            quotes: Mutex::new(TtlCache::new(ttl, clock.clone())),
            fundamentals: Mutex::new(TtlCache::new(ttl, clock)),
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
        }
    }

    pub async fn refresh(&self, symbols: &[String]) -> RefreshReport {
        let mut report = RefreshReport::default();
        let mut unique: Vec<String> = Vec::new();
        for s in symbols {
            let s = s.trim().to_ascii_uppercase();
            if !s.is_empty() && !unique.contains(&s) {
                unique.push(s);
            }
        }

        let mut found: HashMap<String, Quote> = HashMap::new();
        let mut pending = Vec::new();
        {
            let cache = self.quotes.lock().await;
            for symbol in &unique {
                match cache.get(symbol) {
                    Some(q) => {
                        found.insert(symbol.clone(), q);
                        report.cached += 1;
                    }
                    None => pending.push(symbol.clone()),
                }
            }
        }

        for (i, batch) in pending.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }

            let results = join_all(batch.iter().map(|s| self.provider.quote(s))).await;

            let mut cache = self.quotes.lock().await;
            for (symbol, result) in batch.iter().zip(results) {
                match result {
                    Ok(quote) => {
                        cache.put(symbol.clone(), quote.clone());
                        found.insert(symbol.clone(), quote);
                        report.fetched += 1;
                    }
                    Err(e) => {
                        tracing::warn!(symbol = %symbol, error = %e, "Quote refresh failed");
                        match cache.get_stale(symbol) {
                            Some(old) => {
                                found.insert(symbol.clone(), old);
                                report.stale.push(symbol.clone());
                            }
                            None => report.failed.push(symbol.clone()),
                        }
                    }
                }
            }
        }

        report.quotes = unique.iter().filter_map(|s| found.remove(s)).collect();

        tracing::debug!(
            cached = report.cached,
            fetched = report.fetched,
            stale = report.stale.len(),
            failed = report.failed.len(),
            "Quote refresh complete"
        );

        report
    }

    /// Drop expired entries from both caches. Returns how many went.
    pub async fn purge_expired(&self) -> usize {
        self.quotes.lock().await.purge_expired() + self.fundamentals.lock().await.purge_expired()
    }

    /// Fundamentals for the detail panel, cached like quotes.
    pub async fn fundamentals(&self, symbol: &str) -> Result<Fundamentals, MarketError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if let Some(f) = self.fundamentals.lock().await.get(&symbol) {
            return Ok(f);
        }

        match self.provider.fundamentals(&symbol).await {
            Ok(f) => {
                self.fundamentals.lock().await.put(symbol, f.clone());
                Ok(f)
            }
            Err(e) => {
                let stale = self.fundamentals.lock().await.get_stale(&symbol);
                match stale {
                    Some(old) => {
                        tracing::warn!(symbol = %symbol, error = %e, "Serving stale fundamentals");
                        Ok(old)
                    }
                    None => Err(e),
                }
            }
        }
    }
}

/// Keep the watchlist warm. Runs until the shutdown signal fires.
pub async fn run_watchlist_loop(
    service: Arc<QuoteService>,
    watchlist: Vec<String>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    if watchlist.is_empty() {
        tracing::info!("Watchlist empty, quote refresh loop not started");
        return;
    }

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(symbols = watchlist.len(), interval_secs = every.as_secs(), "Watchlist refresh loop started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Watchlist refresh loop stopping");
                return;
            }
            _ = ticker.tick() => {
                let report = service.refresh(&watchlist).await;
                if !report.failed.is_empty() {
                    tracing::warn!(failed = ?report.failed, "Watchlist symbols without quotes");
                }
                // Only sweep when nothing is being served stale
                if report.failed.is_empty() && report.stale.is_empty() {
                    let purged = service.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(purged, "Expired market data purged");
                    }
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
