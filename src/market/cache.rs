use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::market::MarketDataProvider;
use crate::models::{Candle, Timeframe};
use crate::Result;

type CacheKey = (String, Timeframe);

#[derive(Clone)]
struct CacheEntry {
    candles: Arc<Vec<Candle>>,
    fetched_at: DateTime<Utc>,
    /// Open time of the newest candle in the series
    latest_candle: Option<DateTime<Utc>>,
}

/// Hit/miss counters, logged periodically by the monitor
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

/// Shared per-symbol candle cache.
///
/// Invalidation is candle-close driven: an entry goes stale the moment a new
/// candle has completed since it was fetched, because structural conditions
/// are only meaningful against a just-closed candle. A secondary TTL bounds
/// staleness between closes. Refresh is single-flight per (symbol, timeframe);
/// concurrent callers await the one in-flight fetch.
pub struct MarketDataCache {
    provider: Arc<dyn MarketDataProvider>,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    refresh_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    ttl: Duration,
    candle_count: u32,
    /// With smart caching off, every read refreshes synchronously
    caching_enabled: bool,
    pub stats: CacheStats,
}

/// Open time of the last *completed* candle as of `now`
fn last_closed_open(now: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    let secs = timeframe.secs() as i64;
    let bucket = (now.timestamp() / secs) * secs;
    Utc.timestamp_opt(bucket - secs, 0).single().unwrap_or(now)
}

fn entry_is_fresh(entry: &CacheEntry, now: DateTime<Utc>, timeframe: Timeframe, ttl: Duration) -> bool {
    let Some(latest) = entry.latest_candle else {
        return false;
    };
    // A newer candle has closed since this series was fetched
    if latest < last_closed_open(now, timeframe) {
        return false;
    }
    let age = now.signed_duration_since(entry.fetched_at);
    age.to_std().map(|age| age < ttl).unwrap_or(false)
}

impl MarketDataCache {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        ttl: Duration,
        candle_count: u32,
        caching_enabled: bool,
    ) -> Self {
        Self {
            provider,
            entries: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            ttl,
            candle_count,
            caching_enabled,
            stats: CacheStats::default(),
        }
    }

    /// Cached series if fresh, else a synchronous refresh. Returns the series
    /// and the time it was fetched.
    pub async fn get(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<(Arc<Vec<Candle>>, DateTime<Utc>)> {
        let key = (symbol.to_string(), timeframe);

        if self.caching_enabled {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if entry_is_fresh(entry, Utc::now(), timeframe, self.ttl) {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((entry.candles.clone(), entry.fetched_at));
                }
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.refresh(symbol, timeframe).await
    }

    /// Refresh one entry, single-flight per key
    pub async fn refresh(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<(Arc<Vec<Candle>>, DateTime<Utc>)> {
        self.refresh_entry(symbol, timeframe, false).await
    }

    /// Unconditional refetch, used by pre-fetch to renew entries that are
    /// still fresh but about to age out. Same single-flight lock as `refresh`.
    async fn refresh_forced(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<(Arc<Vec<Candle>>, DateTime<Utc>)> {
        self.refresh_entry(symbol, timeframe, true).await
    }

    async fn refresh_entry(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        force: bool,
    ) -> Result<(Arc<Vec<Candle>>, DateTime<Utc>)> {
        let key = (symbol.to_string(), timeframe);

        let flight = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let _guard = flight.lock().await;

        // Another caller may have refreshed while we waited on the flight
        // lock. A forced refresh skips this and fetches regardless.
        if self.caching_enabled && !force {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if entry_is_fresh(entry, Utc::now(), timeframe, self.ttl) {
                    return Ok((entry.candles.clone(), entry.fetched_at));
                }
            }
        }

        let candles = self
            .provider
            .get_candles(symbol, timeframe, self.candle_count)
            .await?;

        let entry = CacheEntry {
            latest_candle: candles.last().map(|c| c.timestamp),
            candles: Arc::new(candles),
            fetched_at: Utc::now(),
        };
        let out = (entry.candles.clone(), entry.fetched_at);

        self.entries.write().await.insert(key, entry);
        Ok(out)
    }

    /// Drop entries for symbols that no longer have pending plans
    pub async fn retain_symbols(&self, symbols: &[String]) {
        let mut entries = self.entries.write().await;
        entries.retain(|(symbol, _), _| symbols.contains(symbol));
        let mut locks = self.refresh_locks.lock().await;
        locks.retain(|(symbol, _), _| symbols.contains(symbol));
    }

    /// Keys whose TTL expires within `lead` from now
    async fn keys_expiring_within(&self, lead: Duration) -> Vec<CacheKey> {
        let entries = self.entries.read().await;
        let now = Utc::now();
        entries
            .iter()
            .filter(|(_, entry)| {
                now.signed_duration_since(entry.fetched_at)
                    .to_std()
                    .map(|age| age + lead >= self.ttl)
                    .unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Cooperative handle for the background pre-fetch task
pub struct PrefetchHandle {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl PrefetchHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawn the pre-fetch task: refreshes entries a little before their TTL runs
/// out so the hot-path `get` almost always hits warm data. Failures are logged
/// and retried on the next pass, never surfaced to the monitor.
pub fn spawn_prefetch(cache: Arc<MarketDataCache>, lead: Duration) -> PrefetchHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {
                    tracing::debug!("Pre-fetch task stopping");
                    return;
                }
            }

            for (symbol, timeframe) in cache.keys_expiring_within(lead).await {
                if let Err(e) = cache.refresh_forced(&symbol, timeframe).await {
                    tracing::warn!(
                        symbol = %symbol,
                        timeframe = timeframe.as_str(),
                        "Pre-fetch failed: {}",
                        e
                    );
                }
            }
        }
    });

    PrefetchHandle { shutdown, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    use crate::models::Quote;

    struct CountingProvider {
        calls: AtomicU32,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self { calls: AtomicU32::new(0) }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataProvider for CountingProvider {
        async fn get_candles(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            count: u32,
        ) -> Result<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Latest candle is the most recently completed bucket
            let latest = last_closed_open(Utc::now(), timeframe);
            let mut candles = Vec::new();
            for i in (0..count.min(5)).rev() {
                let ts = latest - chrono::Duration::seconds(timeframe.secs() as i64 * i as i64);
                candles.push(Candle {
                    symbol: symbol.to_string(),
                    timestamp: ts,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.5,
                    volume: 10.0,
                });
            }
            Ok(candles)
        }

        async fn get_quote(&self, symbol: &str) -> Result<Quote> {
            Ok(Quote {
                symbol: symbol.to_string(),
                bid: 100.0,
                ask: 100.2,
                timestamp: Utc::now(),
            })
        }
    }

    fn entry_with(latest_secs_ago: i64, fetched_secs_ago: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            candles: Arc::new(Vec::new()),
            fetched_at: now - chrono::Duration::seconds(fetched_secs_ago),
            latest_candle: Some(now - chrono::Duration::seconds(latest_secs_ago)),
        }
    }

    #[test]
    fn test_new_closed_candle_invalidates() {
        let now = Utc::now();
        let tf = Timeframe::M1;
        // Entry fetched just now but whose newest candle is two buckets old
        let entry = entry_with(180, 1);
        assert!(entry.latest_candle.unwrap() < last_closed_open(now, tf));
        assert!(!entry_is_fresh(&entry, now, tf, Duration::from_secs(30)));
    }

    #[test]
    fn test_ttl_bounds_staleness() {
        let now = Utc::now();
        let tf = Timeframe::H1;
        let latest = last_closed_open(now, tf);
        let entry = CacheEntry {
            candles: Arc::new(Vec::new()),
            fetched_at: now - chrono::Duration::seconds(45),
            latest_candle: Some(latest),
        };
        // Candle-wise current, but past the 30s TTL
        assert!(!entry_is_fresh(&entry, now, tf, Duration::from_secs(30)));
        // Within TTL it is fresh
        let recent = CacheEntry {
            fetched_at: now - chrono::Duration::seconds(5),
            ..entry
        };
        assert!(entry_is_fresh(&recent, now, tf, Duration::from_secs(30)));
    }

    #[test]
    fn test_empty_series_is_never_fresh() {
        let now = Utc::now();
        let entry = CacheEntry {
            candles: Arc::new(Vec::new()),
            fetched_at: now,
            latest_candle: None,
        };
        assert!(!entry_is_fresh(&entry, now, Timeframe::M5, Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_provider() {
        let provider = Arc::new(CountingProvider::new());
        let cache = MarketDataCache::new(provider.clone(), Duration::from_secs(30), 5, true);

        let (first, _) = cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(provider.calls(), 1);

        // Second read within TTL and same candle: served from cache
        let (second, _) = cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        assert_eq!(second.len(), first.len());
        assert_eq!(provider.calls(), 1);
        assert_eq!(cache.stats.hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_caching_disabled_always_refreshes() {
        let provider = Arc::new(CountingProvider::new());
        let cache = MarketDataCache::new(provider.clone(), Duration::from_secs(30), 5, false);

        cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_single_flight() {
        let provider = Arc::new(CountingProvider::new());
        let cache = Arc::new(MarketDataCache::new(
            provider.clone(),
            Duration::from_secs(30),
            5,
            true,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get("BTCUSD", Timeframe::H1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // All callers were served by at most one fetch (the losers of the
        // flight lock re-check freshness and return the winner's data)
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_retain_symbols_drops_stale_entries() {
        let provider = Arc::new(CountingProvider::new());
        let cache = MarketDataCache::new(provider.clone(), Duration::from_secs(30), 5, true);

        cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        cache.get("ETHUSD", Timeframe::H1).await.unwrap();

        cache.retain_symbols(&["BTCUSD".to_string()]).await;

        // ETHUSD must be refetched, BTCUSD still cached
        cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        assert_eq!(provider.calls(), 2);
        cache.get("ETHUSD", Timeframe::H1).await.unwrap();
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_forced_refresh_refetches_fresh_entry() {
        let provider = Arc::new(CountingProvider::new());
        let cache = MarketDataCache::new(provider.clone(), Duration::from_secs(30), 5, true);

        cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        assert_eq!(provider.calls(), 1);

        // Entry is fresh, yet the forced path must still hit the provider
        cache.refresh_forced("BTCUSD", Timeframe::H1).await.unwrap();
        assert_eq!(provider.calls(), 2);

        // The plain path still serves the (now renewed) entry from cache
        cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_renews_entry_before_ttl() {
        let provider = Arc::new(CountingProvider::new());
        let ttl = Duration::from_secs(3);
        let cache = Arc::new(MarketDataCache::new(provider.clone(), ttl, 5, true));

        cache.get("BTCUSD", Timeframe::H1).await.unwrap();
        assert_eq!(provider.calls(), 1);

        // Lead 2s on a 3s TTL: the entry enters the pre-fetch window at age
        // 1s, well before it goes stale
        let handle = spawn_prefetch(cache.clone(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(1800)).await;
        handle.stop().await;

        assert!(
            provider.calls() >= 2,
            "no refresh inside the lead window (calls={})",
            provider.calls()
        );
    }
}
