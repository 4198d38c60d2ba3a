// Market data module: provider clients and the shared cache
pub mod cache;
pub mod provider;

pub use cache::{spawn_prefetch, CacheStats, MarketDataCache, PrefetchHandle};
pub use provider::{HttpMarketData, MarketDataProvider};
