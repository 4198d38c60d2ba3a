//! Monitor configuration
//!
//! Loads from an optional TOML file plus `PLANWATCH_`-prefixed environment
//! variables via .env. Every optimisation feature ships disabled; the monitor
//! is correct with all flags off, just busier.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::Result;

/// Independently togglable optimisation layers. All default off.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureFlags {
    /// Per-plan cadence from category x price proximity
    pub adaptive_intervals: bool,
    /// Candle-close aware caching with background pre-fetch
    pub smart_caching: bool,
    /// Proximity pre-filter before the evaluator call
    pub conditional_checks: bool,
    /// One batched quote call per tick instead of per-symbol calls
    pub batch_operations: bool,
}

/// Close/base/far check intervals for one scheduling category, in seconds
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IntervalTiers {
    pub close_secs: u64,
    pub base_secs: u64,
    pub far_secs: u64,
}

impl IntervalTiers {
    pub const FAST_DEFAULT: IntervalTiers = IntervalTiers {
        close_secs: 5,
        base_secs: 10,
        far_secs: 30,
    };
    pub const STANDARD_DEFAULT: IntervalTiers = IntervalTiers {
        close_secs: 20,
        base_secs: 30,
        far_secs: 60,
    };
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub fast: IntervalTiers,
    pub standard: IntervalTiers,
    /// "base" tier reaches out to proximity_multiplier x tolerance from entry
    pub proximity_multiplier: f64,
    /// Fallback when interval math fails or adaptive intervals are off
    pub default_interval_secs: u64,
    /// No gate or pre-filter may keep a plan unevaluated longer than this
    pub recheck_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Secondary staleness bound for quote-only reads
    pub ttl_secs: u64,
    /// Pre-fetch runs this many seconds before TTL expiry
    pub prefetch_lead_secs: u64,
    /// Candles fetched per (symbol, timeframe) series
    pub candle_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Base sleep between ticks; per-plan cadence comes from the scheduler
    pub tick_secs: u64,
    /// Hard bound on a single evaluator call
    pub evaluator_timeout_secs: u64,
    /// Retries of the executed-transition after a successful fill
    pub transition_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: Option<String>,
    pub market_data_url: String,
    pub broker_url: String,
    /// Lot size submitted with every order
    pub order_volume: f64,
    pub features: FeatureFlags,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
}

impl Settings {
    /// Load configuration from `planwatch.toml` (if present) and environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("market_data_url", "http://127.0.0.1:8700")?
            .set_default("broker_url", "http://127.0.0.1:8701")?
            .set_default("order_volume", 0.1)?
            // Features: all optimisations off by default
            .set_default("features.adaptive_intervals", false)?
            .set_default("features.smart_caching", false)?
            .set_default("features.conditional_checks", false)?
            .set_default("features.batch_operations", false)?
            // Scheduler defaults
            .set_default("scheduler.fast.close_secs", 5)?
            .set_default("scheduler.fast.base_secs", 10)?
            .set_default("scheduler.fast.far_secs", 30)?
            .set_default("scheduler.standard.close_secs", 20)?
            .set_default("scheduler.standard.base_secs", 30)?
            .set_default("scheduler.standard.far_secs", 60)?
            .set_default("scheduler.proximity_multiplier", 2.0)?
            .set_default("scheduler.default_interval_secs", 30)?
            .set_default("scheduler.recheck_secs", 300)?
            // Cache defaults
            .set_default("cache.ttl_secs", 20)?
            .set_default("cache.prefetch_lead_secs", 5)?
            .set_default("cache.candle_count", 100)?
            // Monitor defaults
            .set_default("monitor.tick_secs", 5)?
            .set_default("monitor.evaluator_timeout_secs", 3)?
            .set_default("monitor.transition_retries", 3)?
            .add_source(File::with_name("planwatch").required(false))
            .add_source(Environment::with_prefix("PLANWATCH").separator("__"))
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        if settings.database_url.is_none() {
            settings.database_url = std::env::var("DATABASE_URL").ok();
        }
        settings.validate_or_defaults();
        Ok(settings)
    }

    /// Bad interval tuning degrades to hard-coded defaults rather than
    /// failing startup. Logged once here.
    fn validate_or_defaults(&mut self) {
        if !tiers_valid(&self.scheduler.fast) {
            tracing::warn!("invalid fast interval config, using defaults");
            self.scheduler.fast = IntervalTiers::FAST_DEFAULT;
        }
        if !tiers_valid(&self.scheduler.standard) {
            tracing::warn!("invalid standard interval config, using defaults");
            self.scheduler.standard = IntervalTiers::STANDARD_DEFAULT;
        }
        if self.scheduler.proximity_multiplier < 1.0 {
            tracing::warn!(
                multiplier = self.scheduler.proximity_multiplier,
                "proximity multiplier below 1.0, using 2.0"
            );
            self.scheduler.proximity_multiplier = 2.0;
        }
        if self.monitor.tick_secs == 0 {
            tracing::warn!("tick interval of zero, using 5s");
            self.monitor.tick_secs = 5;
        }
        if !self.order_volume.is_finite() || self.order_volume <= 0.0 {
            tracing::warn!(volume = self.order_volume, "invalid order volume, using 0.1");
            self.order_volume = 0.1;
        }
        if self.cache.prefetch_lead_secs >= self.cache.ttl_secs {
            tracing::warn!("prefetch lead >= ttl, clamping to ttl/2");
            self.cache.prefetch_lead_secs = self.cache.ttl_secs / 2;
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.tick_secs)
    }

    pub fn evaluator_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.evaluator_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn prefetch_lead(&self) -> Duration {
        Duration::from_secs(self.cache.prefetch_lead_secs)
    }
}

fn tiers_valid(t: &IntervalTiers) -> bool {
    t.close_secs > 0 && t.close_secs <= t.base_secs && t.base_secs <= t.far_secs
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            market_data_url: "http://127.0.0.1:8700".to_string(),
            broker_url: "http://127.0.0.1:8701".to_string(),
            order_volume: 0.1,
            features: FeatureFlags {
                adaptive_intervals: false,
                smart_caching: false,
                conditional_checks: false,
                batch_operations: false,
            },
            scheduler: SchedulerConfig {
                fast: IntervalTiers::FAST_DEFAULT,
                standard: IntervalTiers::STANDARD_DEFAULT,
                proximity_multiplier: 2.0,
                default_interval_secs: 30,
                recheck_secs: 300,
            },
            cache: CacheConfig {
                ttl_secs: 20,
                prefetch_lead_secs: 5,
                candle_count: 100,
            },
            monitor: MonitorConfig {
                tick_secs: 5,
                evaluator_timeout_secs: 3,
                transition_retries: 3,
            },
        }
    }
}
