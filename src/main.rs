use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use planwatch::config::Settings;
use planwatch::db::{MemoryPlanStore, PlanRepository, PlanStore};
use planwatch::evaluator::{ConditionEvaluator, TriggerTouchEvaluator};
use planwatch::execution::{BrokerClient, ExecutionGateway, PaperGateway};
use planwatch::market::{spawn_prefetch, HttpMarketData, MarketDataCache, MarketDataProvider};
use planwatch::monitor::{spawn_supervised, Monitor};
use planwatch::sync::TradePlanSync;
use planwatch::Result;

#[derive(Parser)]
#[command(name = "planwatch", about = "Conditional trade-plan monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor loop (default)
    Run {
        /// Perform a single tick and exit
        #[arg(long)]
        once: bool,
        /// Paper execution against an in-memory store, no broker calls
        #[arg(long)]
        dry_run: bool,
    },
    /// Merge closed journal trades back onto their plans
    Sync {
        /// Look back this many hours for closed trades
        #[arg(long, default_value_t = 24)]
        since_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command.unwrap_or(Command::Run {
        once: false,
        dry_run: false,
    }) {
        Command::Run { once, dry_run } => run_monitor(settings, once, dry_run).await,
        Command::Sync { since_hours } => run_sync(settings, since_hours).await,
    }
}

async fn run_monitor(settings: Settings, once: bool, dry_run: bool) -> Result<()> {
    tracing::info!(once, dry_run, "planwatch starting");

    let provider: Arc<dyn MarketDataProvider> =
        Arc::new(HttpMarketData::new(&settings.market_data_url));
    let cache = Arc::new(MarketDataCache::new(
        provider.clone(),
        settings.cache_ttl(),
        settings.cache.candle_count,
        settings.features.smart_caching,
    ));
    let evaluator: Arc<dyn ConditionEvaluator> = Arc::new(TriggerTouchEvaluator);

    let repo: Arc<dyn PlanRepository> = if dry_run {
        tracing::info!("Dry run: in-memory plan store, paper fills");
        Arc::new(MemoryPlanStore::new())
    } else {
        Arc::new(PlanStore::connect(&require_database_url(&settings)?).await?)
    };
    let gateway: Arc<dyn ExecutionGateway> = if dry_run {
        Arc::new(PaperGateway::new())
    } else {
        Arc::new(BrokerClient::new(
            &settings.broker_url,
            settings.order_volume,
        ))
    };

    let prefetch = settings
        .features
        .smart_caching
        .then(|| spawn_prefetch(cache.clone(), settings.prefetch_lead()));

    if once {
        let mut monitor = Monitor::new(repo, cache, provider, evaluator, gateway, settings);
        let report = monitor.tick().await?;
        tracing::info!(?report, "Single tick complete");
    } else {
        let handle = spawn_supervised(repo, cache, provider, evaluator, gateway, settings);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
            }
            result = handle => {
                tracing::warn!("Monitor supervisor exited: {:?}", result);
            }
        }
    }

    if let Some(prefetch) = prefetch {
        prefetch.stop().await;
    }
    Ok(())
}

async fn run_sync(settings: Settings, since_hours: i64) -> Result<()> {
    let store = PlanStore::connect(&require_database_url(&settings)?).await?;
    let sync = TradePlanSync::new(store.pool().clone());

    let since = Utc::now() - ChronoDuration::hours(since_hours);
    let report = sync.sync(since).await?;
    tracing::info!(
        updated = report.updated,
        errors = report.errors,
        "Sync complete"
    );
    Ok(())
}

fn require_database_url(settings: &Settings) -> Result<String> {
    settings
        .database_url
        .clone()
        .ok_or_else(|| "DATABASE_URL not set (use --dry-run for an in-memory store)".into())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planwatch=info".into()),
        )
        .init();
}
