//! Monitor loop
//!
//! One tick walks every pending plan in a fixed order: bulk expiry first,
//! then per plan stop-invalidation, periodic recheck trigger, scheduler gate,
//! proximity pre-filter, condition evaluation, and finally order submission
//! plus the terminal transition. Safety checks and the recheck trigger always
//! run before optimisation gates, so no flag combination can keep an expired
//! or invalidated plan alive or starve one of evaluation indefinitely.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{PlanRepository, TransitionFields, TransitionOutcome};
use crate::evaluator::ConditionEvaluator;
use crate::execution::{ExecutionGateway, GatewayError};
use crate::market::{MarketDataCache, MarketDataProvider};
use crate::models::{MarketSnapshot, PlanStatus, Quote, TradePlan};
use crate::scheduler::AdaptiveScheduler;
use crate::Result;

const TRANSITION_RETRY_DELAY_MS: u64 = 200;
const CRASH_RESTART_DELAY_SECS: u64 = 5;

/// What one tick did. Returned for logging and for single-shot runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub pending: usize,
    pub expired: u64,
    pub cancelled: u64,
    pub evaluated: u32,
    pub executed: u32,
    pub skipped: u32,
}

pub struct Monitor {
    repo: Arc<dyn PlanRepository>,
    cache: Arc<MarketDataCache>,
    quotes: Arc<dyn MarketDataProvider>,
    evaluator: Arc<dyn ConditionEvaluator>,
    gateway: Arc<dyn ExecutionGateway>,
    scheduler: AdaptiveScheduler,
    settings: Settings,
    /// Fills whose executed transition has not stuck yet. A plan in here is
    /// never re-submitted; each tick retries the transition instead.
    unreconciled: HashMap<Uuid, TransitionFields>,
    ticks: u64,
}

impl Monitor {
    pub fn new(
        repo: Arc<dyn PlanRepository>,
        cache: Arc<MarketDataCache>,
        quotes: Arc<dyn MarketDataProvider>,
        evaluator: Arc<dyn ConditionEvaluator>,
        gateway: Arc<dyn ExecutionGateway>,
        settings: Settings,
    ) -> Self {
        let scheduler = AdaptiveScheduler::new(
            settings.scheduler.clone(),
            settings.features.adaptive_intervals,
        );
        Self {
            repo,
            cache,
            quotes,
            evaluator,
            gateway,
            scheduler,
            settings,
            unreconciled: HashMap::new(),
            ticks: 0,
        }
    }

    /// Fills still waiting for their executed transition to stick
    pub fn unreconciled_fills(&self) -> usize {
        self.unreconciled.len()
    }

    /// One full pass over the pending set
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let now = Utc::now();
        self.ticks += 1;

        // Expiry runs before anything can fail or filter
        report.expired = self.repo.expire_due(now).await?;
        if report.expired > 0 {
            info!(count = report.expired, "Expired overdue plans");
        }

        let pending = self.repo.load_pending().await?;
        report.pending = pending.len();

        let active: HashSet<_> = pending.iter().map(|p| p.plan_id).collect();
        self.scheduler.retain(&active);
        // A fill record for a plan no longer pending was settled elsewhere
        self.unreconciled.retain(|id, _| active.contains(id));

        let symbols: Vec<String> = {
            let mut s: Vec<String> = pending.iter().map(|p| p.symbol.clone()).collect();
            s.sort();
            s.dedup();
            s
        };
        self.cache.retain_symbols(&symbols).await;

        if pending.is_empty() {
            return Ok(report);
        }

        let quotes = self.fetch_quotes(&symbols).await;

        for plan in &pending {
            // A fill already exists for this plan; only the transition is
            // outstanding. Retry it, never the submission.
            if let Some(fields) = self.unreconciled.get(&plan.plan_id).cloned() {
                match self
                    .repo
                    .transition(plan.plan_id, PlanStatus::Executed, fields)
                    .await
                {
                    Ok(TransitionOutcome::Applied) => {
                        info!(plan_id = %plan.plan_id, "Executed transition reconciled");
                        report.executed += 1;
                        self.unreconciled.remove(&plan.plan_id);
                        self.scheduler.forget(plan.plan_id);
                    }
                    Ok(outcome) => {
                        warn!(plan_id = %plan.plan_id, ?outcome, "Plan terminal elsewhere, dropping fill record");
                        self.unreconciled.remove(&plan.plan_id);
                        self.scheduler.forget(plan.plan_id);
                    }
                    Err(e) => {
                        error!(
                            plan_id = %plan.plan_id,
                            reconciliation_required = true,
                            "Executed transition still failing: {}",
                            e
                        );
                    }
                }
                continue;
            }

            let Some(quote) = quotes.get(&plan.symbol) else {
                // No price this tick; plan is retried next tick untouched
                warn!(plan_id = %plan.plan_id, symbol = %plan.symbol, "No quote, skipping plan");
                report.skipped += 1;
                continue;
            };
            let price = quote.mid();

            if plan.is_invalidated_by(price) {
                if self
                    .repo
                    .transition(
                        plan.plan_id,
                        PlanStatus::Cancelled,
                        TransitionFields::reason("stop_invalidated"),
                    )
                    .await?
                    == TransitionOutcome::Applied
                {
                    info!(
                        plan_id = %plan.plan_id,
                        symbol = %plan.symbol,
                        price,
                        stop = plan.stop_loss,
                        "Plan invalidated by stop touch, cancelled"
                    );
                    report.cancelled += 1;
                    self.scheduler.forget(plan.plan_id);
                }
                continue;
            }

            // Overdue plans bypass both optimisation gates below
            let recheck_due = self.scheduler.recheck_due(plan, now);

            if !recheck_due {
                if !self.scheduler.should_check(plan, now, price) {
                    report.skipped += 1;
                    continue;
                }
                if self.settings.features.conditional_checks && self.scheduler.too_far(plan, price)
                {
                    report.skipped += 1;
                    continue;
                }
            }

            match self.evaluate(plan, quote).await {
                Ok(true) => {
                    report.evaluated += 1;
                    self.scheduler.record_checked(plan.plan_id, now, price);
                    if self.execute(plan).await {
                        report.executed += 1;
                        self.scheduler.forget(plan.plan_id);
                    }
                }
                Ok(false) => {
                    report.evaluated += 1;
                    self.scheduler.record_checked(plan.plan_id, now, price);
                }
                // Evaluator trouble is isolated to this plan; the attempt
                // still counts against the cadence so a broken evaluator is
                // not hammered every tick
                Err(e) => {
                    warn!(plan_id = %plan.plan_id, "Evaluation failed: {}", e);
                    self.scheduler.record_checked(plan.plan_id, now, price);
                    report.skipped += 1;
                }
            }
        }

        if self.ticks % 60 == 0 {
            debug!(
                hits = self.cache.stats.hits.load(Ordering::Relaxed),
                misses = self.cache.stats.misses.load(Ordering::Relaxed),
                tracked = self.scheduler.tracked_plans(),
                "Cache and scheduler stats"
            );
        }

        Ok(report)
    }

    async fn fetch_quotes(&self, symbols: &[String]) -> HashMap<String, Quote> {
        if self.settings.features.batch_operations {
            match self.quotes.get_quotes(symbols).await {
                Ok(quotes) => {
                    return quotes.into_iter().map(|q| (q.symbol.clone(), q)).collect();
                }
                Err(e) => {
                    warn!("Batched quote fetch failed, falling back to per-symbol: {}", e);
                }
            }
        }

        let mut quotes = HashMap::new();
        for symbol in symbols {
            match self.quotes.get_quote(symbol).await {
                Ok(quote) => {
                    quotes.insert(symbol.clone(), quote);
                }
                Err(e) => warn!(symbol = %symbol, "Quote fetch failed: {}", e),
            }
        }
        quotes
    }

    async fn evaluate(&self, plan: &TradePlan, quote: &Quote) -> Result<bool> {
        let (candles, as_of) = self.cache.get(&plan.symbol, plan.timeframe).await?;
        let snapshot = MarketSnapshot {
            symbol: plan.symbol.clone(),
            candles: candles.as_ref().clone(),
            quote: quote.clone(),
            as_of,
        };

        match timeout(
            self.settings.evaluator_timeout(),
            self.evaluator.evaluate(plan, &snapshot),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!(
                "evaluator timed out after {:?}",
                self.settings.evaluator_timeout()
            )
            .into()),
        }
    }

    /// Submit the order and persist the executed transition. Returns true only
    /// when the transition was applied by this call.
    async fn execute(&mut self, plan: &TradePlan) -> bool {
        let fill = match self.gateway.submit(plan).await {
            Ok(fill) => fill,
            Err(GatewayError::Rejected(reason)) => {
                // Rejections can clear (margin frees up); the plan stays
                // pending and the next qualifying tick retries
                warn!(plan_id = %plan.plan_id, "Order rejected: {}", reason);
                return false;
            }
            Err(e) => {
                error!(plan_id = %plan.plan_id, "Order submission failed: {}", e);
                return false;
            }
        };

        let fields = TransitionFields::from_fill(&fill);
        for attempt in 1..=self.settings.monitor.transition_retries {
            match self
                .repo
                .transition(plan.plan_id, PlanStatus::Executed, fields.clone())
                .await
            {
                Ok(TransitionOutcome::Applied) => {
                    info!(
                        plan_id = %plan.plan_id,
                        symbol = %plan.symbol,
                        ticket = fill.ticket,
                        price = fill.executed_price,
                        "Plan executed"
                    );
                    return true;
                }
                Ok(outcome) => {
                    // The fill is live but someone else already moved the plan
                    // out of pending. Needs a human or the sync job.
                    error!(
                        plan_id = %plan.plan_id,
                        ticket = fill.ticket,
                        ?outcome,
                        reconciliation_required = true,
                        "Fill obtained but executed transition lost the race"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(
                        plan_id = %plan.plan_id,
                        "Transition attempt {}/{} failed: {}",
                        attempt,
                        self.settings.monitor.transition_retries,
                        e
                    );
                    if attempt < self.settings.monitor.transition_retries {
                        sleep(Duration::from_millis(TRANSITION_RETRY_DELAY_MS)).await;
                    }
                }
            }
        }

        error!(
            plan_id = %plan.plan_id,
            ticket = fill.ticket,
            reconciliation_required = true,
            "Order filled but plan could not be marked executed"
        );
        self.unreconciled.insert(plan.plan_id, fields);
        false
    }

    /// Tick forever. Per-tick errors are logged and the next tick proceeds.
    pub async fn run(mut self) {
        let mut ticker = interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_secs = self.settings.monitor.tick_secs,
            adaptive = self.settings.features.adaptive_intervals,
            caching = self.settings.features.smart_caching,
            "Monitor loop started"
        );

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(report) if report.executed > 0 || report.cancelled > 0 || report.expired > 0 => {
                    info!(?report, "Tick complete");
                }
                Ok(report) => debug!(?report, "Tick complete"),
                Err(e) => error!("Tick failed: {}", e),
            }
        }
    }
}

/// Run the monitor under a supervisor: if the loop task panics it is
/// restarted with a fresh scheduler. Scheduler state is advisory and is
/// rebuilt from the store as plans are next seen.
pub fn spawn_supervised(
    repo: Arc<dyn PlanRepository>,
    cache: Arc<MarketDataCache>,
    quotes: Arc<dyn MarketDataProvider>,
    evaluator: Arc<dyn ConditionEvaluator>,
    gateway: Arc<dyn ExecutionGateway>,
    settings: Settings,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let monitor = Monitor::new(
                repo.clone(),
                cache.clone(),
                quotes.clone(),
                evaluator.clone(),
                gateway.clone(),
                settings.clone(),
            );
            let handle = tokio::spawn(monitor.run());
            match handle.await {
                Ok(()) => return,
                Err(e) => {
                    error!("Monitor loop crashed: {}. Restarting...", e);
                    sleep(Duration::from_secs(CRASH_RESTART_DELAY_SECS)).await;
                }
            }
        }
    })
}
