// Adaptive check scheduling: decides how soon each plan must be re-evaluated.
//
// Strictly an optimisation layer. Every decision here degrades to a fixed
// default interval on error, and none of it may defer expiry or cancellation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::models::TradePlan;

/// Scheduling class, derived once from timeframe + condition set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Fast,
    Standard,
}

/// Proximity tier relative to the entry trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityTier {
    Close,
    Base,
    Far,
}

/// Per-plan scheduling bookkeeping. Memory-only side-table, rebuildable from
/// nothing after a crash; carries no authoritative data.
#[derive(Debug, Clone)]
struct PlanBookkeeping {
    last_checked_at: Option<DateTime<Utc>>,
    last_known_price: Option<f64>,
    category: Category,
}

/// Pure classification: sub-minute plans and plans with any price-reactive
/// condition need the fast cadence.
pub fn classify(plan: &TradePlan) -> Category {
    if plan.timeframe.is_sub_minute() || plan.conditions.iter().any(|c| c.is_price_reactive()) {
        Category::Fast
    } else {
        Category::Standard
    }
}

/// Which tier the current price falls in, given the plan's tolerance
pub fn proximity_tier(
    price: f64,
    entry_price: f64,
    tolerance: f64,
    proximity_multiplier: f64,
) -> ProximityTier {
    let distance = (price - entry_price).abs();
    if distance <= tolerance {
        ProximityTier::Close
    } else if distance <= tolerance * proximity_multiplier {
        ProximityTier::Base
    } else {
        ProximityTier::Far
    }
}

pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    adaptive_enabled: bool,
    bookkeeping: HashMap<Uuid, PlanBookkeeping>,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig, adaptive_enabled: bool) -> Self {
        Self {
            config,
            adaptive_enabled,
            bookkeeping: HashMap::new(),
        }
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.config.default_interval_secs)
    }

    /// Category for a plan, computed once and cached for its lifetime
    pub fn category(&mut self, plan: &TradePlan) -> Category {
        self.entry(plan).category
    }

    fn entry(&mut self, plan: &TradePlan) -> &mut PlanBookkeeping {
        self.bookkeeping
            .entry(plan.plan_id)
            .or_insert_with(|| PlanBookkeeping {
                last_checked_at: None,
                last_known_price: None,
                category: classify(plan),
            })
    }

    /// Check interval for a plan at the given price
    pub fn interval(&mut self, plan: &TradePlan, price: f64) -> Duration {
        if !self.adaptive_enabled {
            return self.default_interval();
        }
        if !price.is_finite() || !plan.tolerance.is_finite() || plan.tolerance <= 0.0 {
            // Degraded input: fall back rather than guess
            return self.default_interval();
        }

        let tiers = match self.category(plan) {
            Category::Fast => self.config.fast,
            Category::Standard => self.config.standard,
        };
        let secs = match proximity_tier(
            price,
            plan.entry_price,
            plan.tolerance,
            self.config.proximity_multiplier,
        ) {
            ProximityTier::Close => tiers.close_secs,
            ProximityTier::Base => tiers.base_secs,
            ProximityTier::Far => tiers.far_secs,
        };
        Duration::from_secs(secs)
    }

    /// Unconditional periodic trigger: true when the plan has gone
    /// `recheck_secs` without a genuine evaluation, or has never had one.
    /// Overrides the gate and the proximity pre-filter so neither can starve
    /// a plan indefinitely.
    pub fn recheck_due(&mut self, plan: &TradePlan, now: DateTime<Utc>) -> bool {
        let recheck = Duration::from_secs(self.config.recheck_secs);
        let Some(last) = self.entry(plan).last_checked_at else {
            return true;
        };
        match now.signed_duration_since(last).to_std() {
            Ok(elapsed) => elapsed >= recheck,
            Err(_) => true,
        }
    }

    /// True iff the plan is due for evaluation this tick.
    ///
    /// Consulted only after unconditional expiry/cancellation checks; a plan
    /// that has never been checked is always due. With adaptive intervals off
    /// there is no gate at all and every tick evaluates.
    pub fn should_check(&mut self, plan: &TradePlan, now: DateTime<Utc>, price: f64) -> bool {
        if !self.adaptive_enabled {
            return true;
        }
        let interval = self.interval(plan, price);
        let Some(last) = self.entry(plan).last_checked_at else {
            return true;
        };
        match now.signed_duration_since(last).to_std() {
            Ok(elapsed) => elapsed >= interval,
            // Clock went backwards; check rather than starve
            Err(_) => true,
        }
    }

    /// True iff the plan's price is too far from entry to be worth an
    /// evaluator call, independent of timing. Never suppresses expiry.
    pub fn too_far(&self, plan: &TradePlan, price: f64) -> bool {
        if !price.is_finite() || plan.tolerance <= 0.0 {
            return false;
        }
        proximity_tier(
            price,
            plan.entry_price,
            plan.tolerance,
            self.config.proximity_multiplier,
        ) == ProximityTier::Far
    }

    /// Record a genuine evaluation. Must not be called for skipped plans, or
    /// the interval math drifts and a plan can be starved.
    pub fn record_checked(&mut self, plan_id: Uuid, now: DateTime<Utc>, price: f64) {
        if let Some(entry) = self.bookkeeping.get_mut(&plan_id) {
            entry.last_checked_at = Some(now);
            entry.last_known_price = Some(price);
        }
    }

    /// Drop bookkeeping for a plan that reached a terminal state
    pub fn forget(&mut self, plan_id: Uuid) {
        self.bookkeeping.remove(&plan_id);
    }

    /// Keep bookkeeping only for the given plans. Called once per tick with
    /// the current pending set so terminal plans do not accumulate here.
    pub fn retain(&mut self, active: &std::collections::HashSet<Uuid>) {
        self.bookkeeping.retain(|id, _| active.contains(id));
    }

    pub fn tracked_plans(&self) -> usize {
        self.bookkeeping.len()
    }

    /// Price seen at the plan's last recorded check
    pub fn last_known_price(&self, plan_id: Uuid) -> Option<f64> {
        self.bookkeeping.get(&plan_id)?.last_known_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{Condition, Direction, Timeframe};
    use chrono::Duration as ChronoDuration;

    fn fast_plan(entry: f64, tolerance: f64) -> TradePlan {
        TradePlan::new(
            "BTCUSD",
            Direction::Long,
            entry,
            entry * 0.99,
            vec![entry * 1.01],
            vec![Condition::LiquiditySweep { lookback_candles: 20 }],
            Timeframe::M1,
            tolerance,
            Utc::now() + ChronoDuration::hours(4),
        )
        .unwrap()
    }

    fn standard_plan(entry: f64, tolerance: f64) -> TradePlan {
        TradePlan::new(
            "BTCUSD",
            Direction::Long,
            entry,
            entry * 0.99,
            vec![entry * 1.01],
            vec![Condition::StructureBreak { level: entry }],
            Timeframe::H1,
            tolerance,
            Utc::now() + ChronoDuration::hours(4),
        )
        .unwrap()
    }

    fn scheduler(adaptive: bool) -> AdaptiveScheduler {
        AdaptiveScheduler::new(Settings::default().scheduler, adaptive)
    }

    #[test]
    fn test_classify_price_reactive_is_fast() {
        assert_eq!(classify(&fast_plan(90000.0, 50.0)), Category::Fast);
        assert_eq!(classify(&standard_plan(90000.0, 50.0)), Category::Standard);
    }

    #[test]
    fn test_classify_sub_minute_is_fast() {
        let mut plan = standard_plan(90000.0, 50.0);
        plan.timeframe = Timeframe::S15;
        assert_eq!(classify(&plan), Category::Fast);
    }

    #[test]
    fn test_fast_tiers_at_90000() {
        let mut sched = scheduler(true);
        let plan = fast_plan(90000.0, 50.0);

        // |90010 - 90000| = 10 <= 50: close tier
        assert_eq!(sched.interval(&plan, 90010.0), Duration::from_secs(5));
        // |90090 - 90000| = 90 <= 100: base tier
        assert_eq!(sched.interval(&plan, 90090.0), Duration::from_secs(10));
        // |90300 - 90000| = 300 > 100: far tier
        assert_eq!(sched.interval(&plan, 90300.0), Duration::from_secs(30));
    }

    #[test]
    fn test_standard_tiers() {
        let mut sched = scheduler(true);
        let plan = standard_plan(90000.0, 50.0);

        assert_eq!(sched.interval(&plan, 90010.0), Duration::from_secs(20));
        assert_eq!(sched.interval(&plan, 90090.0), Duration::from_secs(30));
        assert_eq!(sched.interval(&plan, 90300.0), Duration::from_secs(60));
    }

    #[test]
    fn test_adaptive_disabled_uses_default_interval() {
        let mut sched = scheduler(false);
        let plan = fast_plan(90000.0, 50.0);
        assert_eq!(sched.interval(&plan, 90010.0), Duration::from_secs(30));
    }

    #[test]
    fn test_degraded_input_falls_back_to_default() {
        let mut sched = scheduler(true);
        let plan = fast_plan(90000.0, 50.0);
        assert_eq!(sched.interval(&plan, f64::NAN), sched.default_interval());
    }

    #[test]
    fn test_adaptive_disabled_never_gates() {
        let mut sched = scheduler(false);
        let plan = fast_plan(4326.0, 0.3);
        let t0 = Utc::now();

        sched.category(&plan);
        sched.record_checked(plan.plan_id, t0, 4326.1);

        // Checked a moment ago, still due: the gate only exists when the
        // adaptive layer is on
        assert!(sched.should_check(&plan, t0 + ChronoDuration::seconds(1), 4326.1));
    }

    #[test]
    fn test_never_checked_plan_is_due() {
        let mut sched = scheduler(true);
        let plan = fast_plan(4326.0, 0.3);
        assert!(sched.should_check(&plan, Utc::now(), 4326.1));
    }

    #[test]
    fn test_should_check_waits_out_interval() {
        let mut sched = scheduler(true);
        let plan = fast_plan(4326.0, 0.3);
        let t0 = Utc::now();

        sched.category(&plan);
        sched.record_checked(plan.plan_id, t0, 4326.1);
        assert_eq!(sched.last_known_price(plan.plan_id), Some(4326.1));

        // Close tier = 5s: not due at +2s, due at +5s
        assert!(!sched.should_check(&plan, t0 + ChronoDuration::seconds(2), 4326.1));
        assert!(sched.should_check(&plan, t0 + ChronoDuration::seconds(5), 4326.1));
    }

    #[test]
    fn test_skipped_plans_do_not_advance_clock() {
        let mut sched = scheduler(true);
        let plan = fast_plan(4326.0, 0.3);
        let t0 = Utc::now();

        sched.category(&plan);
        sched.record_checked(plan.plan_id, t0, 4326.1);
        // No record_checked for the skipped ticks in between
        assert!(sched.should_check(&plan, t0 + ChronoDuration::seconds(6), 4326.1));
    }

    #[test]
    fn test_recheck_due_bounds_staleness() {
        let mut sched = scheduler(true);
        let plan = fast_plan(90000.0, 50.0);
        let t0 = Utc::now();

        // Never evaluated: due immediately
        assert!(sched.recheck_due(&plan, t0));

        sched.record_checked(plan.plan_id, t0, 95000.0);
        assert!(!sched.recheck_due(&plan, t0 + ChronoDuration::seconds(299)));
        assert!(sched.recheck_due(&plan, t0 + ChronoDuration::seconds(300)));
    }

    #[test]
    fn test_too_far_prefilter() {
        let sched = scheduler(true);
        let plan = fast_plan(90000.0, 50.0);

        assert!(!sched.too_far(&plan, 90010.0));
        assert!(!sched.too_far(&plan, 90090.0));
        assert!(sched.too_far(&plan, 90300.0));
    }

    #[test]
    fn test_forget_drops_bookkeeping() {
        let mut sched = scheduler(true);
        let plan = fast_plan(90000.0, 50.0);
        sched.category(&plan);
        assert_eq!(sched.tracked_plans(), 1);
        sched.forget(plan.plan_id);
        assert_eq!(sched.tracked_plans(), 0);
    }

    #[test]
    fn test_retain_prunes_departed_plans() {
        let mut sched = scheduler(true);
        let kept = fast_plan(90000.0, 50.0);
        let gone = fast_plan(90000.0, 50.0);
        sched.category(&kept);
        sched.category(&gone);

        let active = std::collections::HashSet::from([kept.plan_id]);
        sched.retain(&active);
        assert_eq!(sched.tracked_plans(), 1);
    }

    #[test]
    fn test_category_cached_for_plan_lifetime() {
        let mut sched = scheduler(true);
        let mut plan = fast_plan(90000.0, 50.0);
        assert_eq!(sched.category(&plan), Category::Fast);

        // Mutating conditions after first classification does not reclassify
        plan.conditions = vec![Condition::VolumeSpike { multiple: 2.0 }];
        assert_eq!(sched.category(&plan), Category::Fast);
    }
}
