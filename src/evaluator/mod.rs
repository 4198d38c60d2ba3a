// Condition evaluation seam.
//
// The monitor treats condition sets as opaque: it hands the evaluator the
// plan (whose `conditions` are the contract) plus a market snapshot and gets
// back a single bool. The real structural/volatility analysis lives behind
// this trait, outside this crate's concern.

use async_trait::async_trait;

use crate::models::{MarketSnapshot, TradePlan};
use crate::Result;

/// Decides whether a plan's condition set currently holds.
///
/// Implementations must be side-effect-free and bounded in time; the monitor
/// wraps calls in a timeout and treats a timeout as failure. The full plan is
/// passed so implementations can see the entry context, but only
/// `plan.conditions` defines what must hold.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(&self, plan: &TradePlan, snapshot: &MarketSnapshot) -> Result<bool>;
}

/// Trivial default evaluator: true once price touches the plan's entry
/// trigger within tolerance. Carries no structural analysis; it exists so the
/// binary runs end to end in paper mode before a real evaluator is wired in.
pub struct TriggerTouchEvaluator;

#[async_trait]
impl ConditionEvaluator for TriggerTouchEvaluator {
    async fn evaluate(&self, plan: &TradePlan, snapshot: &MarketSnapshot) -> Result<bool> {
        let price = snapshot.quote.mid();
        Ok((price - plan.entry_price).abs() <= plan.tolerance)
    }
}
