// Plan persistence module
pub mod memory;
pub mod postgres;

pub use memory::MemoryPlanStore;
pub use postgres::PlanStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{OrderFill, PlanStatus, TradePlan};
use crate::Result;

/// Outcome of a terminal-transition attempt.
///
/// `AlreadyTerminal` is the normal answer for a repeated call; callers must
/// never treat it as success of *their* transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    AlreadyTerminal,
    NotFound,
}

/// Result columns written together with a terminal transition
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub ticket: Option<i64>,
    pub executed_price: Option<f64>,
    pub executed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_fill(fill: &OrderFill) -> Self {
        Self {
            ticket: Some(fill.ticket),
            executed_price: Some(fill.executed_price),
            executed_at: Some(fill.executed_at),
            close_reason: None,
        }
    }

    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            close_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Storage seam for trade plans.
///
/// `transition` is the system's sole at-most-once execution guarantee: it must
/// move a plan out of `pending` atomically with respect to every other caller,
/// including other processes. A storage error leaves the plan unchanged and
/// must be treated as "still pending" by callers.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn insert(&self, plan: &TradePlan) -> Result<Uuid>;

    async fn get(&self, plan_id: Uuid) -> Result<Option<TradePlan>>;

    /// All non-terminal plans. Never returns partially-written records.
    async fn load_pending(&self) -> Result<Vec<TradePlan>>;

    async fn transition(
        &self,
        plan_id: Uuid,
        new_status: PlanStatus,
        fields: TransitionFields,
    ) -> Result<TransitionOutcome>;

    /// Expire every pending plan whose deadline has passed. Per-plan
    /// transactional; returns how many plans were expired.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut expired = 0;
        for plan in self.load_pending().await? {
            if plan.is_expired(now)
                && self
                    .transition(plan.plan_id, PlanStatus::Expired, TransitionFields::none())
                    .await?
                    == TransitionOutcome::Applied
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Cancel every pending plan matching the predicate. Per-plan
    /// transactional; returns how many plans were cancelled.
    async fn cancel_where(
        &self,
        predicate: &(dyn for<'a> Fn(&'a TradePlan) -> bool + Send + Sync),
        reason: &str,
    ) -> Result<u64> {
        let mut cancelled = 0;
        for plan in self.load_pending().await? {
            if predicate(&plan)
                && self
                    .transition(
                        plan.plan_id,
                        PlanStatus::Cancelled,
                        TransitionFields::reason(reason),
                    )
                    .await?
                    == TransitionOutcome::Applied
            {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}
