use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::db::{PlanRepository, TransitionFields, TransitionOutcome};
use crate::models::{PlanStatus, TradePlan};
use crate::Result;

/// In-memory plan store with the same transactional surface as Postgres.
///
/// Used for dry-run mode and tests. The map is only ever mutated through
/// `insert`/`transition`, so the single-terminal-transition invariant holds
/// here too, just without crash durability.
#[derive(Default)]
pub struct MemoryPlanStore {
    plans: RwLock<HashMap<Uuid, TradePlan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: Vec<TradePlan>) -> Self {
        let store = Self::new();
        {
            let mut map = store.plans.write().unwrap();
            for plan in plans {
                map.insert(plan.plan_id, plan);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.plans.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PlanRepository for MemoryPlanStore {
    async fn insert(&self, plan: &TradePlan) -> Result<Uuid> {
        plan.validate()?;
        let mut map = self.plans.write().map_err(|e| e.to_string())?;
        if map.contains_key(&plan.plan_id) {
            return Err(format!("plan {} already exists", plan.plan_id).into());
        }
        map.insert(plan.plan_id, plan.clone());
        Ok(plan.plan_id)
    }

    async fn get(&self, plan_id: Uuid) -> Result<Option<TradePlan>> {
        let map = self.plans.read().map_err(|e| e.to_string())?;
        Ok(map.get(&plan_id).cloned())
    }

    async fn load_pending(&self) -> Result<Vec<TradePlan>> {
        let map = self.plans.read().map_err(|e| e.to_string())?;
        let mut pending: Vec<TradePlan> = map
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        Ok(pending)
    }

    async fn transition(
        &self,
        plan_id: Uuid,
        new_status: PlanStatus,
        fields: TransitionFields,
    ) -> Result<TransitionOutcome> {
        if !new_status.is_terminal() {
            return Err(format!("cannot transition to non-terminal status {:?}", new_status).into());
        }

        let mut map = self.plans.write().map_err(|e| e.to_string())?;
        let Some(plan) = map.get_mut(&plan_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if plan.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal);
        }

        plan.status = new_status;
        plan.ticket = fields.ticket;
        plan.executed_price = fields.executed_price;
        plan.executed_at = fields.executed_at;
        plan.close_reason = fields.close_reason;

        tracing::info!(%plan_id, status = new_status.as_str(), "Plan transitioned (memory)");
        Ok(TransitionOutcome::Applied)
    }
}
