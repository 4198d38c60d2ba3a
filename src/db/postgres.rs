use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::{PlanRepository, TransitionFields, TransitionOutcome};
use crate::models::{Condition, Direction, PlanStatus, Timeframe, TradePlan};
use crate::Result;

/// Postgres-backed plan store.
///
/// Owns the durable table; every status mutation goes through `transition`,
/// which is a conditional UPDATE so at-most-once execution holds across
/// process restarts and concurrent administrative callers.
pub struct PlanStore {
    pool: PgPool,
}

impl PlanStore {
    /// Connect to Postgres and run migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_plan(row: &PgRow) -> Result<TradePlan> {
        let direction_str: String = row.get("direction");
        let status_str: String = row.get("status");
        let timeframe_str: String = row.get("timeframe");
        let conditions_json: serde_json::Value = row.get("conditions");

        let direction = Direction::parse(&direction_str)
            .ok_or_else(|| format!("invalid direction '{}'", direction_str))?;
        let status = PlanStatus::parse(&status_str)
            .ok_or_else(|| format!("invalid plan status '{}'", status_str))?;
        let timeframe = Timeframe::parse(&timeframe_str)
            .ok_or_else(|| format!("invalid timeframe '{}'", timeframe_str))?;
        let conditions: Vec<Condition> = serde_json::from_value(conditions_json)?;

        Ok(TradePlan {
            plan_id: row.get("plan_id"),
            symbol: row.get("symbol"),
            direction,
            entry_price: row.get("entry_price"),
            stop_loss: row.get("stop_loss"),
            take_profits: row.get("take_profits"),
            conditions,
            timeframe,
            tolerance: row.get("tolerance"),
            status,
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            ticket: row.get("ticket"),
            executed_price: row.get("executed_price"),
            executed_at: row.get("executed_at"),
            exit_price: row.get("exit_price"),
            profit_loss: row.get("profit_loss"),
            closed_at: row.get("closed_at"),
            close_reason: row.get("close_reason"),
        })
    }

    /// Delete all plans (testing only)
    #[cfg(test)]
    pub async fn clear_all_plans(&self) -> Result<()> {
        sqlx::query("DELETE FROM trade_plans")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PlanRepository for PlanStore {
    async fn insert(&self, plan: &TradePlan) -> Result<Uuid> {
        plan.validate()?;

        sqlx::query(
            r#"
            INSERT INTO trade_plans (
                plan_id, symbol, direction, entry_price, stop_loss, take_profits,
                conditions, timeframe, tolerance, status, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.symbol)
        .bind(plan.direction.as_str())
        .bind(plan.entry_price)
        .bind(plan.stop_loss)
        .bind(&plan.take_profits)
        .bind(serde_json::to_value(&plan.conditions)?)
        .bind(plan.timeframe.as_str())
        .bind(plan.tolerance)
        .bind(plan.status.as_str())
        .bind(plan.created_at)
        .bind(plan.expires_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(plan_id = %plan.plan_id, symbol = %plan.symbol, "Inserted plan");

        Ok(plan.plan_id)
    }

    async fn get(&self, plan_id: Uuid) -> Result<Option<TradePlan>> {
        let row = sqlx::query("SELECT * FROM trade_plans WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_plan).transpose()
    }

    async fn load_pending(&self) -> Result<Vec<TradePlan>> {
        let rows = sqlx::query(
            "SELECT * FROM trade_plans WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut plans = Vec::with_capacity(rows.len());
        for row in &rows {
            plans.push(Self::row_to_plan(row)?);
        }

        tracing::debug!("Loaded {} pending plans", plans.len());

        Ok(plans)
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

        // The WHERE status = 'pending' clause is the whole exactly-once story:
        // only one caller anywhere can win this UPDATE.
        let result = sqlx::query(
            r#"
            UPDATE trade_plans
            SET status = $2,
                ticket = $3,
                executed_price = $4,
                executed_at = $5,
                close_reason = $6,
                updated_at = NOW()
            WHERE plan_id = $1 AND status = 'pending'
            "#,
        )
        .bind(plan_id)
        .bind(new_status.as_str())
        .bind(fields.ticket)
        .bind(fields.executed_price)
        .bind(fields.executed_at)
        .bind(fields.close_reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::info!(%plan_id, status = new_status.as_str(), "Plan transitioned");
            return Ok(TransitionOutcome::Applied);
        }

        let exists = sqlx::query("SELECT 1 FROM trade_plans WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;

        if exists.is_some() {
            Ok(TransitionOutcome::AlreadyTerminal)
        } else {
            Ok(TransitionOutcome::NotFound)
        }
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE trade_plans
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'pending' AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::info!("Expired {} overdue plans", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Condition, Direction, Timeframe};
    use chrono::Duration;

    async fn get_test_store() -> PlanStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/planwatch_test".to_string());

        PlanStore::connect(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    fn test_plan(symbol: &str) -> TradePlan {
        TradePlan::new(
            symbol,
            Direction::Long,
            90000.0,
            89500.0,
            vec![91000.0, 92000.0],
            vec![Condition::LiquiditySweep { lookback_candles: 20 }],
            Timeframe::M5,
            50.0,
            Utc::now() + Duration::hours(4),
        )
        .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_insert_and_load_pending() {
        let store = get_test_store().await;
        store.clear_all_plans().await.unwrap();

        let plan = test_plan("BTCUSD");
        store.insert(&plan).await.unwrap();

        let pending = store.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].plan_id, plan.plan_id);
        assert_eq!(pending[0].conditions, plan.conditions);
        assert_eq!(pending[0].take_profits, vec![91000.0, 92000.0]);

        store.clear_all_plans().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_transition_is_exactly_once() {
        let store = get_test_store().await;
        store.clear_all_plans().await.unwrap();

        let plan = test_plan("BTCUSD");
        store.insert(&plan).await.unwrap();

        let fields = TransitionFields {
            ticket: Some(42),
            executed_price: Some(90010.0),
            executed_at: Some(Utc::now()),
            close_reason: None,
        };

        let first = store
            .transition(plan.plan_id, PlanStatus::Executed, fields.clone())
            .await
            .unwrap();
        assert_eq!(first, TransitionOutcome::Applied);

        // Second caller loses, result fields untouched
        let second = store
            .transition(
                plan.plan_id,
                PlanStatus::Cancelled,
                TransitionFields::reason("late cancel"),
            )
            .await
            .unwrap();
        assert_eq!(second, TransitionOutcome::AlreadyTerminal);

        let stored = store.get(plan.plan_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PlanStatus::Executed);
        assert_eq!(stored.ticket, Some(42));
        assert!(stored.close_reason.is_none());

        store.clear_all_plans().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_transition_unknown_plan() {
        let store = get_test_store().await;

        let outcome = store
            .transition(Uuid::new_v4(), PlanStatus::Expired, TransitionFields::none())
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::NotFound);
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_expire_due_bulk() {
        let store = get_test_store().await;
        store.clear_all_plans().await.unwrap();

        let fresh = test_plan("ETHUSD");

        // Validation rejects already-expired plans, so insert with a valid
        // window and age it through SQL.
        let stale = test_plan("BTCUSD");
        store.insert(&stale).await.unwrap();
        store.insert(&fresh).await.unwrap();
        sqlx::query("UPDATE trade_plans SET expires_at = $2 WHERE plan_id = $1")
            .bind(stale.plan_id)
            .bind(Utc::now() - Duration::seconds(10))
            .execute(store.pool())
            .await
            .unwrap();

        let expired = store.expire_due(Utc::now()).await.unwrap();
        assert_eq!(expired, 1);

        let pending = store.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].plan_id, fresh.plan_id);

        store.clear_all_plans().await.unwrap();
    }
}
