//! Trade-plan sync
//!
//! The broker-side recorder writes closed trades into `trade_journal`,
//! carrying the plan_id the order was submitted with. This job merges those
//! results back onto the originating plan rows so a plan's lifecycle can be
//! read from one table. Merging is idempotent: a plan with `closed_at`
//! already set is never touched again.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::Result;

/// A closed journal trade linked to a plan
#[derive(Debug, Clone)]
pub struct JournalTrade {
    pub ticket: i64,
    pub plan_id: Uuid,
    pub symbol: String,
    pub exit_price: Option<f64>,
    pub profit_loss: Option<f64>,
    pub closed_at: DateTime<Utc>,
    pub close_reason: Option<String>,
}

/// What one sync pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub updated: u64,
    pub errors: u64,
}

pub struct TradePlanSync {
    pool: PgPool,
}

impl TradePlanSync {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_trade(row: &PgRow) -> Result<JournalTrade> {
        let plan_id: Option<Uuid> = row.get("plan_id");
        let closed_at: Option<DateTime<Utc>> = row.get("closed_at");
        Ok(JournalTrade {
            ticket: row.get("ticket"),
            plan_id: plan_id.ok_or("journal row without plan_id")?,
            symbol: row.get("symbol"),
            exit_price: row.get("exit_price"),
            profit_loss: row.get("profit_loss"),
            closed_at: closed_at.ok_or("journal row without closed_at")?,
            close_reason: row.get("close_reason"),
        })
    }

    /// Journal trades closed since `since` that carry a plan link
    async fn closed_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<JournalTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT ticket, plan_id, symbol, exit_price, profit_loss, closed_at, close_reason
            FROM trade_journal
            WHERE plan_id IS NOT NULL AND closed_at IS NOT NULL AND closed_at >= $1
            ORDER BY closed_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in &rows {
            trades.push(Self::row_to_trade(row)?);
        }
        Ok(trades)
    }

    /// Merge one closed trade onto its plan. Returns true if the plan row was
    /// updated; false when it was already merged or the plan is unknown.
    async fn merge_trade(&self, trade: &JournalTrade) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trade_plans
            SET exit_price = $2,
                profit_loss = $3,
                closed_at = $4,
                close_reason = COALESCE($5, close_reason),
                updated_at = NOW()
            WHERE plan_id = $1 AND closed_at IS NULL
            "#,
        )
        .bind(trade.plan_id)
        .bind(trade.exit_price)
        .bind(trade.profit_loss)
        .bind(trade.closed_at)
        .bind(&trade.close_reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// One sync pass: merge every closed trade since `since` onto its plan.
    /// Per-trade errors are counted and logged, never fatal to the pass.
    pub async fn sync(&self, since: DateTime<Utc>) -> Result<SyncReport> {
        let trades = self.closed_trades_since(since).await?;
        let mut report = SyncReport::default();

        for trade in &trades {
            match self.merge_trade(trade).await {
                Ok(true) => {
                    tracing::info!(
                        plan_id = %trade.plan_id,
                        ticket = trade.ticket,
                        profit_loss = ?trade.profit_loss,
                        "Merged closed trade onto plan"
                    );
                    report.updated += 1;
                }
                Ok(false) => {
                    tracing::debug!(
                        plan_id = %trade.plan_id,
                        ticket = trade.ticket,
                        "Trade already merged or plan unknown"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        plan_id = %trade.plan_id,
                        ticket = trade.ticket,
                        "Merge failed: {}",
                        e
                    );
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = trades.len(),
            updated = report.updated,
            errors = report.errors,
            "Trade-plan sync pass complete"
        );
        Ok(report)
    }

    /// Journal trade joined with its plan's entry context, for reporting
    pub async fn get_trade_with_plan(&self, ticket: i64) -> Result<Option<TradeWithPlan>> {
        let row = sqlx::query(
            r#"
            SELECT j.ticket, j.plan_id, j.symbol, j.exit_price, j.profit_loss,
                   j.closed_at, j.close_reason,
                   p.entry_price, p.executed_price, p.status
            FROM trade_journal j
            JOIN trade_plans p ON p.plan_id = j.plan_id
            WHERE j.ticket = $1
            "#,
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(TradeWithPlan {
                ticket: row.get("ticket"),
                plan_id: row.get("plan_id"),
                symbol: row.get("symbol"),
                entry_price: row.get("entry_price"),
                executed_price: row.get("executed_price"),
                exit_price: row.get("exit_price"),
                profit_loss: row.get("profit_loss"),
                closed_at: row.get("closed_at"),
                close_reason: row.get("close_reason"),
                plan_status: row.get("status"),
            })
        })
        .transpose()
    }
}

/// One journal trade with the entry context of the plan that produced it
#[derive(Debug, Clone)]
pub struct TradeWithPlan {
    pub ticket: i64,
    pub plan_id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub executed_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub profit_loss: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub plan_status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PlanRepository, PlanStore, TransitionFields};
    use crate::models::{Condition, Direction, PlanStatus, Timeframe, TradePlan};
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
            vec![91000.0],
            vec![Condition::OrderBlock { timeframe: Timeframe::M5 }],
            Timeframe::M5,
            50.0,
            Utc::now() + Duration::hours(4),
        )
        .unwrap()
    }

    async fn insert_journal_trade(
        pool: &PgPool,
        ticket: i64,
        plan_id: Uuid,
        profit_loss: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_journal (
                ticket, plan_id, symbol, direction, entry_price,
                exit_price, profit_loss, opened_at, closed_at, close_reason
            )
            VALUES ($1, $2, 'BTCUSD', 'long', 90000.0, 90500.0, $3, NOW(), NOW(), 'tp_hit')
            "#,
        )
        .bind(ticket)
        .bind(plan_id)
        .bind(profit_loss)
        .execute(pool)
        .await?;
        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_sync_merges_closed_trade() {
        let store = get_test_store().await;
        store.clear_all_plans().await.unwrap();
        sqlx::query("DELETE FROM trade_journal")
            .execute(store.pool())
            .await
            .unwrap();

        let plan = test_plan("BTCUSD");
        store.insert(&plan).await.unwrap();
        store
            .transition(
                plan.plan_id,
                PlanStatus::Executed,
                TransitionFields {
                    ticket: Some(7001),
                    executed_price: Some(90010.0),
                    executed_at: Some(Utc::now()),
                    close_reason: None,
                },
            )
            .await
            .unwrap();

        insert_journal_trade(store.pool(), 7001, plan.plan_id, 490.0)
            .await
            .unwrap();

        let sync = TradePlanSync::new(store.pool().clone());
        let report = sync.sync(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors, 0);

        let merged = store.get(plan.plan_id).await.unwrap().unwrap();
        assert_eq!(merged.exit_price, Some(90500.0));
        assert_eq!(merged.profit_loss, Some(490.0));
        assert!(merged.closed_at.is_some());
        assert_eq!(merged.close_reason.as_deref(), Some("tp_hit"));

        // Second pass finds nothing to do
        let again = sync.sync(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_get_trade_with_plan_join() {
        let store = get_test_store().await;
        store.clear_all_plans().await.unwrap();
        sqlx::query("DELETE FROM trade_journal")
            .execute(store.pool())
            .await
            .unwrap();

        let plan = test_plan("BTCUSD");
        store.insert(&plan).await.unwrap();
        insert_journal_trade(store.pool(), 7002, plan.plan_id, -120.0)
            .await
            .unwrap();

        let sync = TradePlanSync::new(store.pool().clone());
        let joined = sync.get_trade_with_plan(7002).await.unwrap().unwrap();
        assert_eq!(joined.plan_id, plan.plan_id);
        assert_eq!(joined.entry_price, 90000.0);
        assert_eq!(joined.profit_loss, Some(-120.0));

        assert!(sync.get_trade_with_plan(999999).await.unwrap().is_none());
    }
}
