use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tokio::time::{sleep, Duration};

use crate::models::{OrderFill, TradePlan};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Broker refused the order (margin, symbol halted, bad volume)
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Transport-level failure; nothing known about order state
    #[error("gateway transport error: {0}")]
    Transport(String),
}

/// Submits a qualifying plan as a live order.
///
/// A successful return means a real fill; the caller is responsible for
/// persisting the plan transition and must never report executed without one.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn submit(&self, plan: &TradePlan) -> Result<OrderFill, GatewayError>;
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    direction: &'a str,
    volume: f64,
    stop_loss: f64,
    take_profit: Option<f64>,
    /// Carried through to the broker's journal so sync can link the trade back
    plan_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    ticket: i64,
    executed_price: f64,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the brokerage order API
#[derive(Clone)]
pub struct BrokerClient {
    client: Client,
    base_url: String,
    volume: f64,
}

impl BrokerClient {
    pub fn new(base_url: impl Into<String>, volume: f64) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            volume,
        }
    }

    async fn submit_once(&self, plan: &TradePlan) -> Result<OrderFill, GatewayError> {
        let url = format!("{}/orders", self.base_url);
        let request = OrderRequest {
            symbol: &plan.symbol,
            direction: plan.direction.as_str(),
            volume: self.volume,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profits.first().copied(),
            plan_id: plan.plan_id.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        let body: OrderResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("bad response ({}): {}", status, e)))?;

        if let Some(reason) = body.error {
            return Err(GatewayError::Rejected(reason));
        }

        Ok(OrderFill {
            ticket: body.ticket,
            executed_price: body.executed_price,
            executed_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ExecutionGateway for BrokerClient {
    async fn submit(&self, plan: &TradePlan) -> Result<OrderFill, GatewayError> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.submit_once(plan).await {
                Ok(fill) => {
                    tracing::info!(
                        plan_id = %plan.plan_id,
                        ticket = fill.ticket,
                        price = fill.executed_price,
                        "Order filled"
                    );
                    return Ok(fill);
                }
                // A rejection is a definitive answer; retrying would re-ask
                // the same question
                Err(e @ GatewayError::Rejected(_)) => return Err(e),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            plan_id = %plan.plan_id,
                            "Submit attempt {}/{} failed: {}. Retrying in {}ms...",
                            attempt,
                            MAX_RETRIES,
                            last_error.as_ref().unwrap(),
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| GatewayError::Transport("all retry attempts failed".to_string())))
    }
}

/// Paper gateway: fabricates fills at the plan's entry price. Used by dry-run
/// mode and tests.
#[derive(Default)]
pub struct PaperGateway {
    next_ticket: AtomicI64,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            next_ticket: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn submit(&self, plan: &TradePlan) -> Result<OrderFill, GatewayError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            plan_id = %plan.plan_id,
            ticket,
            "Paper fill @ {:.4}",
            plan.entry_price
        );
        Ok(OrderFill {
            ticket,
            executed_price: plan.entry_price,
            executed_at: Utc::now(),
        })
    }
}
