use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Direction::Long),
            "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

/// Candle timeframe for a plan's working resolution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Timeframe {
    S15,
    S30,
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Duration of one candle in seconds
    pub fn secs(&self) -> u64 {
        match self {
            Timeframe::S15 => 15,
            Timeframe::S30 => 30,
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3600,
            Timeframe::H4 => 14400,
            Timeframe::D1 => 86400,
        }
    }

    pub fn is_sub_minute(&self) -> bool {
        self.secs() < 60
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::S15 => "15s",
            Timeframe::S30 => "30s",
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "15s" => Some(Timeframe::S15),
            "30s" => Some(Timeframe::S30),
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }
}

/// A named predicate the plan requires before execution.
///
/// Variants carry kind + parameters only. The monitor never interprets them;
/// only the condition evaluator knows what they mean against market data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    LiquiditySweep { lookback_candles: u32 },
    OrderBlock { timeframe: Timeframe },
    EqualHighsLows { lookback_candles: u32 },
    VwapDeviation { max_deviation_pct: f64 },
    StructureBreak { level: f64 },
    VolumeSpike { multiple: f64 },
}

impl Condition {
    /// Kinds that are only meaningful right at the trigger price. Plans
    /// carrying any of these get the fast scheduling cadence.
    pub fn is_price_reactive(&self) -> bool {
        matches!(
            self,
            Condition::LiquiditySweep { .. }
                | Condition::OrderBlock { .. }
                | Condition::EqualHighsLows { .. }
                | Condition::VwapDeviation { .. }
        )
    }
}

/// Lifecycle state of a plan. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlanStatus {
    Pending,
    Executed,
    Cancelled,
    Expired,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlanStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Executed => "executed",
            PlanStatus::Cancelled => "cancelled",
            PlanStatus::Expired => "expired",
            PlanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PlanStatus::Pending),
            "executed" => Some(PlanStatus::Executed),
            "cancelled" => Some(PlanStatus::Cancelled),
            "expired" => Some(PlanStatus::Expired),
            "failed" => Some(PlanStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanValidationError {
    #[error("symbol must not be empty")]
    EmptySymbol,
    #[error("entry price must be positive")]
    BadEntryPrice,
    #[error("tolerance must be positive")]
    BadTolerance,
    #[error("stop loss must be on the losing side of entry")]
    BadStopLoss,
    #[error("at least one condition is required")]
    NoConditions,
    #[error("expires_at must be after created_at")]
    BadExpiry,
}

/// A conditional, not-yet-executed trade instruction.
///
/// Immutable after creation except for `status` and the result fields, which
/// only the plan store's transition API may touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlan {
    pub plan_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<f64>,
    pub conditions: Vec<Condition>,
    pub timeframe: Timeframe,
    /// Allowed price distance from entry to count as "at" the trigger
    pub tolerance: f64,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    // Set on execution
    pub ticket: Option<i64>,
    pub executed_price: Option<f64>,
    pub executed_at: Option<DateTime<Utc>>,

    // Merged in later by trade-plan sync
    pub exit_price: Option<f64>,
    pub profit_loss: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl TradePlan {
    /// Build a pending plan with a fresh id. Validation happens at creation,
    /// not at evaluation time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        entry_price: f64,
        stop_loss: f64,
        take_profits: Vec<f64>,
        conditions: Vec<Condition>,
        timeframe: Timeframe,
        tolerance: f64,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, PlanValidationError> {
        let plan = Self {
            plan_id: Uuid::new_v4(),
            symbol: symbol.into(),
            direction,
            entry_price,
            stop_loss,
            take_profits,
            conditions,
            timeframe,
            tolerance,
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            expires_at,
            ticket: None,
            executed_price: None,
            executed_at: None,
            exit_price: None,
            profit_loss: None,
            closed_at: None,
            close_reason: None,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(PlanValidationError::EmptySymbol);
        }
        if !(self.entry_price > 0.0) {
            return Err(PlanValidationError::BadEntryPrice);
        }
        if !(self.tolerance > 0.0) {
            return Err(PlanValidationError::BadTolerance);
        }
        let stop_ok = match self.direction {
            Direction::Long => self.stop_loss < self.entry_price,
            Direction::Short => self.stop_loss > self.entry_price,
        };
        if !stop_ok {
            return Err(PlanValidationError::BadStopLoss);
        }
        if self.conditions.is_empty() {
            return Err(PlanValidationError::NoConditions);
        }
        if self.expires_at <= self.created_at {
            return Err(PlanValidationError::BadExpiry);
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Stop-level invalidation: price has gone through the stop before the
    /// entry ever triggered. Such a setup is abandoned, not traded.
    pub fn is_invalidated_by(&self, price: f64) -> bool {
        match self.direction {
            Direction::Long => price <= self.stop_loss,
            Direction::Short => price >= self.stop_loss,
        }
    }
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Top-of-book quote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// What the evaluator sees: the cached series plus the freshest quote.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub quote: Quote,
    pub as_of: DateTime<Utc>,
}

/// Fill report from the execution gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderFill {
    pub ticket: i64,
    pub executed_price: f64,
    pub executed_at: DateTime<Utc>,
}
