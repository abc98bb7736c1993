// model.rs — shared data model (spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Short identifier, e.g. "BTC".
    pub short: String,
    /// Exchange instrument id, e.g. "BTC-USDT-SWAP".
    pub instrument_id: String,
}

impl Symbol {
    pub fn new(short: impl Into<String>, instrument_id: impl Into<String>) -> Self {
        Self { short: short.into(), instrument_id: instrument_id.into() }
    }
}

/// Derives the short symbol (e.g. "BTC") from an exchange instrument id
/// (e.g. "BTC-USDT-SWAP"): everything before the first `-`. Used wherever
/// a collaborator only hands back the instrument id but reflection rows
/// and prompts are keyed by the short symbol.
pub fn short_symbol_of(instrument_id: &str) -> &str {
    instrument_id.split('-').next().unwrap_or(instrument_id)
}

/// Mapping from instrument id to last traded price. Read-only for consumers.
pub type PriceSnapshot = HashMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Cross,
    Isolated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: String,
    pub side: Side,
    /// Non-negative integer count of lots.
    pub contracts: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    pub margin_mode: MarginMode,
    pub unrealised_pnl: f64,
    pub liquidation_price: f64,
}

impl Position {
    /// notionalValue = contracts × contractValue × markPrice.
    pub fn notional_value(&self, contract_value: f64) -> f64 {
        self.contracts * contract_value * self.mark_price
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Account {
    pub total_equity: f64,
    pub available_balance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
}

impl Action {
    pub fn is_open(&self) -> bool {
        matches!(self, Action::OpenLong | Action::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Action::CloseLong | Action::CloseShort)
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            Action::OpenLong | Action::CloseLong => Some(Side::Long),
            Action::OpenShort | Action::CloseShort => Some(Side::Short),
            Action::Hold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Timeframe {
    Short,
    Medium,
    Long,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: Action,
    /// [0, 100]
    pub confidence: f64,
    pub entry_price: Option<f64>,
    /// Percentage of available cash, [5, 50]. Mandatory for OPEN actions.
    pub position_size_percent: Option<f64>,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    /// [1, 10]
    pub leverage: f64,
    pub reasoning: String,
    pub timeframe: Timeframe,
}

impl Decision {
    pub fn hold(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            action: Action::Hold,
            confidence: 0.0,
            entry_price: None,
            position_size_percent: None,
            take_profit: None,
            stop_loss: None,
            leverage: 1.0,
            reasoning: reasoning.into(),
            timeframe: Timeframe::Short,
        }
    }

    /// Invariant: OPEN actions require positionSizePercent, takeProfit,
    /// stopLoss; HOLD carries none.
    pub fn is_structurally_valid(&self) -> bool {
        if self.action.is_open() {
            self.position_size_percent.is_some()
                && self.take_profit.is_some()
                && self.stop_loss.is_some()
        } else if self.action == Action::Hold {
            self.position_size_percent.is_none()
                && self.take_profit.is_none()
                && self.stop_loss.is_none()
        } else {
            true
        }
    }
}

/// In-memory, owned exclusively by the Fund Scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundAllocation {
    pub symbol: String,
    pub requested_amount: f64,
    pub allocated_amount: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionOutcome {
    Pending,
    Profit,
    Loss,
    Breakeven,
}

impl ReflectionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReflectionOutcome::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReflection {
    pub decision_id: String,
    pub symbol: String,
    pub action: Action,
    pub outcome: ReflectionOutcome,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub entry_ts: i64,
    pub exit_ts: Option<i64>,
    pub pnl_amount: Option<f64>,
    pub pnl_percentage: Option<f64>,
    pub holding_time_minutes: Option<i64>,
    pub confidence: f64,
    pub leverage: f64,
    pub size_usdt: f64,
    pub reasoning: String,
    pub market_conditions: String,
    pub mistakes: Option<String>,
    pub insights: Option<String>,
    pub improvement: Option<String>,
    pub actual_vs_expected: Option<String>,
    pub created_at: i64,
}

/// Per run of the Decision Scheduler.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    /// Monotone, starts at 0.
    pub invocation_count: u64,
    /// ms epoch, captured at scheduler boot.
    pub trading_start_time: i64,
    pub refreshed_available_cash: f64,
}

impl CycleContext {
    pub fn trading_minutes(&self, now_ms: i64) -> f64 {
        ((now_ms - self.trading_start_time).max(0) as f64) / 60_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
}

/// One row of the `decisions` table (spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub ts: i64,
    pub status: DecisionStatus,
    pub prompt: String,
    pub reply: String,
}
