// reflection.rs — Reflection Store (spec.md §4.7) and its deterministic
// analytic-reflection rules (§4.7.1).
//
// Generalized from the teacher's persistence::{load_state, save_state}
// whole-engine JSON snapshot into per-row CRUD over an in-memory table,
// guarded by a single mutex the way the teacher serializes engine state
// writes.

use crate::model::{Action, ReflectionOutcome, TradeReflection};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct ReflectionStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub breakevens: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub total_pnl: f64,
    pub avg_holding_time: f64,
}

pub struct RecordOpenInput {
    pub decision_id: String,
    pub symbol: String,
    pub action: Action,
    pub entry_price: f64,
    pub entry_ts: i64,
    pub confidence: f64,
    pub leverage: f64,
    pub size_usdt: f64,
    pub reasoning: String,
    pub market_conditions: String,
}

pub struct RecordCloseInput {
    pub open_decision_id: String,
    pub exit_price: f64,
    pub pnl_amount: f64,
    pub now_ms: i64,
}

/// A live position snapshot, as needed by `auto_update_orphans` to
/// determine which pending reflections still have a matching position.
pub struct LivePosition {
    pub symbol: String,
    pub side: crate::model::Side,
}

/// A closed-PnL history entry, as returned by the exchange collaborator,
/// used to reconcile an orphaned pending reflection.
pub struct ClosedPnlEntry {
    pub symbol: String,
    pub side: crate::model::Side,
    pub exit_price: f64,
    pub exit_ts: i64,
    pub pnl_amount: f64,
}

pub struct ReflectionStore {
    rows: Mutex<HashMap<String, TradeReflection>>,
}

impl ReflectionStore {
    pub fn new() -> Self {
        Self { rows: Mutex::new(HashMap::new()) }
    }

    /// Inserts a `pending` row. Uniqueness is on `decisionId`; a repeat
    /// insert replaces the existing row.
    pub fn record_open(&self, input: RecordOpenInput) {
        let row = TradeReflection {
            decision_id: input.decision_id.clone(),
            symbol: input.symbol,
            action: input.action,
            outcome: ReflectionOutcome::Pending,
            entry_price: input.entry_price,
            exit_price: None,
            entry_ts: input.entry_ts,
            exit_ts: None,
            pnl_amount: None,
            pnl_percentage: None,
            holding_time_minutes: None,
            confidence: input.confidence,
            leverage: input.leverage,
            size_usdt: input.size_usdt,
            reasoning: input.reasoning,
            market_conditions: input.market_conditions,
            mistakes: None,
            insights: None,
            improvement: None,
            actual_vs_expected: None,
            created_at: input.entry_ts,
        };
        self.rows.lock().unwrap().insert(input.decision_id, row);
    }

    /// Looks up the open row keyed by `openDecisionId`; if absent, warns
    /// and returns without effect.
    pub fn record_close(&self, input: RecordCloseInput) {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&input.open_decision_id) else {
            log::warn!("[REFLECT] RecordClose: no open row for decision {}", input.open_decision_id);
            return;
        };

        let holding_time_minutes = (((input.now_ms - row.entry_ts) as f64) / 60_000.0).round() as i64;
        let pnl_percentage =
            if row.size_usdt > 0.0 { Some(input.pnl_amount / row.size_usdt * 100.0) } else { None };
        let outcome = classify_outcome(input.pnl_amount);

        row.exit_price = Some(input.exit_price);
        row.exit_ts = Some(input.now_ms);
        row.pnl_amount = Some(input.pnl_amount);
        row.pnl_percentage = pnl_percentage;
        row.holding_time_minutes = Some(holding_time_minutes);
        row.outcome = outcome;

        let reflection = analytic_reflection(
            outcome,
            pnl_percentage.unwrap_or(0.0),
            holding_time_minutes,
            row.confidence,
        );
        row.mistakes = reflection.mistakes;
        row.insights = reflection.insights;
        row.improvement = reflection.improvement;
        row.actual_vs_expected = Some(reflection.actual_vs_expected);
    }

    /// For each `pending` row, checks whether a live position still
    /// matches `(symbol, side)`; if not, reconciles against closed-PnL
    /// history by symbol + direction + time window. Returns the count of
    /// rows updated.
    pub fn auto_update_orphans(
        &self,
        live_positions: &[LivePosition],
        closed_pnl_history: &[ClosedPnlEntry],
        now_ms: i64,
    ) -> usize {
        let mut rows = self.rows.lock().unwrap();
        let pending_ids: Vec<String> = rows
            .iter()
            .filter(|(_, r)| r.outcome == ReflectionOutcome::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        let mut updated = 0;
        for id in pending_ids {
            let row = rows.get(&id).unwrap();
            let side = row.action.side();
            let still_open = side.is_some()
                && live_positions.iter().any(|p| p.symbol == row.symbol && Some(p.side) == side);
            if still_open {
                continue;
            }

            let entry_ts = row.entry_ts;
            let symbol = row.symbol.clone();
            let match_entry = closed_pnl_history.iter().find(|h| {
                h.symbol == symbol
                    && Some(h.side) == side
                    && h.exit_ts >= entry_ts
                    && h.exit_ts <= now_ms
            });

            let row = rows.get_mut(&id).unwrap();
            match match_entry {
                Some(entry) => {
                    let holding_time_minutes = (((entry.exit_ts - row.entry_ts) as f64) / 60_000.0).round() as i64;
                    let pnl_percentage =
                        if row.size_usdt > 0.0 { Some(entry.pnl_amount / row.size_usdt * 100.0) } else { None };
                    let outcome = classify_outcome(entry.pnl_amount);
                    row.exit_price = Some(entry.exit_price);
                    row.exit_ts = Some(entry.exit_ts);
                    row.pnl_amount = Some(entry.pnl_amount);
                    row.pnl_percentage = pnl_percentage;
                    row.holding_time_minutes = Some(holding_time_minutes);
                    row.outcome = outcome;
                    row.insights = Some(match row.insights.take() {
                        Some(existing) => format!("{}; auto-detected: TP/SL close", existing),
                        None => "auto-detected: TP/SL close".to_string(),
                    });
                }
                None => {
                    row.outcome = ReflectionOutcome::Breakeven;
                    row.insights = Some(
                        "advisory: no matching live position or closed-PnL record found for this decision"
                            .to_string(),
                    );
                }
            }
            updated += 1;
        }
        updated
    }

    /// `days`, when given, restricts to rows closed within the trailing
    /// `days * 86_400_000` ms window ending at `now_ms` (spec.md §4.7
    /// `Stats({symbol?, days?})`, "computed ... inside the window").
    pub fn stats(&self, symbol: Option<&str>, days: Option<i64>, now_ms: i64) -> ReflectionStats {
        let window_start = days.map(|d| now_ms - d * 86_400_000);
        let rows = self.rows.lock().unwrap();
        let terminal: Vec<&TradeReflection> = rows
            .values()
            .filter(|r| r.outcome.is_terminal())
            .filter(|r| symbol.map(|s| r.symbol == s).unwrap_or(true))
            .filter(|r| {
                window_start
                    .map(|start| r.exit_ts.unwrap_or(r.created_at) >= start)
                    .unwrap_or(true)
            })
            .collect();

        let total_trades = terminal.len();
        let wins = terminal.iter().filter(|r| r.outcome == ReflectionOutcome::Profit).count();
        let losses = terminal.iter().filter(|r| r.outcome == ReflectionOutcome::Loss).count();
        let breakevens = terminal.iter().filter(|r| r.outcome == ReflectionOutcome::Breakeven).count();
        let total_pnl: f64 = terminal.iter().filter_map(|r| r.pnl_amount).sum();
        let avg_pnl = if total_trades > 0 { total_pnl / total_trades as f64 } else { 0.0 };
        let avg_holding_time = if total_trades > 0 {
            terminal.iter().filter_map(|r| r.holding_time_minutes).sum::<i64>() as f64 / total_trades as f64
        } else {
            0.0
        };
        let win_rate = if total_trades > 0 { wins as f64 / total_trades as f64 * 100.0 } else { 0.0 };

        ReflectionStats { total_trades, wins, losses, breakevens, win_rate, avg_pnl, total_pnl, avg_holding_time }
    }

    pub fn get(&self, decision_id: &str) -> Option<TradeReflection> {
        self.rows.lock().unwrap().get(decision_id).cloned()
    }

    /// Finds the `decisionId` of the still-`pending` open row for
    /// `(symbol, side)`, so a CLOSE decision — which generates its own,
    /// unrelated decision id — can resolve the original open row that
    /// `RecordClose` needs to update. Picks the most recently opened match
    /// if more than one somehow exists.
    pub fn find_pending_decision_id(&self, symbol: &str, side: crate::model::Side) -> Option<String> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.outcome == ReflectionOutcome::Pending && r.symbol == symbol && r.action.side() == Some(side)
            })
            .max_by_key(|r| r.entry_ts)
            .map(|r| r.decision_id.clone())
    }
}

impl Default for ReflectionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_outcome(pnl_amount: f64) -> ReflectionOutcome {
    if pnl_amount > 1.0 {
        ReflectionOutcome::Profit
    } else if pnl_amount < -1.0 {
        ReflectionOutcome::Loss
    } else {
        ReflectionOutcome::Breakeven
    }
}

struct AnalyticReflection {
    mistakes: Option<String>,
    insights: Option<String>,
    improvement: Option<String>,
    actual_vs_expected: String,
}

/// §4.7.1: deterministic, stable for identical inputs.
fn analytic_reflection(
    outcome: ReflectionOutcome,
    pnl_percentage: f64,
    holding_time_minutes: i64,
    confidence: f64,
) -> AnalyticReflection {
    let mut mistakes = Vec::new();
    let mut insights = Vec::new();

    if outcome == ReflectionOutcome::Loss && pnl_percentage.abs() > 8.0 {
        mistakes.push("stop-loss too wide or not honoured");
    }
    if outcome == ReflectionOutcome::Loss && holding_time_minutes < 30 {
        mistakes.push("entry timing poor");
    }
    if outcome == ReflectionOutcome::Profit && pnl_percentage < 3.0 {
        insights.push("exited too early");
    }
    if outcome == ReflectionOutcome::Profit && holding_time_minutes > 360 {
        insights.push("trend-holding correct");
    }

    let aligned = (confidence > 75.0 && outcome == ReflectionOutcome::Profit)
        || (confidence < 60.0 && outcome == ReflectionOutcome::Loss);
    let (actual_vs_expected, improvement) = if aligned {
        ("aligned".to_string(), None)
    } else {
        ("calibration drift".to_string(), Some("recalibrate signal threshold"))
    };

    AnalyticReflection {
        mistakes: non_empty_joined(mistakes),
        insights: non_empty_joined(insights),
        improvement: improvement.map(|s| s.to_string()),
        actual_vs_expected,
    }
}

fn non_empty_joined(parts: Vec<&str>) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}
