// risk.rs — Risk Validator (spec.md §4.4) plus PortfolioGuard, the
// portfolio-level circuit breaker retained from the teacher's RiskManager
// (consecutive-loss halt, daily-drawdown halt, manual kill switch).
//
// The per-decision gate below is a stateless rule set, generalized from
// barter-rs's small OrderEvaluator trait shape: a struct of thresholds and
// one evaluate function.

use crate::clock::Clock;
use crate::model::{Action, Decision, Position, Side};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const MIN_AVAILABLE_MARGIN: f64 = 50.0;
pub const MAX_TOTAL_EXPOSURE_PCT: f64 = 80.0;
pub const MAX_SYMBOL_EXPOSURE_PCT: f64 = 30.0;
pub const MAX_OPEN_POSITIONS: usize = 6;
pub const MAX_LEVERAGE: f64 = 10.0;
pub const MIN_ORDER_SIZE: f64 = 10.0;
pub const SINGLE_ORDER_MARGIN_RATIO_WARN: f64 = 0.5;
pub const MARGIN_USAGE_WARN_PCT: f64 = 90.0;
pub const STOP_DISTANCE_WARN_PCT: f64 = 10.0;

#[derive(Debug, Clone, Default)]
pub struct RiskMetrics {
    pub projected_total_exposure_pct: f64,
    pub projected_symbol_exposure_pct: f64,
    pub projected_open_positions: usize,
    pub margin_usage_pct: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RiskReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub risk_metrics: RiskMetrics,
}

/// Pre-trade gate: (currentPositions, decision, accountTotal,
/// availableMargin, proposedNotional, contractValues) -> validity, errors,
/// warnings, metrics. CLOSE and HOLD actions always pass untouched.
///
/// `contract_values` maps instrument id -> `contractValue` (spec.md §4.1),
/// looked up per position so exposure isn't off by the contract-value
/// factor for instruments where `ctVal != 1` (e.g. DOGE `ctVal = 1000`).
/// A position whose instrument is missing from the map falls back to 1.0 —
/// callers should populate it from the instrument registry for every
/// instrument they pass in `current_positions`.
pub fn validate(
    current_positions: &[Position],
    decision: &Decision,
    account_total: f64,
    available_margin: f64,
    proposed_notional: f64,
    contract_values: &HashMap<String, f64>,
) -> RiskReport {
    if decision.action.is_close() || decision.action == Action::Hold {
        return RiskReport { is_valid: true, ..Default::default() };
    }

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let required_margin = if decision.leverage > 0.0 { proposed_notional / decision.leverage } else { 0.0 };

    let contract_value_of = |p: &Position| contract_values.get(&p.instrument_id).copied().unwrap_or(1.0);
    let existing_notional: f64 = current_positions.iter().map(|p| p.notional_value(contract_value_of(p)).abs()).sum();
    let symbol_existing_notional: f64 = current_positions
        .iter()
        .filter(|p| symbol_matches(&p.instrument_id, &decision.symbol))
        .map(|p| p.notional_value(contract_value_of(p)).abs())
        .sum();

    let total_exposure_pct = pct(existing_notional + proposed_notional, account_total);
    let symbol_exposure_pct = pct(symbol_existing_notional + proposed_notional, account_total);
    let projected_open_positions = current_positions.len() + 1;
    let margin_usage_pct = pct(required_margin, available_margin.max(f64::EPSILON));

    if available_margin < MIN_AVAILABLE_MARGIN {
        errors.push(format!(
            "available margin {:.2} below minimum {:.2}",
            available_margin, MIN_AVAILABLE_MARGIN
        ));
    }

    if total_exposure_pct > MAX_TOTAL_EXPOSURE_PCT {
        errors.push(format!(
            "projected total exposure {:.1}% exceeds cap {:.1}%",
            total_exposure_pct, MAX_TOTAL_EXPOSURE_PCT
        ));
    }

    if symbol_exposure_pct > MAX_SYMBOL_EXPOSURE_PCT {
        errors.push(format!(
            "projected {} exposure {:.1}% exceeds cap {:.1}%",
            decision.symbol, symbol_exposure_pct, MAX_SYMBOL_EXPOSURE_PCT
        ));
    }

    if projected_open_positions > MAX_OPEN_POSITIONS {
        errors.push(format!(
            "projected open positions {} exceeds cap {}",
            projected_open_positions, MAX_OPEN_POSITIONS
        ));
    }

    if decision.leverage > MAX_LEVERAGE {
        errors.push(format!("leverage {:.1}x exceeds cap {:.1}x", decision.leverage, MAX_LEVERAGE));
    }

    if proposed_notional < MIN_ORDER_SIZE {
        errors.push(format!(
            "notional {:.2} below minimum order size {:.2}",
            proposed_notional, MIN_ORDER_SIZE
        ));
    }

    let single_order_ratio = required_margin / available_margin.max(f64::EPSILON);
    if single_order_ratio > SINGLE_ORDER_MARGIN_RATIO_WARN {
        warnings.push(format!("single order uses {:.1}% of available margin", single_order_ratio * 100.0));
    }

    if margin_usage_pct > MARGIN_USAGE_WARN_PCT {
        warnings.push(format!("margin usage {:.1}% approaches the limit", margin_usage_pct));
    }

    let wanted_side = decision.action.side();
    let has_duplicate = current_positions
        .iter()
        .any(|p| symbol_matches(&p.instrument_id, &decision.symbol) && Some(p.side) == wanted_side);
    if has_duplicate {
        errors.push(format!("duplicate same-direction position for {}", decision.symbol));
    }

    match (decision.take_profit, decision.stop_loss, decision.entry_price) {
        (Some(tp), Some(sl), Some(entry)) if entry > 0.0 => {
            let stop_distance_pct = ((entry - sl).abs() / entry) * 100.0;
            if stop_distance_pct > STOP_DISTANCE_WARN_PCT {
                warnings.push(format!("stop distance {:.1}% exceeds 10% of entry", stop_distance_pct));
            }
            let reward = (tp - entry).abs();
            let risk = (entry - sl).abs();
            if risk > 0.0 && reward / risk < 1.0 {
                warnings.push("reward/risk ratio below 1".to_string());
            }
        }
        _ => warnings.push("take-profit or stop-loss missing".to_string()),
    }

    RiskReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        risk_metrics: RiskMetrics {
            projected_total_exposure_pct: total_exposure_pct,
            projected_symbol_exposure_pct: symbol_exposure_pct,
            projected_open_positions,
            margin_usage_pct,
        },
    }
}

fn pct(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        return 0.0;
    }
    (part / whole) * 100.0
}

fn symbol_matches(instrument_id: &str, short: &str) -> bool {
    instrument_id.starts_with(short)
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

// ─── PortfolioGuard ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioGuardConfig {
    pub max_daily_drawdown_percent: f64,
    pub max_consecutive_losses: usize,
    pub trading_halt_duration_secs: i64,
}

impl Default for PortfolioGuardConfig {
    fn default() -> Self {
        Self {
            max_daily_drawdown_percent: 0.10,
            max_consecutive_losses: 5,
            trading_halt_duration_secs: 3600,
        }
    }
}

pub struct PortfolioGuard {
    config: PortfolioGuardConfig,
    clock: Arc<dyn Clock>,
    start_of_day_balance: f64,
    last_day_reset: DateTime<Utc>,
    consecutive_loss_count: usize,
    halt_until: Option<DateTime<Utc>>,
    is_kill_switch_active: bool,
}

impl PortfolioGuard {
    pub fn new(config: PortfolioGuardConfig, current_balance: f64, clock: Arc<dyn Clock>) -> Self {
        let now = ms_to_utc(clock.now_ms());
        Self {
            config,
            clock,
            start_of_day_balance: current_balance,
            last_day_reset: now,
            consecutive_loss_count: 0,
            halt_until: None,
            is_kill_switch_active: false,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        ms_to_utc(self.clock.now_ms())
    }

    pub fn can_trade(&self) -> Result<(), String> {
        if self.is_kill_switch_active {
            return Err("Kill switch is ACTIVE".to_string());
        }

        if let Some(halt_end) = self.halt_until {
            if self.now() < halt_end {
                return Err(format!("Trading halted until {}", halt_end));
            }
        }

        Ok(())
    }

    pub fn update_trade_result(&mut self, pnl: f64, current_balance: f64) {
        let now = self.now();
        if now.date_naive() > self.last_day_reset.date_naive() {
            self.start_of_day_balance = current_balance;
            self.last_day_reset = now;
        }

        if pnl < 0.0 {
            self.consecutive_loss_count += 1;
        } else {
            self.consecutive_loss_count = 0;
        }

        self.check_circuit_breakers(current_balance);
    }

    fn check_circuit_breakers(&mut self, current_balance: f64) {
        if self.consecutive_loss_count >= self.config.max_consecutive_losses {
            let halt_duration = Duration::seconds(self.config.trading_halt_duration_secs);
            self.halt_until = Some(self.now() + halt_duration);
            self.consecutive_loss_count = 0;
            log::warn!(
                "[RISK] halt triggered: {} consecutive losses, pausing for {}s",
                self.config.max_consecutive_losses,
                self.config.trading_halt_duration_secs
            );
        }

        if self.start_of_day_balance > 0.0 {
            let drawdown = (self.start_of_day_balance - current_balance) / self.start_of_day_balance;
            if drawdown > self.config.max_daily_drawdown_percent {
                let tomorrow = self.now().date_naive().succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap().and_utc();
                self.halt_until = Some(tomorrow);
                log::error!(
                    "[RISK] daily drawdown {:.1}% exceeds limit {:.1}%, halting until tomorrow",
                    drawdown * 100.0,
                    self.config.max_daily_drawdown_percent * 100.0
                );
            }
        }
    }

    pub fn set_kill_switch(&mut self, active: bool) {
        self.is_kill_switch_active = active;
        log::warn!("[RISK] kill switch set to {}", active);
    }

    pub fn clear_halt(&mut self) {
        self.halt_until = None;
        self.consecutive_loss_count = 0;
        log::info!("[RISK] trading halt manually cleared");
    }

    pub fn get_state(&self) -> PortfolioGuardState {
        PortfolioGuardState {
            start_of_day_balance: self.start_of_day_balance,
            last_day_reset: self.last_day_reset,
            consecutive_loss_count: self.consecutive_loss_count,
            halt_until: self.halt_until,
            is_kill_switch_active: self.is_kill_switch_active,
        }
    }

    pub fn restore_state(&mut self, state: PortfolioGuardState) {
        self.start_of_day_balance = state.start_of_day_balance;
        self.last_day_reset = state.last_day_reset;
        self.consecutive_loss_count = state.consecutive_loss_count;
        self.halt_until = state.halt_until;
        self.is_kill_switch_active = state.is_kill_switch_active;
        log::info!(
            "[RISK] restored state: start_balance=${:.2}, loss_streak={}",
            self.start_of_day_balance,
            self.consecutive_loss_count
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioGuardState {
    pub start_of_day_balance: f64,
    pub last_day_reset: DateTime<Utc>,
    pub consecutive_loss_count: usize,
    pub halt_until: Option<DateTime<Utc>>,
    pub is_kill_switch_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MarginMode, Timeframe};

    fn decision(action: Action, leverage: f64) -> Decision {
        Decision {
            symbol: "BTC".to_string(),
            action,
            confidence: 75.0,
            entry_price: Some(100_000.0),
            position_size_percent: Some(20.0),
            take_profit: Some(103_000.0),
            stop_loss: Some(98_000.0),
            leverage,
            reasoning: "test".to_string(),
            timeframe: Timeframe::Short,
        }
    }

    fn position(side: Side) -> Position {
        Position {
            instrument_id: "BTC-USDT-SWAP".to_string(),
            side,
            contracts: 1.0,
            entry_price: 100_000.0,
            mark_price: 100_000.0,
            leverage: 5.0,
            margin_mode: MarginMode::Cross,
            unrealised_pnl: 0.0,
            liquidation_price: 0.0,
        }
    }

    fn no_contract_values() -> HashMap<String, f64> {
        HashMap::new()
    }

    #[test]
    fn s1_open_passes() {
        let d = decision(Action::OpenLong, 5.0);
        let report = validate(&[], &d, 1_000.0, 800.0, 1_000.0, &no_contract_values());
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn close_actions_are_always_valid() {
        let d = decision(Action::CloseLong, 5.0);
        let report = validate(&[position(Side::Long)], &d, 1_000.0, 5.0, 50_000.0, &no_contract_values());
        assert!(report.is_valid);
    }

    #[test]
    fn s3_duplicate_same_direction_rejected() {
        let d = decision(Action::OpenLong, 5.0);
        let report = validate(&[position(Side::Long)], &d, 10_000.0, 5_000.0, 1_000.0, &no_contract_values());
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn opposite_direction_is_not_a_duplicate() {
        let d = decision(Action::OpenLong, 5.0);
        let report = validate(&[position(Side::Short)], &d, 10_000.0, 5_000.0, 1_000.0, &no_contract_values());
        assert!(!report.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn leverage_above_cap_is_rejected() {
        let d = decision(Action::OpenLong, 20.0);
        let report = validate(&[], &d, 10_000.0, 5_000.0, 1_000.0, &no_contract_values());
        assert!(report.errors.iter().any(|e| e.contains("leverage")));
    }

    #[test]
    fn below_min_order_size_is_rejected() {
        let d = decision(Action::OpenLong, 5.0);
        let report = validate(&[], &d, 10_000.0, 5_000.0, 5.0, &no_contract_values());
        assert!(report.errors.iter().any(|e| e.contains("minimum order size")));
    }

    #[test]
    fn insufficient_available_margin_is_rejected() {
        let d = decision(Action::OpenLong, 5.0);
        let report = validate(&[], &d, 10_000.0, 10.0, 1_000.0, &no_contract_values());
        assert!(report.errors.iter().any(|e| e.contains("available margin")));
    }

    #[test]
    fn exposure_grows_monotonically_with_more_positions() {
        let d = decision(Action::OpenLong, 5.0);
        let no_positions = validate(&[], &d, 100_000.0, 50_000.0, 2_000.0, &no_contract_values());
        let one_position = validate(&[position(Side::Short)], &d, 100_000.0, 50_000.0, 2_000.0, &no_contract_values());
        assert!(
            one_position.risk_metrics.projected_total_exposure_pct
                >= no_positions.risk_metrics.projected_total_exposure_pct
        );
    }

    #[test]
    fn exposure_scales_with_looked_up_contract_value() {
        let d = decision(Action::OpenLong, 5.0);
        let mut doge = position(Side::Short);
        doge.instrument_id = "DOGE-USDT-SWAP".to_string();
        doge.contracts = 100.0;
        doge.mark_price = 0.2;

        let unit_value = validate(&[doge.clone()], &d, 100_000.0, 50_000.0, 2_000.0, &no_contract_values());
        let mut ctvals = HashMap::new();
        ctvals.insert("DOGE-USDT-SWAP".to_string(), 1_000.0);
        let real_value = validate(&[doge], &d, 100_000.0, 50_000.0, 2_000.0, &ctvals);

        // DOGE's ctVal=1000 means its real notional, and therefore exposure,
        // is 1000x what the unit-contract-value fallback would compute.
        assert!(
            real_value.risk_metrics.projected_total_exposure_pct
                > unit_value.risk_metrics.projected_total_exposure_pct
        );
    }

    fn fixed_clock() -> Arc<dyn Clock> {
        Arc::new(crate::clock::FixedClock::new(1_700_000_000_000))
    }

    #[test]
    fn portfolio_guard_halts_after_consecutive_losses() {
        let mut guard = PortfolioGuard::new(
            PortfolioGuardConfig { max_consecutive_losses: 3, ..Default::default() },
            1_000.0,
            fixed_clock(),
        );
        for _ in 0..3 {
            guard.update_trade_result(-10.0, 990.0);
        }
        assert!(guard.can_trade().is_err());
    }

    #[test]
    fn portfolio_guard_resets_loss_streak_on_win() {
        let mut guard = PortfolioGuard::new(
            PortfolioGuardConfig { max_consecutive_losses: 3, ..Default::default() },
            1_000.0,
            fixed_clock(),
        );
        guard.update_trade_result(-10.0, 990.0);
        guard.update_trade_result(10.0, 1_000.0);
        guard.update_trade_result(-10.0, 990.0);
        assert!(guard.can_trade().is_ok());
    }

    #[test]
    fn portfolio_guard_halt_clears_once_fixed_clock_passes_halt_end() {
        let clock = Arc::new(crate::clock::FixedClock::new(1_700_000_000_000));
        let mut guard = PortfolioGuard::new(
            PortfolioGuardConfig {
                max_consecutive_losses: 1,
                trading_halt_duration_secs: 60,
                ..Default::default()
            },
            1_000.0,
            clock.clone(),
        );
        guard.update_trade_result(-10.0, 990.0);
        assert!(guard.can_trade().is_err());
        clock.advance_ms(61_000);
        assert!(guard.can_trade().is_ok());
    }
}
