// scheduler.rs — Decision Scheduler (spec.md §4.10) + PortfolioGuard wiring.
//
// Grounded on the teacher's main.rs 100ms loop and its background monitors
// (tokio::spawn'd latency/stall/drawdown reporters), restructured per
// spec.md §9's recommendation of an explicit Scheduler value rather than
// ambient global state.

use crate::funds::BalanceSource;
use crate::instruments::InstrumentSource;
use crate::llm::LlmOracle;
use crate::model::CycleContext;
use crate::orders::ExchangeClient;
use crate::pipeline::{run_symbol_pipeline, PipelineContext, SymbolOutcome, SymbolReport};
use crate::reflection::ReflectionStore;
use crate::risk::PortfolioGuard;
use crate::store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// The 1.15 factor covers fees plus a 15% buffer, per spec.md §4.10.
const TRADABLE_FACTOR: f64 = 1.15;
const DEFAULT_TRADABLE_LEVERAGE: f64 = 5.0;

pub struct SchedulerConfig {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub auto_execute: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(30),
            auto_execute: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub succeeded: usize,
    pub failed: usize,
    pub executed: usize,
    pub wall_time_ms: u128,
    pub avg_symbol_time_ms: u128,
}

/// `price / leverage * 1.15 <= availableCash` filters out symbols the
/// account cannot currently afford to open even a minimal position in.
/// Returns (tradable, skipped_with_reason).
pub fn filter_tradable(
    symbols: &[String],
    available_cash: f64,
    prices: &std::collections::HashMap<String, f64>,
    leverage: f64,
) -> (Vec<String>, Vec<(String, String)>) {
    let mut tradable = Vec::new();
    let mut skipped = Vec::new();
    for symbol in symbols {
        match prices.get(symbol) {
            Some(&price) if leverage > 0.0 => {
                let required = price / leverage * TRADABLE_FACTOR;
                if required <= available_cash {
                    tradable.push(symbol.clone());
                } else {
                    skipped.push((symbol.clone(), format!("requires {:.2}, have {:.2}", required, available_cash)));
                }
            }
            _ => skipped.push((symbol.clone(), "no price available".to_string())),
        }
    }
    (tradable, skipped)
}

pub struct DecisionScheduler<E, L, I, B, S> {
    exchange: Arc<E>,
    llm: Arc<L>,
    instruments: Arc<crate::instruments::InstrumentRegistry<I>>,
    funds: Arc<crate::funds::FundScheduler<B>>,
    reflections: Arc<ReflectionStore>,
    store: Arc<S>,
    guard: Mutex<PortfolioGuard>,
    config: SchedulerConfig,
    running: AtomicBool,
    invocation_count: std::sync::atomic::AtomicU64,
    trading_start_time: i64,
}

impl<E, L, I, B, S> DecisionScheduler<E, L, I, B, S>
where
    E: ExchangeClient + 'static,
    L: LlmOracle + 'static,
    I: InstrumentSource + 'static,
    B: BalanceSource + 'static,
    S: Store + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<E>,
        llm: Arc<L>,
        instruments: Arc<crate::instruments::InstrumentRegistry<I>>,
        funds: Arc<crate::funds::FundScheduler<B>>,
        reflections: Arc<ReflectionStore>,
        store: Arc<S>,
        guard: PortfolioGuard,
        config: SchedulerConfig,
        trading_start_time: i64,
    ) -> Self {
        Self {
            exchange,
            llm,
            instruments,
            funds,
            reflections,
            store,
            guard: Mutex::new(guard),
            config,
            running: AtomicBool::new(false),
            invocation_count: std::sync::atomic::AtomicU64::new(0),
            trading_start_time,
        }
    }

    /// Single-instance guard: returns false if a cycle is already running.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs `run_cycle` forever: `initial_delay`, then a cycle every
    /// `interval`, with `sleepUntilNext = max(1s, interval - cycleElapsed)`
    /// per spec.md §4.10. Intended to be spawned as its own task.
    pub async fn run_forever(&self, enabled_symbols: &[(String, String)], now_ms_source: impl Fn() -> i64) {
        tokio::time::sleep(self.config.initial_delay).await;
        loop {
            let cycle_start = Instant::now();
            if self.try_start() {
                self.run_cycle(enabled_symbols, now_ms_source()).await;
                self.finish();
            } else {
                log::warn!("[SCHED] previous cycle still running, skipping this tick");
            }
            let sleep_for = self.config.interval.saturating_sub(cycle_start.elapsed()).max(Duration::from_secs(1));
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Runs one decision cycle across `enabled_symbols`, isolating failures
    /// per symbol. Returns aggregate stats.
    pub async fn run_cycle(&self, enabled_symbols: &[(String, String)], now_ms: i64) -> CycleStats {
        let invocation_count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        let cycle_start = Instant::now();

        if let Err(e) = self.guard.lock().await.can_trade() {
            log::warn!("[SCHED] cycle skipped: {}", e);
            return CycleStats::default();
        }

        let available_cash = self.funds.refresh().await;

        let instrument_ids: Vec<String> = enabled_symbols.iter().map(|(_, id)| id.clone()).collect();
        let prices = match self.exchange.get_tickers(&instrument_ids).await {
            Ok(p) => p,
            Err(e) => {
                log::error!("[SCHED] get_tickers failed, aborting cycle: {}", e);
                return CycleStats::default();
            }
        };

        let price_by_symbol: std::collections::HashMap<String, f64> = enabled_symbols
            .iter()
            .filter_map(|(symbol, id)| prices.get(id).map(|p| (symbol.clone(), *p)))
            .collect();

        let symbol_names: Vec<String> = enabled_symbols.iter().map(|(s, _)| s.clone()).collect();
        let (tradable, skipped) =
            filter_tradable(&symbol_names, available_cash, &price_by_symbol, DEFAULT_TRADABLE_LEVERAGE);
        for (symbol, reason) in &skipped {
            log::info!("[SCHED] skipping {}: {}", symbol, reason);
        }

        let account = match self.exchange.get_balance().await {
            Ok(a) => a,
            Err(e) => {
                log::error!("[SCHED] get_balance failed, aborting cycle: {}", e);
                return CycleStats::default();
            }
        };

        let cycle = CycleContext {
            invocation_count,
            trading_start_time: self.trading_start_time,
            refreshed_available_cash: available_cash,
        };

        let ctx = Arc::new(PipelineContext {
            exchange: self.exchange.clone(),
            llm: self.llm.clone(),
            instruments: self.instruments.clone(),
            funds: self.funds.clone(),
            reflections: self.reflections.clone(),
            store: self.store.clone(),
            now_ms,
        });

        let instrument_by_symbol: std::collections::HashMap<String, String> =
            enabled_symbols.iter().map(|(s, id)| (s.clone(), id.clone())).collect();

        // Each symbol runs as its own tokio task rather than a future polled
        // inline in this one: spec.md §4.9/§5 requires that a failure in one
        // symbol's pipeline — including a genuine panic, not just a returned
        // error — never takes the rest of the cycle down with it. A
        // `JoinHandle`'s `Err` (a caught panic) is turned into a `Failed`
        // report for just that symbol instead of propagating.
        let handles: Vec<(String, tokio::task::JoinHandle<SymbolReport>)> = tradable
            .iter()
            .map(|symbol| {
                let ctx = ctx.clone();
                let symbol = symbol.clone();
                let instrument_id =
                    instrument_by_symbol.get(&symbol).cloned().unwrap_or_else(|| symbol.clone());
                let auto_execute = self.config.auto_execute;
                let handle = tokio::spawn(async move {
                    run_symbol_pipeline(&ctx, &symbol, &instrument_id, account, cycle, auto_execute).await
                });
                (symbol, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (symbol, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(join_err) => {
                    log::error!("[SCHED] symbol task for {} panicked: {}", symbol, join_err);
                    reports.push(SymbolReport {
                        symbol,
                        outcome: SymbolOutcome::Failed,
                        detail: format!("task panicked: {}", join_err),
                        executed: 0,
                    });
                }
            }
        }

        let mut stats = CycleStats::default();
        for report in &reports {
            match report.outcome {
                SymbolOutcome::Succeeded => stats.succeeded += 1,
                SymbolOutcome::Failed => stats.failed += 1,
            }
            stats.executed += report.executed;
        }

        stats.wall_time_ms = cycle_start.elapsed().as_millis();
        stats.avg_symbol_time_ms = if !reports.is_empty() { stats.wall_time_ms / reports.len() as u128 } else { 0 };

        log::info!(
            "[SCHED] cycle #{} complete: succeeded={} failed={} executed={} wall_time={}ms avg={}ms",
            invocation_count,
            stats.succeeded,
            stats.failed,
            stats.executed,
            stats.wall_time_ms,
            stats.avg_symbol_time_ms
        );

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_tradable_keeps_affordable_symbols() {
        let mut prices = std::collections::HashMap::new();
        prices.insert("BTC".to_string(), 100_000.0);
        prices.insert("ETH".to_string(), 3_000.0);
        let symbols = vec!["BTC".to_string(), "ETH".to_string()];
        let (tradable, skipped) = filter_tradable(&symbols, 1_000.0, &prices, 5.0);
        assert_eq!(tradable, vec!["ETH".to_string()]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0, "BTC");
    }

    #[test]
    fn filter_tradable_applies_115_percent_buffer() {
        let mut prices = std::collections::HashMap::new();
        // price/leverage = 100, *1.15 = 115 > 110 available -> skipped.
        prices.insert("BTC".to_string(), 500.0);
        let symbols = vec!["BTC".to_string()];
        let (tradable, skipped) = filter_tradable(&symbols, 110.0, &prices, 5.0);
        assert!(tradable.is_empty());
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn filter_tradable_skips_symbols_with_no_price() {
        let prices = std::collections::HashMap::new();
        let symbols = vec!["BTC".to_string()];
        let (tradable, skipped) = filter_tradable(&symbols, 100_000.0, &prices, 5.0);
        assert!(tradable.is_empty());
        assert_eq!(skipped[0].1, "no price available");
    }
}
