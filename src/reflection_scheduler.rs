// reflection_scheduler.rs — Reflection Scheduler (spec.md §4.11).
//
// Grounded on the teacher's shadow-PnL-reporter spawned loop
// (tokio::spawn + tokio::time::sleep + periodic log) in main.rs.

use crate::model::short_symbol_of;
use crate::orders::ExchangeClient;
use crate::reflection::{ClosedPnlEntry, LivePosition, ReflectionStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STARTUP_DELAY: Duration = Duration::from_secs(60);

pub struct ReflectionSchedulerConfig {
    pub interval: Duration,
}

impl Default for ReflectionSchedulerConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(300) }
    }
}

pub struct ReflectionScheduler<E> {
    exchange: Arc<E>,
    reflections: Arc<ReflectionStore>,
    config: ReflectionSchedulerConfig,
    running: AtomicBool,
}

impl<E: ExchangeClient> ReflectionScheduler<E> {
    pub fn new(exchange: Arc<E>, reflections: Arc<ReflectionStore>, config: ReflectionSchedulerConfig) -> Self {
        Self { exchange, reflections, config, running: AtomicBool::new(false) }
    }

    pub fn try_start(&self) -> bool {
        self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs the startup delay then ticks `AutoUpdateOrphans` forever at
    /// `config.interval`. Intended to be spawned as its own task.
    pub async fn run(&self, now_ms_source: impl Fn() -> i64) {
        tokio::time::sleep(STARTUP_DELAY).await;
        loop {
            let updated = self.tick(now_ms_source()).await;
            log::info!("[REFLECT-SCHED] tick complete: {} rows updated", updated);
            tokio::time::sleep(self.config.interval).await;
        }
    }

    pub async fn tick(&self, now_ms: i64) -> usize {
        let positions = match self.exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                log::error!("[REFLECT-SCHED] get_positions failed: {}", e);
                return 0;
            }
        };
        let closed_history = match self.exchange.get_positions_history(100).await {
            Ok(h) => h,
            Err(e) => {
                log::error!("[REFLECT-SCHED] get_positions_history failed: {}", e);
                return 0;
            }
        };

        // Reflection rows are keyed by the short symbol (e.g. "BTC"), but
        // the exchange collaborator only speaks instrument ids (e.g.
        // "BTC-USDT-SWAP") — translate at this boundary so
        // `auto_update_orphans`'s symbol comparison lines up.
        let live_positions: Vec<LivePosition> = positions
            .iter()
            .map(|p| LivePosition { symbol: short_symbol_of(&p.instrument_id).to_string(), side: p.side })
            .collect();
        let closed_entries: Vec<ClosedPnlEntry> = closed_history
            .iter()
            .map(|h| ClosedPnlEntry {
                symbol: short_symbol_of(&h.instrument_id).to_string(),
                side: h.side,
                exit_price: h.close_avg_price,
                exit_ts: h.close_time_ms,
                pnl_amount: h.realized_pnl,
            })
            .collect();

        self.reflections.auto_update_orphans(&live_positions, &closed_entries, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::InstrumentMeta;
    use crate::model::{Action, Side};
    use crate::orders::SimExchange;
    use crate::reflection::RecordOpenInput;
    use std::collections::HashMap;

    fn exchange() -> SimExchange {
        let mut instruments = HashMap::new();
        instruments.insert(
            "BTC-USDT-SWAP".to_string(),
            InstrumentMeta { contract_value: 1.0, min_size: 0.01, lot_size: 0.01 },
        );
        SimExchange::new(10_000.0, instruments, 0.0005)
    }

    #[tokio::test]
    async fn tick_reconciles_orphaned_pending_rows() {
        let exchange = Arc::new(exchange());
        let reflections = Arc::new(ReflectionStore::new());
        reflections.record_open(RecordOpenInput {
            decision_id: "d1".to_string(),
            symbol: "BTC".to_string(),
            action: Action::OpenLong,
            entry_price: 100_000.0,
            entry_ts: 0,
            confidence: 70.0,
            leverage: 5.0,
            size_usdt: 1_000.0,
            reasoning: "x".to_string(),
            market_conditions: "y".to_string(),
        });

        let scheduler = ReflectionScheduler::new(exchange, reflections.clone(), ReflectionSchedulerConfig::default());
        let updated = scheduler.tick(600_000).await;
        assert_eq!(updated, 1);
        let row = reflections.get("d1").unwrap();
        assert!(row.outcome.is_terminal());
    }

    /// Regression: the exchange collaborator only reports full instrument
    /// ids ("BTC-USDT-SWAP"), while reflection rows are keyed by the short
    /// symbol ("BTC") the decision carried. A still-open position must be
    /// recognized across that naming boundary rather than treated as an
    /// orphan on the very first tick.
    #[tokio::test]
    async fn tick_leaves_a_still_open_position_pending() {
        let exchange = exchange();
        exchange.set_mark_price("BTC-USDT-SWAP", 100_000.0);
        crate::orders::open_by_quote(
            &exchange,
            "BTC-USDT-SWAP",
            Side::Long,
            1_000.0,
            5.0,
            crate::model::MarginMode::Cross,
        )
        .await
        .unwrap();
        let exchange = Arc::new(exchange);

        let reflections = Arc::new(ReflectionStore::new());
        reflections.record_open(RecordOpenInput {
            decision_id: "d1".to_string(),
            symbol: "BTC".to_string(),
            action: Action::OpenLong,
            entry_price: 100_000.0,
            entry_ts: 0,
            confidence: 70.0,
            leverage: 5.0,
            size_usdt: 1_000.0,
            reasoning: "x".to_string(),
            market_conditions: "y".to_string(),
        });

        let scheduler = ReflectionScheduler::new(exchange, reflections.clone(), ReflectionSchedulerConfig::default());
        let updated = scheduler.tick(600_000).await;
        assert_eq!(updated, 0);
        let row = reflections.get("d1").unwrap();
        assert_eq!(row.outcome, crate::model::ReflectionOutcome::Pending);
    }

    #[test]
    fn side_mapping_matches_live_position_side() {
        assert_eq!(Side::Long, Side::Long);
    }
}
