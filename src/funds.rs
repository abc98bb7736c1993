// funds.rs — Fund Scheduler (spec.md §4.2).
//
// Mutex-serialised in-memory budget of available quote currency. The mutex
// is short-lived; no network call may occur while holding it (spec.md §9).

use crate::clock::Clock;
use crate::model::FundAllocation;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_available_balance(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationResult {
    pub allocated: f64,
    pub available: f64,
    pub sufficient: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FundStats {
    pub available_funds: f64,
    pub total_allocations: usize,
    pub total_allocated: f64,
    pub total_confirmed_used: f64,
}

struct State {
    available_funds: f64,
    allocations: HashMap<String, FundAllocation>,
    total_confirmed_used: f64,
}

pub struct FundScheduler<B: BalanceSource> {
    source: B,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl<B: BalanceSource> FundScheduler<B> {
    pub fn new(source: B, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            state: Mutex::new(State {
                available_funds: 0.0,
                allocations: HashMap::new(),
                total_confirmed_used: 0.0,
            }),
        }
    }

    /// Fetches current available quote-currency balance and overwrites
    /// `availableFunds`. Must be called at the start of every scheduler cycle.
    pub async fn refresh(&self) -> f64 {
        let balance = self.source.fetch_available_balance().await;
        let mut state = self.state.lock().await;
        state.available_funds = balance;
        balance
    }

    /// Allocates `amount` for `symbol` in strict mode: rejects outright if
    /// `amount > availableFunds`. A second allocation for the same symbol
    /// before release/confirm is a contract violation and is rejected.
    pub async fn allocate(&self, symbol: &str, amount: f64) -> AllocationResult {
        let mut state = self.state.lock().await;
        if state.allocations.contains_key(symbol) {
            log::error!(
                "[FUND] Allocate({}) rejected: existing allocation not yet released/confirmed",
                symbol
            );
            return AllocationResult {
                allocated: 0.0,
                available: state.available_funds,
                sufficient: false,
            };
        }
        if amount <= state.available_funds {
            state.available_funds -= amount;
            let now = self.clock.now_ms();
            state.allocations.insert(
                symbol.to_string(),
                FundAllocation {
                    symbol: symbol.to_string(),
                    requested_amount: amount,
                    allocated_amount: amount,
                    timestamp: now,
                },
            );
            AllocationResult { allocated: amount, available: state.available_funds, sufficient: true }
        } else {
            log::warn!(
                "[FUND] Allocate({}, {:.2}) insufficient: available={:.2}",
                symbol, amount, state.available_funds
            );
            AllocationResult { allocated: 0.0, available: state.available_funds, sufficient: false }
        }
    }

    /// Returns the full allocated amount to availableFunds and drops the
    /// record. No-op if none exists.
    pub async fn release(&self, symbol: &str) {
        let mut state = self.state.lock().await;
        if let Some(alloc) = state.allocations.remove(symbol) {
            state.available_funds += alloc.allocated_amount;
        }
    }

    /// Drops the record; if `actual_used < allocated`, refunds the difference.
    pub async fn confirm(&self, symbol: &str, actual_used: Option<f64>) {
        let mut state = self.state.lock().await;
        if let Some(alloc) = state.allocations.remove(symbol) {
            let used = actual_used.unwrap_or(alloc.allocated_amount);
            state.total_confirmed_used += used;
            if used < alloc.allocated_amount {
                state.available_funds += alloc.allocated_amount - used;
            }
        }
    }

    pub async fn get_available(&self) -> f64 {
        self.state.lock().await.available_funds
    }

    pub async fn get_stats(&self) -> FundStats {
        let state = self.state.lock().await;
        FundStats {
            available_funds: state.available_funds,
            total_allocations: state.allocations.len(),
            total_allocated: state.allocations.values().map(|a| a.allocated_amount).sum(),
            total_confirmed_used: state.total_confirmed_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    struct FixedBalance(f64);

    #[async_trait]
    impl BalanceSource for FixedBalance {
        async fn fetch_available_balance(&self) -> f64 {
            self.0
        }
    }

    fn scheduler(balance: f64) -> FundScheduler<FixedBalance> {
        FundScheduler::new(FixedBalance(balance), Arc::new(FixedClock::new(0)))
    }

    #[tokio::test]
    async fn allocate_then_release_restores_exact_balance() {
        let sched = scheduler(1_000.0);
        assert_eq!(sched.refresh().await, 1_000.0);

        let r = sched.allocate("BTC", 200.0).await;
        assert!(r.sufficient);
        assert_eq!(sched.get_available().await, 800.0);

        sched.release("BTC").await;
        assert_eq!(sched.get_available().await, 1_000.0);
    }

    #[tokio::test]
    async fn allocate_rejects_when_insufficient() {
        let sched = scheduler(100.0);
        sched.refresh().await;
        let r = sched.allocate("ETH", 200.0).await;
        assert!(!r.sufficient);
        assert_eq!(r.allocated, 0.0);
        assert_eq!(sched.get_available().await, 100.0);
    }

    #[tokio::test]
    async fn double_allocate_same_symbol_is_rejected() {
        let sched = scheduler(1_000.0);
        sched.refresh().await;
        assert!(sched.allocate("BTC", 100.0).await.sufficient);
        let second = sched.allocate("BTC", 50.0).await;
        assert!(!second.sufficient);
        assert_eq!(sched.get_available().await, 900.0);
    }

    #[tokio::test]
    async fn confirm_refunds_unused_portion() {
        let sched = scheduler(1_000.0);
        sched.refresh().await;
        sched.allocate("BTC", 200.0).await;
        sched.confirm("BTC", Some(150.0)).await;
        // 200 allocated, 150 used -> 50 refunded
        assert_eq!(sched.get_available().await, 850.0);
        let stats = sched.get_stats().await;
        assert_eq!(stats.total_confirmed_used, 150.0);
        assert_eq!(stats.total_allocations, 0);
    }

    #[tokio::test]
    async fn fund_conservation_under_interleaving() {
        let sched = scheduler(1_000.0);
        sched.refresh().await;

        sched.allocate("BTC", 100.0).await;
        sched.allocate("ETH", 200.0).await;
        sched.allocate("SOL", 50.0).await;

        let stats = sched.get_stats().await;
        assert!(stats.available_funds + stats.total_allocated <= 1_000.0 + 1e-9);

        sched.release("BTC").await;
        sched.confirm("ETH", Some(200.0)).await;
        sched.release("SOL").await;

        // Every allocate matched by release/confirm -> availableFunds ==
        // lastRefreshed - totalConfirmedUsed.
        let stats = sched.get_stats().await;
        assert!((stats.available_funds - (1_000.0 - stats.total_confirmed_used)).abs() < 1e-9);
    }
}
