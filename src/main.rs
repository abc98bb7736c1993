mod clock;
mod config;
mod error;
mod funds;
mod instruments;
mod llm;
mod margin;
mod model;
mod orders;
mod parser;
mod pipeline;
mod prompt;
mod reflection;
mod reflection_scheduler;
mod risk;
mod scheduler;
mod store;

use async_trait::async_trait;
use clock::{Clock, SystemClock};
use config::Config;
use error::ExchangeError;
use funds::{BalanceSource, FundScheduler};
use instruments::{InstrumentMeta, InstrumentRegistry, InstrumentSource};
use llm::HttpLlmOracle;
use orders::{ExchangeClient, HttpExchangeClient};
use reflection::ReflectionStore;
use reflection_scheduler::{ReflectionScheduler, ReflectionSchedulerConfig};
use risk::{PortfolioGuard, PortfolioGuardConfig};
use scheduler::{DecisionScheduler, SchedulerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use store::{InMemoryStore, Store};

/// Adapts an `ExchangeClient` into the narrow `InstrumentSource` the
/// registry depends on, so `instruments.rs` never needs to know about the
/// wider exchange surface.
struct ExchangeInstrumentSource<E> {
    exchange: Arc<E>,
}

#[async_trait]
impl<E: ExchangeClient> InstrumentSource for ExchangeInstrumentSource<E> {
    async fn fetch_instruments(&self) -> Result<HashMap<String, InstrumentMeta>, ExchangeError> {
        self.exchange.get_instruments().await
    }
}

struct ExchangeBalanceSource<E> {
    exchange: Arc<E>,
}

#[async_trait]
impl<E: ExchangeClient> BalanceSource for ExchangeBalanceSource<E> {
    async fn fetch_available_balance(&self) -> f64 {
        match self.exchange.get_balance().await {
            Ok(account) => account.available_balance,
            Err(e) => {
                log::error!("[FUND] balance refresh failed, keeping previous value: {}", e);
                0.0
            }
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    log::info!("perp-decision-agent starting…");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("startup configuration error: {}", e);
            std::process::exit(1);
        }
    };

    log::info!(
        "  AI scheduler:         {} (interval={}ms, auto_execute={})",
        if config.scheduler_ai_enabled { "ENABLED" } else { "DISABLED" },
        config.scheduler_ai_interval_ms,
        config.scheduler_ai_auto_execute,
    );
    log::info!(
        "  Reflection scheduler: {} (interval={}ms)",
        if config.scheduler_reflection_enabled { "ENABLED" } else { "DISABLED" },
        config.scheduler_reflection_interval_ms,
    );
    log::info!("  Exchange sandbox:     {}", config.exchange_sandbox);

    let exchange = Arc::new(HttpExchangeClient::new(
        config.exchange_base_url.clone(),
        config.exchange_api_key.clone(),
        config.exchange_sandbox,
    ));
    let llm = Arc::new(HttpLlmOracle::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let instruments = Arc::new(InstrumentRegistry::new(ExchangeInstrumentSource { exchange: exchange.clone() }));
    let funds = Arc::new(FundScheduler::new(ExchangeBalanceSource { exchange: exchange.clone() }, clock.clone()));
    let reflections = Arc::new(ReflectionStore::new());

    let starting_balance = match exchange.get_balance().await {
        Ok(a) => a.total_equity,
        Err(e) => {
            log::warn!("[RISK] could not fetch starting balance, defaulting to 0: {}", e);
            0.0
        }
    };
    let guard = PortfolioGuard::new(PortfolioGuardConfig::default(), starting_balance, clock.clone());

    let enabled_coins = store.enabled_coins();
    let enabled_symbols: Vec<(String, String)> = if enabled_coins.is_empty() {
        vec![
            ("BTC".to_string(), "BTC-USDT-SWAP".to_string()),
            ("ETH".to_string(), "ETH-USDT-SWAP".to_string()),
        ]
    } else {
        enabled_coins.iter().map(|c| (c.clone(), format!("{}-USDT-SWAP", c))).collect()
    };

    let trading_start_time = clock.now_ms();

    let decision_scheduler = Arc::new(DecisionScheduler::new(
        exchange.clone(),
        llm.clone(),
        instruments.clone(),
        funds.clone(),
        reflections.clone(),
        store.clone(),
        guard,
        SchedulerConfig {
            interval: Duration::from_millis(config.scheduler_ai_interval_ms),
            initial_delay: Duration::from_secs(30),
            auto_execute: config.scheduler_ai_auto_execute,
        },
        trading_start_time,
    ));

    let reflection_scheduler = Arc::new(ReflectionScheduler::new(
        exchange.clone(),
        reflections.clone(),
        ReflectionSchedulerConfig { interval: Duration::from_millis(config.scheduler_reflection_interval_ms) },
    ));

    if config.scheduler_reflection_enabled {
        let sched = reflection_scheduler.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            if sched.try_start() {
                sched.run(move || clock.now_ms()).await;
            }
        });
    }

    if config.scheduler_ai_enabled {
        let sched = decision_scheduler.clone();
        let symbols = enabled_symbols.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            sched.run_forever(&symbols, move || clock.now_ms()).await;
        });
    }

    log::info!("all systems active, entering steady state");
    std::future::pending::<()>().await;
}
