// store.rs — Durable Store (spec.md §6.3).
//
// Generalized from the teacher's persistence::{load_state, save_state}
// whole-engine JSON snapshot round trip into a trait over three tables, so
// tests substitute an in-memory implementation without touching disk. A
// file-backed implementation would serialize the same way the teacher's
// `EngineState` does (serde_json::to_string_pretty + fs::write); this crate
// only needs the in-memory store, so that backend is not built out.

use crate::model::{DecisionRecord, DecisionStatus, TradeReflection};
use std::collections::HashMap;
use std::sync::Mutex;

pub trait Store: Send + Sync {
    fn insert_decision(&self, record: DecisionRecord);
    fn update_decision_status(&self, id: &str, status: DecisionStatus);
    fn get_decision(&self, id: &str) -> Option<DecisionRecord>;
    fn list_decisions(&self, limit: usize) -> Vec<DecisionRecord>;

    /// No FK constraint to `decisions` — an orphan insert must succeed.
    fn upsert_trade_reflection(&self, reflection: TradeReflection);
    fn get_trade_reflection(&self, decision_id: &str) -> Option<TradeReflection>;
    fn list_trade_reflections(&self, symbol: Option<&str>) -> Vec<TradeReflection>;

    fn get_coin_config(&self, key: &str) -> Option<String>;
    fn set_coin_config(&self, key: &str, value: String, updated_at: i64);

    /// Convenience over `coin_config["enabled_coins"]`, stored as a JSON array.
    fn enabled_coins(&self) -> Vec<String>;
    fn set_enabled_coins(&self, coins: &[String], updated_at: i64);
}

#[derive(Default)]
struct Tables {
    decisions: HashMap<String, DecisionRecord>,
    trade_reflections: HashMap<String, TradeReflection>,
    coin_config: HashMap<String, (String, i64)>,
}

pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()) }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    fn insert_decision(&self, record: DecisionRecord) {
        self.tables.lock().unwrap().decisions.insert(record.id.clone(), record);
    }

    fn update_decision_status(&self, id: &str, status: DecisionStatus) {
        if let Some(record) = self.tables.lock().unwrap().decisions.get_mut(id) {
            record.status = status;
        }
    }

    fn get_decision(&self, id: &str) -> Option<DecisionRecord> {
        self.tables.lock().unwrap().decisions.get(id).cloned()
    }

    fn list_decisions(&self, limit: usize) -> Vec<DecisionRecord> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<DecisionRecord> = tables.decisions.values().cloned().collect();
        rows.sort_by(|a, b| b.ts.cmp(&a.ts));
        rows.truncate(limit);
        rows
    }

    fn upsert_trade_reflection(&self, reflection: TradeReflection) {
        self.tables
            .lock()
            .unwrap()
            .trade_reflections
            .insert(reflection.decision_id.clone(), reflection);
    }

    fn get_trade_reflection(&self, decision_id: &str) -> Option<TradeReflection> {
        self.tables.lock().unwrap().trade_reflections.get(decision_id).cloned()
    }

    fn list_trade_reflections(&self, symbol: Option<&str>) -> Vec<TradeReflection> {
        self.tables
            .lock()
            .unwrap()
            .trade_reflections
            .values()
            .filter(|r| symbol.map(|s| r.symbol == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    fn get_coin_config(&self, key: &str) -> Option<String> {
        self.tables.lock().unwrap().coin_config.get(key).map(|(v, _)| v.clone())
    }

    fn set_coin_config(&self, key: &str, value: String, updated_at: i64) {
        self.tables.lock().unwrap().coin_config.insert(key.to_string(), (value, updated_at));
    }

    fn enabled_coins(&self) -> Vec<String> {
        self.get_coin_config("enabled_coins")
            .and_then(|v| serde_json::from_str::<Vec<String>>(&v).ok())
            .unwrap_or_default()
    }

    fn set_enabled_coins(&self, coins: &[String], updated_at: i64) {
        let value = serde_json::to_string(coins).unwrap_or_else(|_| "[]".to_string());
        self.set_coin_config("enabled_coins", value, updated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, ReflectionOutcome};

    fn decision(id: &str, ts: i64) -> DecisionRecord {
        DecisionRecord {
            id: id.to_string(),
            title: "decision".to_string(),
            description: "desc".to_string(),
            ts,
            status: DecisionStatus::Pending,
            prompt: "prompt".to_string(),
            reply: "reply".to_string(),
        }
    }

    fn reflection(decision_id: &str, symbol: &str) -> TradeReflection {
        TradeReflection {
            decision_id: decision_id.to_string(),
            symbol: symbol.to_string(),
            action: Action::OpenLong,
            outcome: ReflectionOutcome::Pending,
            entry_price: 100.0,
            exit_price: None,
            entry_ts: 0,
            exit_ts: None,
            pnl_amount: None,
            pnl_percentage: None,
            holding_time_minutes: None,
            confidence: 50.0,
            leverage: 5.0,
            size_usdt: 100.0,
            reasoning: "x".to_string(),
            market_conditions: "y".to_string(),
            mistakes: None,
            insights: None,
            improvement: None,
            actual_vs_expected: None,
            created_at: 0,
        }
    }

    #[test]
    fn insert_and_fetch_decision_round_trips() {
        let store = InMemoryStore::new();
        store.insert_decision(decision("d1", 100));
        let row = store.get_decision("d1").unwrap();
        assert_eq!(row.status, DecisionStatus::Pending);
    }

    #[test]
    fn update_decision_status_is_visible_immediately() {
        let store = InMemoryStore::new();
        store.insert_decision(decision("d1", 100));
        store.update_decision_status("d1", DecisionStatus::Approved);
        assert_eq!(store.get_decision("d1").unwrap().status, DecisionStatus::Approved);
    }

    #[test]
    fn list_decisions_orders_by_ts_descending() {
        let store = InMemoryStore::new();
        store.insert_decision(decision("d1", 100));
        store.insert_decision(decision("d2", 300));
        store.insert_decision(decision("d3", 200));
        let rows = store.list_decisions(10);
        assert_eq!(rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec!["d2", "d3", "d1"]);
    }

    #[test]
    fn trade_reflection_insert_has_no_foreign_key_to_decisions() {
        let store = InMemoryStore::new();
        store.upsert_trade_reflection(reflection("orphan-decision", "BTC"));
        assert!(store.get_trade_reflection("orphan-decision").is_some());
        assert!(store.get_decision("orphan-decision").is_none());
    }

    #[test]
    fn list_trade_reflections_filters_by_symbol() {
        let store = InMemoryStore::new();
        store.upsert_trade_reflection(reflection("d1", "BTC"));
        store.upsert_trade_reflection(reflection("d2", "ETH"));
        let btc_only = store.list_trade_reflections(Some("BTC"));
        assert_eq!(btc_only.len(), 1);
        assert_eq!(btc_only[0].symbol, "BTC");
    }

    #[test]
    fn enabled_coins_round_trips_through_coin_config() {
        let store = InMemoryStore::new();
        store.set_enabled_coins(&["BTC".to_string(), "ETH".to_string()], 1000);
        assert_eq!(store.enabled_coins(), vec!["BTC".to_string(), "ETH".to_string()]);
    }

    #[test]
    fn enabled_coins_defaults_to_empty_when_unset() {
        let store = InMemoryStore::new();
        assert!(store.enabled_coins().is_empty());
    }
}
