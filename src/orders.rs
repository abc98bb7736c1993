// orders.rs — Order Submitter + ExchangeClient contract (spec.md §4.8, §6.1).
//
// Generalized from the teacher's exchange::ExchangeClient trait (async_trait,
// Send + Sync, one method per exchange primitive) and its SimExchange /
// LiveExchange pair, carried over almost verbatim in shape. The teacher's
// Hyperliquid quote-denominated limit-order format becomes spec.md's
// quote-amount-open / contract-count-close contract; EIP-712 signing moves
// out of scope (external collaborator concern, per DESIGN.md).

use crate::error::ExchangeError;
use crate::instruments::InstrumentMeta;
use crate::model::{Account, MarginMode, Position, Side};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct OrderConfirmation {
    pub order_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct ClosedPositionHistory {
    pub instrument_id: String,
    pub side: Side,
    pub realized_pnl: f64,
    pub close_time_ms: i64,
    pub close_avg_price: f64,
    pub open_avg_price: f64,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_instruments(&self) -> Result<HashMap<String, InstrumentMeta>, ExchangeError>;
    async fn get_tickers(&self, instrument_ids: &[String]) -> Result<HashMap<String, f64>, ExchangeError>;
    async fn get_balance(&self) -> Result<Account, ExchangeError>;
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;
    /// Idempotent; failures are non-fatal per spec.md §6.1 and should be
    /// logged by the caller, not propagated as a hard error.
    async fn set_leverage(&self, instrument_id: &str, leverage: f64, margin_mode: MarginMode) -> Result<(), ExchangeError>;
    async fn submit_order(
        &self,
        instrument_id: &str,
        side: Side,
        size: f64,
        target_is_quote: bool,
        reduce_only: bool,
        margin_mode: MarginMode,
    ) -> Result<OrderConfirmation, ExchangeError>;
    async fn submit_algo(
        &self,
        instrument_id: &str,
        side: Side,
        margin_mode: MarginMode,
        size: f64,
        take_profit_trigger: Option<f64>,
        stop_loss_trigger: Option<f64>,
    ) -> Result<OrderConfirmation, ExchangeError>;
    async fn get_positions_history(&self, limit: usize) -> Result<Vec<ClosedPositionHistory>, ExchangeError>;
}

/// `OpenByQuote`: places a market order sized in quote currency, letting
/// the exchange resolve contract count. Sets leverage first (non-fatal on
/// error) per spec.md §4.8.
pub async fn open_by_quote(
    exchange: &dyn ExchangeClient,
    instrument_id: &str,
    side: Side,
    quote_amount: f64,
    leverage: f64,
    margin_mode: MarginMode,
) -> Result<OrderConfirmation, ExchangeError> {
    if let Err(e) = exchange.set_leverage(instrument_id, leverage, margin_mode).await {
        log::warn!("[ORDER] set_leverage({}) failed, assuming already configured: {}", instrument_id, e);
    }
    exchange.submit_order(instrument_id, side, quote_amount, true, false, margin_mode).await
}

/// `CloseByContracts`: reduce-only market order in contract-count units.
/// Rounds `contracts` DOWN to the nearest `lotSize` multiple; if that
/// rounds to zero, fails with `TooSmallToClose` rather than submitting.
pub async fn close_by_contracts(
    exchange: &dyn ExchangeClient,
    instrument_id: &str,
    side: Side,
    contracts: f64,
    lot_size: f64,
    margin_mode: MarginMode,
) -> Result<OrderConfirmation, ExchangeError> {
    let rounded = if lot_size > 0.0 { (contracts / lot_size).floor() * lot_size } else { 0.0 };
    if rounded <= 0.0 {
        return Err(ExchangeError::TooSmallToClose {
            symbol: instrument_id.to_string(),
            rounded,
            lot_size,
        });
    }
    exchange.submit_order(instrument_id, side, rounded, false, true, margin_mode).await
}

/// After a successful OPEN, submits one conditional algo order per leg that
/// carries a trigger price. Rounding-to-zero on a leg is logged and that
/// leg alone is skipped; the OPEN itself never fails because of this step.
pub async fn attach_take_profit_stop_loss(
    exchange: &dyn ExchangeClient,
    instrument_id: &str,
    side: Side,
    margin_mode: MarginMode,
    contracts: f64,
    lot_size: f64,
    take_profit: Option<f64>,
    stop_loss: Option<f64>,
) {
    if take_profit.is_none() && stop_loss.is_none() {
        return;
    }
    let rounded = if lot_size > 0.0 { (contracts / lot_size).floor() * lot_size } else { 0.0 };
    if rounded <= 0.0 {
        log::warn!("[ORDER] {} TP/SL leg skipped: size rounds to zero at lot size {}", instrument_id, lot_size);
        return;
    }
    if let Err(e) = exchange
        .submit_algo(instrument_id, side, margin_mode, rounded, take_profit, stop_loss)
        .await
    {
        log::warn!("[ORDER] {} TP/SL submission failed: {}", instrument_id, e);
    }
}

// ─── SimExchange — in-memory test double ───────────────────────────────

pub struct SimExchange {
    pub balance: std::sync::Mutex<f64>,
    pub positions: std::sync::Mutex<HashMap<String, Position>>,
    pub instruments: HashMap<String, InstrumentMeta>,
    pub mark_prices: std::sync::Mutex<HashMap<String, f64>>,
    pub taker_fee: f64,
}

impl SimExchange {
    pub fn new(initial_balance: f64, instruments: HashMap<String, InstrumentMeta>, taker_fee: f64) -> Self {
        Self {
            balance: std::sync::Mutex::new(initial_balance),
            positions: std::sync::Mutex::new(HashMap::new()),
            instruments,
            mark_prices: std::sync::Mutex::new(HashMap::new()),
            taker_fee,
        }
    }

    pub fn set_mark_price(&self, instrument_id: &str, price: f64) {
        self.mark_prices.lock().unwrap().insert(instrument_id.to_string(), price);
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn get_instruments(&self) -> Result<HashMap<String, InstrumentMeta>, ExchangeError> {
        Ok(self.instruments.clone())
    }

    async fn get_tickers(&self, instrument_ids: &[String]) -> Result<HashMap<String, f64>, ExchangeError> {
        let prices = self.mark_prices.lock().unwrap();
        Ok(instrument_ids
            .iter()
            .filter_map(|id| prices.get(id).map(|p| (id.clone(), *p)))
            .collect())
    }

    async fn get_balance(&self) -> Result<Account, ExchangeError> {
        let balance = *self.balance.lock().unwrap();
        Ok(Account { total_equity: balance, available_balance: balance })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.positions.lock().unwrap().values().cloned().collect())
    }

    async fn set_leverage(&self, _instrument_id: &str, _leverage: f64, _margin_mode: MarginMode) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn submit_order(
        &self,
        instrument_id: &str,
        side: Side,
        size: f64,
        target_is_quote: bool,
        reduce_only: bool,
        margin_mode: MarginMode,
    ) -> Result<OrderConfirmation, ExchangeError> {
        let mark_price = *self
            .mark_prices
            .lock()
            .unwrap()
            .get(instrument_id)
            .ok_or_else(|| ExchangeError::InstrumentUnavailable(instrument_id.to_string()))?;

        if reduce_only {
            let mut positions = self.positions.lock().unwrap();
            let Some(position) = positions.get_mut(instrument_id) else {
                return Err(ExchangeError::Business(format!("no position to close for {}", instrument_id)));
            };
            let contracts = size.min(position.contracts);
            let fee = contracts * mark_price * self.taker_fee;
            let pnl = match side {
                Side::Long => (mark_price - position.entry_price) * contracts,
                Side::Short => (position.entry_price - mark_price) * contracts,
            };
            let mut balance = self.balance.lock().unwrap();
            *balance += pnl - fee;
            position.contracts -= contracts;
            if position.contracts <= 0.0 {
                positions.remove(instrument_id);
            }
            return Ok(OrderConfirmation { order_id: format!("sim-close-{}", instrument_id), status: "filled".to_string() });
        }

        let contracts = if target_is_quote { size / mark_price } else { size };
        let notional = contracts * mark_price;
        let fee = notional * self.taker_fee;
        let mut balance = self.balance.lock().unwrap();
        if *balance < fee {
            return Err(ExchangeError::Business(format!("insufficient balance for fees: {:.2} < {:.2}", *balance, fee)));
        }
        *balance -= fee;
        drop(balance);

        self.positions.lock().unwrap().insert(
            instrument_id.to_string(),
            Position {
                instrument_id: instrument_id.to_string(),
                side,
                contracts,
                entry_price: mark_price,
                mark_price,
                leverage: 1.0,
                margin_mode,
                unrealised_pnl: 0.0,
                liquidation_price: 0.0,
            },
        );

        Ok(OrderConfirmation { order_id: format!("sim-open-{}", instrument_id), status: "filled".to_string() })
    }

    async fn submit_algo(
        &self,
        instrument_id: &str,
        _side: Side,
        _margin_mode: MarginMode,
        _size: f64,
        _take_profit_trigger: Option<f64>,
        _stop_loss_trigger: Option<f64>,
    ) -> Result<OrderConfirmation, ExchangeError> {
        Ok(OrderConfirmation { order_id: format!("sim-algo-{}", instrument_id), status: "accepted".to_string() })
    }

    async fn get_positions_history(&self, _limit: usize) -> Result<Vec<ClosedPositionHistory>, ExchangeError> {
        Ok(Vec::new())
    }
}

// ─── HttpExchangeClient — live REST exchange ───────────────────────────

pub struct HttpExchangeClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    sandbox: bool,
}

impl HttpExchangeClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, sandbox: bool) -> Self {
        Self { base_url: base_url.into(), api_key: api_key.into(), client: reqwest::Client::new(), sandbox }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("API-KEY", &self.api_key);
        if self.sandbox {
            req = req.header("X-Sandbox", "true");
        }
        req
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value, ExchangeError> {
        let resp = req.send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
        if resp.status().as_u16() == 429 {
            return Err(ExchangeError::Transient("rate limited".to_string()));
        }
        if resp.status().is_server_error() {
            return Err(ExchangeError::Transient(format!("server error {}", resp.status())));
        }
        resp.json::<serde_json::Value>().await.map_err(|e| ExchangeError::Transient(e.to_string()))
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn get_instruments(&self) -> Result<HashMap<String, InstrumentMeta>, ExchangeError> {
        let data = self.send_json(self.request(reqwest::Method::GET, "/instruments")).await?;
        let mut out = HashMap::new();
        if let Some(arr) = data["data"].as_array() {
            for entry in arr {
                let Some(inst_id) = entry["instId"].as_str() else { continue };
                out.insert(
                    inst_id.to_string(),
                    InstrumentMeta {
                        contract_value: entry["ctVal"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        min_size: entry["minSz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        lot_size: entry["lotSz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    },
                );
            }
        }
        Ok(out)
    }

    async fn get_tickers(&self, instrument_ids: &[String]) -> Result<HashMap<String, f64>, ExchangeError> {
        let ids = instrument_ids.join(",");
        let data = self
            .send_json(self.request(reqwest::Method::GET, &format!("/tickers?instIds={}", ids)))
            .await?;
        let mut out = HashMap::new();
        if let Some(arr) = data["data"].as_array() {
            for entry in arr {
                if let (Some(id), Some(px)) = (
                    entry["instId"].as_str(),
                    entry["lastPrice"].as_str().and_then(|s| s.parse::<f64>().ok()),
                ) {
                    out.insert(id.to_string(), px);
                }
            }
        }
        Ok(out)
    }

    async fn get_balance(&self) -> Result<Account, ExchangeError> {
        let data = self.send_json(self.request(reqwest::Method::GET, "/balance")).await?;
        let total_equity = data["totalEq"].as_f64().unwrap_or(0.0);
        let available_balance = data["details"][0]["availBal"].as_f64().unwrap_or(total_equity);
        Ok(Account { total_equity, available_balance })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let data = self.send_json(self.request(reqwest::Method::GET, "/positions?type=SWAP")).await?;
        let mut out = Vec::new();
        if let Some(arr) = data["data"].as_array() {
            for entry in arr {
                let Some(inst_id) = entry["instId"].as_str() else { continue };
                let side = match entry["posSide"].as_str() {
                    Some("short") => Side::Short,
                    _ => Side::Long,
                };
                out.push(Position {
                    instrument_id: inst_id.to_string(),
                    side,
                    contracts: entry["pos"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    entry_price: entry["avgPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    mark_price: entry["markPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    leverage: entry["lever"].as_str().and_then(|s| s.parse().ok()).unwrap_or(1.0),
                    margin_mode: match entry["mgnMode"].as_str() {
                        Some("isolated") => MarginMode::Isolated,
                        _ => MarginMode::Cross,
                    },
                    unrealised_pnl: entry["upl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    liquidation_price: entry["liqPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                });
            }
        }
        Ok(out)
    }

    async fn set_leverage(&self, instrument_id: &str, leverage: f64, margin_mode: MarginMode) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "instId": instrument_id,
            "lever": leverage.to_string(),
            "mgnMode": margin_mode_str(margin_mode),
        });
        self.send_json(self.request(reqwest::Method::POST, "/set-leverage").json(&body)).await?;
        Ok(())
    }

    async fn submit_order(
        &self,
        instrument_id: &str,
        side: Side,
        size: f64,
        target_is_quote: bool,
        reduce_only: bool,
        margin_mode: MarginMode,
    ) -> Result<OrderConfirmation, ExchangeError> {
        let body = serde_json::json!({
            "instId": instrument_id,
            "tdMode": margin_mode_str(margin_mode),
            "side": side.as_str(),
            "ordType": "market",
            "sz": size.to_string(),
            "tgtCcy": if target_is_quote { "quote_ccy" } else { "base_ccy" },
            "reduceOnly": reduce_only,
        });
        let data = self.send_json(self.request(reqwest::Method::POST, "/order").json(&body)).await?;
        Ok(OrderConfirmation {
            order_id: data["orderId"].as_str().unwrap_or_default().to_string(),
            status: data["status"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn submit_algo(
        &self,
        instrument_id: &str,
        side: Side,
        margin_mode: MarginMode,
        size: f64,
        take_profit_trigger: Option<f64>,
        stop_loss_trigger: Option<f64>,
    ) -> Result<OrderConfirmation, ExchangeError> {
        let body = serde_json::json!({
            "instId": instrument_id,
            "tdMode": margin_mode_str(margin_mode),
            "side": side.as_str(),
            "ordType": "conditional",
            "sz": size.to_string(),
            "tpTriggerPx": take_profit_trigger.map(|v| v.to_string()),
            "tpOrdPx": "-1",
            "slTriggerPx": stop_loss_trigger.map(|v| v.to_string()),
            "slOrdPx": "-1",
        });
        let data = self.send_json(self.request(reqwest::Method::POST, "/algo-order").json(&body)).await?;
        Ok(OrderConfirmation {
            order_id: data["algoId"].as_str().unwrap_or_default().to_string(),
            status: data["status"].as_str().unwrap_or("accepted").to_string(),
        })
    }

    async fn get_positions_history(&self, limit: usize) -> Result<Vec<ClosedPositionHistory>, ExchangeError> {
        let data = self
            .send_json(self.request(reqwest::Method::GET, &format!("/positions-history?type=SWAP&limit={}", limit)))
            .await?;
        let mut out = Vec::new();
        if let Some(arr) = data["data"].as_array() {
            for entry in arr {
                let Some(inst_id) = entry["instId"].as_str() else { continue };
                out.push(ClosedPositionHistory {
                    instrument_id: inst_id.to_string(),
                    side: match entry["posSide"].as_str() {
                        Some("short") => Side::Short,
                        _ => Side::Long,
                    },
                    realized_pnl: entry["realizedPnl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    close_time_ms: entry["uTime"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
                    close_avg_price: entry["closeAvgPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    open_avg_price: entry["openAvgPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                });
            }
        }
        Ok(out)
    }
}

fn margin_mode_str(mode: MarginMode) -> &'static str {
    match mode {
        MarginMode::Cross => "cross",
        MarginMode::Isolated => "isolated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruments() -> HashMap<String, InstrumentMeta> {
        let mut m = HashMap::new();
        m.insert(
            "BTC-USDT-SWAP".to_string(),
            InstrumentMeta { contract_value: 1.0, min_size: 0.01, lot_size: 0.01 },
        );
        m
    }

    #[tokio::test]
    async fn open_by_quote_creates_a_position() {
        let sim = SimExchange::new(10_000.0, instruments(), 0.0005);
        sim.set_mark_price("BTC-USDT-SWAP", 100_000.0);
        let confirmation = open_by_quote(&sim, "BTC-USDT-SWAP", Side::Long, 1_000.0, 5.0, MarginMode::Cross)
            .await
            .unwrap();
        assert_eq!(confirmation.status, "filled");
        let positions = sim.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].contracts - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_by_contracts_rounds_down_to_lot_size() {
        let sim = SimExchange::new(10_000.0, instruments(), 0.0005);
        sim.set_mark_price("BTC-USDT-SWAP", 100_000.0);
        open_by_quote(&sim, "BTC-USDT-SWAP", Side::Long, 1_000.0, 5.0, MarginMode::Cross).await.unwrap();

        let result = close_by_contracts(&sim, "BTC-USDT-SWAP", Side::Long, 0.017, 0.01, MarginMode::Cross).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn close_by_contracts_fails_too_small_to_close() {
        let sim = SimExchange::new(10_000.0, instruments(), 0.0005);
        sim.set_mark_price("BTC-USDT-SWAP", 100_000.0);
        let err = close_by_contracts(&sim, "BTC-USDT-SWAP", Side::Long, 0.004, 0.01, MarginMode::Cross)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::TooSmallToClose { .. }));
    }

    #[tokio::test]
    async fn attach_tp_sl_skips_silently_when_size_rounds_to_zero() {
        let sim = SimExchange::new(10_000.0, instruments(), 0.0005);
        sim.set_mark_price("BTC-USDT-SWAP", 100_000.0);
        attach_take_profit_stop_loss(
            &sim,
            "BTC-USDT-SWAP",
            Side::Long,
            MarginMode::Cross,
            0.004,
            0.01,
            Some(103_000.0),
            Some(98_000.0),
        )
        .await;
    }
}
