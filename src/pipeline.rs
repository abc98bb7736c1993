// pipeline.rs — Per-Symbol Pipeline (spec.md §4.9).
//
// Grounded on the teacher's main.rs per-coin loop body
// (`for (coin, snap) in &l2_snap { ... }`) — the same isolate-and-continue
// structure, lifted into its own function so the scheduler can fan it out
// as one task per symbol instead of inlining it in a loop.

use crate::error::{ExchangeError, LlmError};
use crate::funds::{BalanceSource, FundScheduler};
use crate::instruments::{InstrumentRegistry, InstrumentSource};
use crate::llm::LlmOracle;
use crate::margin;
use crate::model::{Account, Action, CycleContext, Decision, DecisionRecord, DecisionStatus, Position};
use crate::orders::{attach_take_profit_stop_loss, close_by_contracts, open_by_quote, ExchangeClient};
use crate::parser::parse_reply;
use crate::prompt::{assemble, PromptInputs};
use crate::reflection::{RecordCloseInput, RecordOpenInput, ReflectionStore};
use crate::risk;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SymbolReport {
    pub symbol: String,
    pub outcome: SymbolOutcome,
    pub detail: String,
    pub executed: usize,
}

/// Owns `Arc` handles rather than borrows so a whole context can be cloned
/// cheaply into a `tokio::spawn`ed, `'static` per-symbol task (spec.md §5:
/// per-symbol tasks run as independent tasks, not inline futures sharing one
/// task's stack — a panic in one must not take down the others).
pub struct PipelineContext<E, L, I, B, S> {
    pub exchange: Arc<E>,
    pub llm: Arc<L>,
    pub instruments: Arc<InstrumentRegistry<I>>,
    pub funds: Arc<FundScheduler<B>>,
    pub reflections: Arc<ReflectionStore>,
    pub store: Arc<S>,
    pub now_ms: i64,
}

impl<E, L, I, B, S> Clone for PipelineContext<E, L, I, B, S> {
    fn clone(&self) -> Self {
        Self {
            exchange: self.exchange.clone(),
            llm: self.llm.clone(),
            instruments: self.instruments.clone(),
            funds: self.funds.clone(),
            reflections: self.reflections.clone(),
            store: self.store.clone(),
            now_ms: self.now_ms,
        }
    }
}

/// Runs steps 1-i for a single symbol. Never propagates an error out; every
/// failure is captured into the returned `SymbolReport` so the scheduler's
/// fan-out can continue with the remaining symbols.
pub async fn run_symbol_pipeline<E, L, I, B, S>(
    ctx: &PipelineContext<E, L, I, B, S>,
    symbol: &str,
    instrument_id: &str,
    account: Account,
    cycle: CycleContext,
    auto_execute: bool,
) -> SymbolReport
where
    E: ExchangeClient,
    L: LlmOracle,
    I: InstrumentSource,
    B: BalanceSource,
    S: Store,
{
    match run_inner(ctx, symbol, instrument_id, account, cycle, auto_execute).await {
        Ok((detail, executed)) => {
            SymbolReport { symbol: symbol.to_string(), outcome: SymbolOutcome::Succeeded, detail, executed }
        }
        Err(detail) => {
            SymbolReport { symbol: symbol.to_string(), outcome: SymbolOutcome::Failed, detail, executed: 0 }
        }
    }
}

async fn run_inner<E, L, I, B, S>(
    ctx: &PipelineContext<E, L, I, B, S>,
    symbol: &str,
    instrument_id: &str,
    account: Account,
    cycle: CycleContext,
    auto_execute: bool,
) -> Result<(String, usize), String>
where
    E: ExchangeClient,
    L: LlmOracle,
    I: InstrumentSource,
    B: BalanceSource,
    S: Store,
{
    // 1-2. market data + prompt.
    let tickers = ctx
        .exchange
        .get_tickers(&[instrument_id.to_string()])
        .await
        .map_err(|e| format!("get_tickers failed: {}", e))?;
    let mark_price = *tickers.get(instrument_id).ok_or_else(|| "no ticker for instrument".to_string())?;

    let positions = ctx.exchange.get_positions().await.map_err(|e| format!("get_positions failed: {}", e))?;
    let current_position = positions.iter().find(|p| p.instrument_id == instrument_id);

    let prompt = assemble(&PromptInputs {
        symbol,
        instrument_id,
        mark_price,
        account,
        current_position,
        recent_reflections: &[],
        cycle,
        now_ms: ctx.now_ms,
    });

    // 3. LLM call.
    let reply = ctx.llm.complete(&prompt).await.map_err(|e| format!("llm call failed: {}", format_llm_error(&e)))?;

    // 4. Parse decisions.
    let decisions = parse_reply(symbol, &reply);

    let mut executed = 0;
    let mut skipped = 0;
    for decision in decisions {
        match process_decision(ctx, &decision, instrument_id, &positions, account, mark_price, auto_execute, &prompt, &reply).await {
            Ok(true) => executed += 1,
            Ok(false) => skipped += 1,
            Err(e) => log::error!("[PIPELINE] {} decision processing error: {}", symbol, e),
        }
    }

    Ok((format!("executed={} skipped={}", executed, skipped), executed))
}

/// Returns `Ok(true)` if the decision resulted in an exchange submission,
/// `Ok(false)` if it was a HOLD or was skipped for a recoverable reason.
async fn process_decision<E, L, I, B, S>(
    ctx: &PipelineContext<E, L, I, B, S>,
    decision: &Decision,
    instrument_id: &str,
    positions: &[Position],
    account: Account,
    mark_price: f64,
    auto_execute: bool,
    prompt: &str,
    reply: &str,
) -> Result<bool, String>
where
    E: ExchangeClient,
    L: LlmOracle,
    I: InstrumentSource,
    B: BalanceSource,
    S: Store,
{
    let decision_id = Uuid::new_v4().to_string();

    // a. HOLD -> record approved, done.
    if decision.action == Action::Hold {
        ctx.store.insert_decision(DecisionRecord {
            id: decision_id,
            title: format!("{} HOLD", decision.symbol),
            description: decision.reasoning.clone(),
            ts: ctx.now_ms,
            status: DecisionStatus::Approved,
            prompt: prompt.to_string(),
            reply: reply.to_string(),
        });
        return Ok(false);
    }

    if decision.action.is_close() {
        return process_close(ctx, decision, instrument_id, positions, mark_price, decision_id, prompt, reply).await;
    }

    process_open(ctx, decision, instrument_id, positions, account, mark_price, auto_execute, decision_id, prompt, reply)
        .await
}

async fn process_open<E, L, I, B, S>(
    ctx: &PipelineContext<E, L, I, B, S>,
    decision: &Decision,
    instrument_id: &str,
    positions: &[Position],
    account: Account,
    mark_price: f64,
    auto_execute: bool,
    decision_id: String,
    prompt: &str,
    reply: &str,
) -> Result<bool, String>
where
    E: ExchangeClient,
    L: LlmOracle,
    I: InstrumentSource,
    B: BalanceSource,
    S: Store,
{
    // b. percent -> quote amount.
    let percent = decision.position_size_percent.unwrap_or(20.0);
    let quote_amount = account.available_balance * percent / 100.0;

    // c. Allocate.
    let allocation = ctx.funds.allocate(&decision.symbol, quote_amount).await;
    if !allocation.sufficient {
        log::warn!("[PIPELINE] {} allocation of {:.2} insufficient, skipping", decision.symbol, quote_amount);
        return Ok(false);
    }

    // d. Margin calculator.
    let meta = match ctx.instruments.get(instrument_id).await {
        Ok(meta) => meta,
        Err(e) => {
            ctx.funds.release(&decision.symbol).await;
            return Err(format!("instrument lookup failed: {}", e));
        }
    };
    // entryPrice is optional (spec.md §3) and the live prompt never asks the
    // LLM for it (prompt.rs's instructions block only requires
    // positionSizePercent/takeProfit/stopLoss/leverage/confidence/reasoning),
    // so most OPEN decisions carry none. Fall back to the cycle's ticker
    // price rather than 0, which would zero out raw_contracts and make
    // every such OPEN fail meets_minimum.
    let entry_price = decision.entry_price.unwrap_or(mark_price);
    let calc = margin::compute(entry_price, quote_amount, decision.leverage, meta.lot_size);
    if !calc.meets_minimum {
        ctx.funds.release(&decision.symbol).await;
        return Ok(false);
    }

    // e. Risk validator. Exposure must be weighted by each position's own
    // contractValue (spec.md §4.1), not the current symbol's — `positions`
    // spans the whole account, so look every instrument up rather than
    // reusing `meta` (which only describes `instrument_id`).
    let mut contract_values = HashMap::with_capacity(positions.len());
    contract_values.insert(instrument_id.to_string(), meta.contract_value);
    for p in positions {
        if !contract_values.contains_key(&p.instrument_id) {
            if let Ok(other_meta) = ctx.instruments.get(&p.instrument_id).await {
                contract_values.insert(p.instrument_id.clone(), other_meta.contract_value);
            }
        }
    }
    let report = risk::validate(
        positions,
        decision,
        account.total_equity,
        account.available_balance,
        calc.actual_notional,
        &contract_values,
    );
    if !report.is_valid {
        log::warn!("[PIPELINE] {} risk validation failed: {:?}", decision.symbol, report.errors);
        ctx.funds.release(&decision.symbol).await;
        return Ok(false);
    }

    // f. autoExecute == false -> persist as pending, release.
    if !auto_execute {
        ctx.store.insert_decision(DecisionRecord {
            id: decision_id,
            title: format!("{} {:?}", decision.symbol, decision.action),
            description: decision.reasoning.clone(),
            ts: ctx.now_ms,
            status: DecisionStatus::Pending,
            prompt: prompt.to_string(),
            reply: reply.to_string(),
        });
        ctx.funds.release(&decision.symbol).await;
        return Ok(false);
    }

    // g. Insert pending decision row.
    ctx.store.insert_decision(DecisionRecord {
        id: decision_id.clone(),
        title: format!("{} {:?}", decision.symbol, decision.action),
        description: decision.reasoning.clone(),
        ts: ctx.now_ms,
        status: DecisionStatus::Pending,
        prompt: prompt.to_string(),
        reply: reply.to_string(),
    });

    // h. OPEN -> submit, attach TP/SL, RecordOpen, approve, confirm.
    let side = decision.action.side().ok_or_else(|| "open decision missing side".to_string())?;
    let margin_mode = crate::model::MarginMode::Cross;
    match open_by_quote(ctx.exchange.as_ref(), instrument_id, side, quote_amount, decision.leverage, margin_mode).await {
        Ok(_confirmation) => {
            attach_take_profit_stop_loss(
                ctx.exchange.as_ref(),
                instrument_id,
                side,
                margin_mode,
                calc.contracts,
                meta.lot_size,
                decision.take_profit,
                decision.stop_loss,
            )
            .await;
            ctx.reflections.record_open(RecordOpenInput {
                decision_id: decision_id.clone(),
                symbol: decision.symbol.clone(),
                action: decision.action,
                entry_price,
                entry_ts: ctx.now_ms,
                confidence: decision.confidence,
                leverage: decision.leverage,
                size_usdt: quote_amount,
                reasoning: decision.reasoning.clone(),
                market_conditions: "snapshot".to_string(),
            });
            ctx.store.update_decision_status(&decision_id, DecisionStatus::Approved);
            ctx.funds.confirm(&decision.symbol, Some(calc.required_margin)).await;
            Ok(true)
        }
        Err(e) => {
            ctx.store.update_decision_status(&decision_id, DecisionStatus::Rejected);
            ctx.funds.release(&decision.symbol).await;
            Err(format!("open_by_quote failed: {}", e))
        }
    }
}

async fn process_close<E, L, I, B, S>(
    ctx: &PipelineContext<E, L, I, B, S>,
    decision: &Decision,
    instrument_id: &str,
    positions: &[Position],
    mark_price: f64,
    decision_id: String,
    prompt: &str,
    reply: &str,
) -> Result<bool, String>
where
    E: ExchangeClient,
    L: LlmOracle,
    I: InstrumentSource,
    B: BalanceSource,
    S: Store,
{
    let side = decision.action.side().ok_or_else(|| "close decision missing side".to_string())?;
    let Some(position) = positions.iter().find(|p| p.instrument_id == instrument_id && p.side == side) else {
        return Ok(false);
    };

    let meta = ctx.instruments.get(instrument_id).await.map_err(|e: ExchangeError| e.to_string())?;

    ctx.store.insert_decision(DecisionRecord {
        id: decision_id.clone(),
        title: format!("{} {:?}", decision.symbol, decision.action),
        description: decision.reasoning.clone(),
        ts: ctx.now_ms,
        status: DecisionStatus::Pending,
        prompt: prompt.to_string(),
        reply: reply.to_string(),
    });

    let margin_mode = position.margin_mode;
    match close_by_contracts(ctx.exchange.as_ref(), instrument_id, side, position.contracts, meta.lot_size, margin_mode).await {
        Ok(_confirmation) => {
            // `position` was snapshotted from `get_positions()` before this
            // close; its `mark_price` field is whatever the exchange last
            // stamped on open/update, not necessarily the current ticker.
            // Use the ticker price fetched for this cycle instead.
            let pnl = match side {
                crate::model::Side::Long => (mark_price - position.entry_price) * position.contracts,
                crate::model::Side::Short => (position.entry_price - mark_price) * position.contracts,
            };
            // The CLOSE decision has its own fresh id; the reflection row to
            // update is keyed by the *original OPEN's* decision id, which
            // this pipeline doesn't otherwise carry across cycles.
            match ctx.reflections.find_pending_decision_id(&decision.symbol, side) {
                Some(open_decision_id) => ctx.reflections.record_close(RecordCloseInput {
                    open_decision_id,
                    exit_price: mark_price,
                    pnl_amount: pnl,
                    now_ms: ctx.now_ms,
                }),
                None => log::warn!(
                    "[PIPELINE] {} close has no matching pending reflection row to update",
                    decision.symbol
                ),
            }
            ctx.store.update_decision_status(&decision_id, DecisionStatus::Approved);
            ctx.funds.release(&decision.symbol).await;
            Ok(true)
        }
        Err(e) => {
            ctx.store.update_decision_status(&decision_id, DecisionStatus::Rejected);
            ctx.funds.release(&decision.symbol).await;
            Err(format!("close_by_contracts failed: {}", e))
        }
    }
}

fn format_llm_error(e: &LlmError) -> String {
    e.to_string()
}
