// prompt.rs — Prompt Assembler (spec.md §4.6).
//
// Builds the text sent to the LLM Oracle for one symbol: a session
// preamble, the current market snapshot, recent reflections, and a rigid
// instructions block enumerating the allowed actions and their sizing
// rules. Pure string assembly, stable under concatenation — no network
// calls, no randomness.

use crate::model::{Account, CycleContext, Position, TradeReflection};

pub struct PromptInputs<'a> {
    pub symbol: &'a str,
    pub instrument_id: &'a str,
    pub mark_price: f64,
    pub account: Account,
    pub current_position: Option<&'a Position>,
    pub recent_reflections: &'a [TradeReflection],
    pub cycle: CycleContext,
    pub now_ms: i64,
}

/// Assembles the full prompt text for one symbol's decision cycle.
pub fn assemble(inputs: &PromptInputs) -> String {
    let mut sections = Vec::new();
    sections.push(preamble(inputs));
    sections.push(market_section(inputs));
    sections.push(position_section(inputs));
    if !inputs.recent_reflections.is_empty() {
        sections.push(reflections_section(inputs.recent_reflections));
    }
    sections.push(instructions_section());
    sections.join("\n\n")
}

fn preamble(inputs: &PromptInputs) -> String {
    format!(
        "You are an autonomous perpetual futures trading agent evaluating {symbol} ({instrument_id}).\n\
         Cycle #{cycle}, {minutes:.1} minutes since session start.\n\
         Account total equity: {equity:.2}, available balance: {available:.2}.",
        symbol = inputs.symbol,
        instrument_id = inputs.instrument_id,
        cycle = inputs.cycle.invocation_count,
        minutes = inputs.cycle.trading_minutes(inputs.now_ms),
        equity = inputs.account.total_equity,
        available = inputs.account.available_balance,
    )
}

fn market_section(inputs: &PromptInputs) -> String {
    format!("Market data:\n- mark price: {:.8}", inputs.mark_price)
}

fn position_section(inputs: &PromptInputs) -> String {
    match inputs.current_position {
        Some(p) => format!(
            "Current position: {} {} contracts at entry {:.8}, mark {:.8}, leverage {:.1}x, unrealised pnl {:.2}.",
            p.side.as_str(),
            p.contracts,
            p.entry_price,
            p.mark_price,
            p.leverage,
            p.unrealised_pnl
        ),
        None => "Current position: none.".to_string(),
    }
}

fn reflections_section(reflections: &[TradeReflection]) -> String {
    let mut lines = vec!["Recent trade reflections:".to_string()];
    for r in reflections {
        lines.push(format!(
            "- {} {:?}: outcome={:?} pnl%={} mistakes={} insights={}",
            r.symbol,
            r.action,
            r.outcome,
            r.pnl_percentage.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "n/a".to_string()),
            r.mistakes.as_deref().unwrap_or("none"),
            r.insights.as_deref().unwrap_or("none"),
        ));
    }
    lines.join("\n")
}

fn instructions_section() -> String {
    "Instructions:\n\
     Respond with a single JSON object (or a {\"decisions\": [...]} array for multiple symbols).\n\
     Allowed actions: OPEN_LONG, OPEN_SHORT, CLOSE_LONG, CLOSE_SHORT, HOLD.\n\
     For OPEN_LONG or OPEN_SHORT you must include positionSizePercent (5-50, percent of \
     available cash), takeProfit, and stopLoss. Both are mandatory; an open decision without \
     them will be rejected before it reaches the exchange.\n\
     Do not emit a CLOSE action for a symbol with no open position; emit HOLD instead.\n\
     Do not emit an OPEN action for a symbol that already has an open position in the same \
     direction; emit HOLD instead.\n\
     leverage must be between 1 and 10. confidence must be between 0 and 100.\n\
     Always include a short reasoning string explaining the decision."
        .to_string()
}
