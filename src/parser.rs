// parser.rs — Decision Parser (spec.md §4.5).
//
// Pure function: LLM reply text in, Vec<Decision> out. Never panics, never
// logs (the caller decides what to do with a parse failure); always
// produces at least one decision, falling back to HOLD when nothing usable
// is found in the reply.

use crate::model::{Action, Decision, Timeframe};
use serde_json::Value;

const HOLD_FALLBACK_CHARS: usize = 150;

/// Extracts one or more decisions from a raw LLM reply. Totality: this
/// function always returns a non-empty vector, never panics.
pub fn parse_reply(symbol: &str, raw_reply: &str) -> Vec<Decision> {
    match extract_json(raw_reply) {
        Some(value) => decisions_from_value(symbol, &value, raw_reply),
        None => vec![fallback_hold(raw_reply)],
    }
}

fn decisions_from_value(symbol: &str, value: &Value, raw_reply: &str) -> Vec<Decision> {
    let array = if let Some(arr) = value.get("decisions").and_then(Value::as_array) {
        arr.clone()
    } else if let Value::Array(arr) = value {
        arr.clone()
    } else {
        vec![value.clone()]
    };

    let decisions: Vec<Decision> = array.iter().filter_map(|v| decision_from_object(symbol, v)).collect();

    if decisions.is_empty() {
        vec![fallback_hold(raw_reply)]
    } else {
        decisions
    }
}

fn decision_from_object(default_symbol: &str, value: &Value) -> Option<Decision> {
    let obj = value.as_object()?;

    let symbol = obj
        .get("symbol")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| default_symbol.to_string());

    let action = obj.get("action").and_then(parse_action).unwrap_or(Action::Hold);

    let confidence = coerce_f64(obj.get("confidence")).unwrap_or(0.0).clamp(0.0, 100.0);
    let entry_price = coerce_f64(obj.get("entryPrice").or_else(|| obj.get("entry_price")));
    let position_size_percent =
        coerce_f64(obj.get("positionSizePercent").or_else(|| obj.get("position_size_percent")))
            .map(|v| v.clamp(5.0, 50.0));
    let take_profit = coerce_f64(obj.get("takeProfit").or_else(|| obj.get("take_profit")));
    let stop_loss = coerce_f64(obj.get("stopLoss").or_else(|| obj.get("stop_loss")));
    let leverage = coerce_f64(obj.get("leverage")).unwrap_or(1.0).clamp(1.0, 10.0);
    let reasoning = obj
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default();
    let timeframe = obj
        .get("timeframe")
        .and_then(Value::as_str)
        .and_then(parse_timeframe)
        .unwrap_or(Timeframe::Short);

    let decision = Decision {
        symbol,
        action,
        confidence,
        entry_price,
        position_size_percent: if action.is_open() { position_size_percent.or(Some(20.0)) } else { None },
        take_profit: if action.is_open() { take_profit } else { None },
        stop_loss: if action.is_open() { stop_loss } else { None },
        leverage,
        reasoning,
        timeframe,
    };

    Some(decision)
}

fn parse_action(value: &Value) -> Option<Action> {
    let raw = value.as_str()?.to_uppercase();
    match raw.as_str() {
        "OPEN_LONG" | "OPENLONG" => Some(Action::OpenLong),
        "OPEN_SHORT" | "OPENSHORT" => Some(Action::OpenShort),
        "CLOSE_LONG" | "CLOSELONG" => Some(Action::CloseLong),
        "CLOSE_SHORT" | "CLOSESHORT" => Some(Action::CloseShort),
        "HOLD" => Some(Action::Hold),
        _ => None,
    }
}

fn parse_timeframe(raw: &str) -> Option<Timeframe> {
    match raw.to_uppercase().as_str() {
        "SHORT" => Some(Timeframe::Short),
        "MEDIUM" => Some(Timeframe::Medium),
        "LONG" => Some(Timeframe::Long),
        _ => None,
    }
}

/// Lenient numeric coercion: accepts a JSON number or a numeric string.
fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Totality property (spec.md §8 #3): the synthetic fallback always carries
/// `symbol="GENERAL"`, regardless of which symbol's cycle invoked the
/// parser — it marks "nothing usable came back", not a HOLD call on this
/// symbol specifically.
const FALLBACK_SYMBOL: &str = "GENERAL";

fn fallback_hold(raw_reply: &str) -> Decision {
    let truncated: String = raw_reply.chars().take(HOLD_FALLBACK_CHARS).collect();
    Decision::hold(FALLBACK_SYMBOL, truncated)
}

/// Scans `text` for the first balanced `{...}` or `[...]` span and attempts
/// to parse it as JSON, ignoring surrounding prose/markdown fences.
fn extract_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate() {
        let c = b as char;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        let candidate = &text[s..=i];
                        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                            return Some(value);
                        }
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_object_open() {
        let reply = r#"Here is my call: {"symbol":"BTC","action":"OPEN_LONG","confidence":80,"entryPrice":100000,"positionSizePercent":20,"takeProfit":103000,"stopLoss":98000,"leverage":5,"reasoning":"breakout","timeframe":"SHORT"}"#;
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, Action::OpenLong);
        assert_eq!(decisions[0].leverage, 5.0);
    }

    #[test]
    fn parses_decisions_array() {
        let reply = r#"{"decisions":[{"symbol":"BTC","action":"HOLD","reasoning":"wait"},{"symbol":"ETH","action":"CLOSE_LONG","reasoning":"take profit"}]}"#;
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].action, Action::Hold);
        assert_eq!(decisions[1].symbol, "ETH");
    }

    #[test]
    fn lowercase_action_is_normalized() {
        let reply = r#"{"symbol":"BTC","action":"open_short","leverage":"5","reasoning":"x"}"#;
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions[0].action, Action::OpenShort);
        assert_eq!(decisions[0].leverage, 5.0);
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let reply = r#"{"symbol":"BTC","action":"OPEN_LONG","confidence":"77.5","entryPrice":"100000","positionSizePercent":"25","takeProfit":"105000","stopLoss":"95000","leverage":"3","reasoning":"x"}"#;
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions[0].confidence, 77.5);
        assert_eq!(decisions[0].entry_price, Some(100_000.0));
    }

    #[test]
    fn garbage_reply_falls_back_to_hold() {
        let reply = "the market looks uncertain, I will wait and see what happens next";
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, Action::Hold);
        assert_eq!(decisions[0].symbol, "GENERAL");
        assert!(decisions[0].reasoning.starts_with("the market looks uncertain"));
    }

    #[test]
    fn fallback_reasoning_is_truncated_to_150_chars() {
        let long_text = "x".repeat(500);
        let decisions = parse_reply("BTC", &long_text);
        assert_eq!(decisions[0].reasoning.chars().count(), HOLD_FALLBACK_CHARS);
    }

    #[test]
    fn json_embedded_in_markdown_fence_is_extracted() {
        let reply = "```json\n{\"symbol\":\"BTC\",\"action\":\"HOLD\",\"reasoning\":\"waiting\"}\n```";
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions[0].action, Action::Hold);
    }

    #[test]
    fn parser_is_total_never_panics_on_arbitrary_input() {
        let inputs = [
            "",
            "{",
            "}}}}",
            "null",
            "[]",
            "{\"decisions\":[]}",
            "{\"action\":123}",
            "\u{0}\u{1}garbage",
        ];
        for input in inputs {
            let decisions = parse_reply("BTC", input);
            assert!(!decisions.is_empty());
        }
    }

    #[test]
    fn hold_decision_carries_no_sizing_fields() {
        let reply = r#"{"symbol":"BTC","action":"HOLD","reasoning":"flat"}"#;
        let decisions = parse_reply("BTC", reply);
        assert!(decisions[0].is_structurally_valid());
    }

    #[test]
    fn missing_action_on_a_decision_defaults_to_hold() {
        let reply = r#"{"decisions":[{"symbol":"BTC"},{"symbol":"ETH","action":"HOLD","reasoning":"wait"}]}"#;
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].symbol, "BTC");
        assert_eq!(decisions[0].action, Action::Hold);
    }

    #[test]
    fn open_decision_defaults_missing_size_to_20_percent() {
        let reply = r#"{"symbol":"BTC","action":"OPEN_LONG","takeProfit":103000,"stopLoss":98000,"reasoning":"x"}"#;
        let decisions = parse_reply("BTC", reply);
        assert_eq!(decisions[0].position_size_percent, Some(20.0));
        assert!(decisions[0].is_structurally_valid());
    }

    /// Property #4 (spec.md §8): a decision serialised back to the
    /// single-object JSON shape and re-parsed round-trips field-for-field.
    #[test]
    fn single_object_decision_round_trips_through_serialization() {
        let original = Decision {
            symbol: "ETH".to_string(),
            action: Action::OpenShort,
            confidence: 62.5,
            entry_price: Some(3_500.0),
            position_size_percent: Some(30.0),
            take_profit: Some(3_300.0),
            stop_loss: Some(3_650.0),
            leverage: 4.0,
            reasoning: "momentum fading".to_string(),
            timeframe: Timeframe::Medium,
        };
        let json = serde_json::to_string(&original).unwrap();
        let decisions = parse_reply(&original.symbol, &json);
        assert_eq!(decisions.len(), 1);
        let round_tripped = &decisions[0];
        assert_eq!(round_tripped.symbol, original.symbol);
        assert_eq!(round_tripped.action, original.action);
        assert_eq!(round_tripped.confidence, original.confidence);
        assert_eq!(round_tripped.entry_price, original.entry_price);
        assert_eq!(round_tripped.position_size_percent, original.position_size_percent);
        assert_eq!(round_tripped.take_profit, original.take_profit);
        assert_eq!(round_tripped.stop_loss, original.stop_loss);
        assert_eq!(round_tripped.leverage, original.leverage);
        assert_eq!(round_tripped.reasoning, original.reasoning);
        assert_eq!(round_tripped.timeframe, original.timeframe);
    }
}
