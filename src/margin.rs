// margin.rs — Margin Calculator (spec.md §4.3). Pure functions, never throw.

pub const TAKER_RATE: f64 = 0.0005; // 0.05%
pub const CLOSE_RATE: f64 = 0.0005; // 0.05%
pub const SAFETY_BUFFER_PCT: f64 = 0.05; // 5%

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginCalculation {
    pub notional: f64,
    pub raw_contracts: f64,
    pub contracts: f64,
    pub actual_notional: f64,
    pub required_margin: f64,
    pub open_fee: f64,
    pub close_fee: f64,
    pub total_required: f64,
    pub safety_buffer: f64,
    pub recommended: f64,
    pub meets_minimum: bool,
}

/// Computes contract count, notional, required margin, fee reserves, and
/// safety buffer for a (symbol, price, quote-amount, leverage) tuple.
pub fn compute(entry_price: f64, quote_amount: f64, leverage: f64, lot_size: f64) -> MarginCalculation {
    let notional = quote_amount * leverage;
    let raw_contracts = if entry_price > 0.0 { notional / entry_price } else { 0.0 };

    let contracts = if lot_size > 0.0 {
        (raw_contracts / lot_size).floor() * lot_size
    } else {
        0.0
    };

    let actual_notional = contracts * entry_price;
    let required_margin = if leverage > 0.0 { actual_notional / leverage } else { 0.0 };
    let open_fee = actual_notional * TAKER_RATE;
    let close_fee = actual_notional * CLOSE_RATE;
    let total_required = required_margin + open_fee + close_fee;
    let safety_buffer = total_required * SAFETY_BUFFER_PCT;
    let recommended = total_required + safety_buffer;
    let meets_minimum = contracts >= lot_size && lot_size > 0.0;

    MarginCalculation {
        notional,
        raw_contracts,
        contracts,
        actual_notional,
        required_margin,
        open_fee,
        close_fee,
        total_required,
        safety_buffer,
        recommended,
        meets_minimum,
    }
}

/// Binary-searches the largest `quoteAmount <= requested` whose `recommended
/// <= availableQuote` and `meetsMinimum` holds. Returns `None` if none exists.
pub fn adjust_to_available(
    entry_price: f64,
    requested: f64,
    leverage: f64,
    lot_size: f64,
    available_quote: f64,
) -> Option<MarginCalculation> {
    let at_requested = compute(entry_price, requested, leverage, lot_size);
    if at_requested.meets_minimum && at_requested.recommended <= available_quote {
        return Some(at_requested);
    }

    let mut lo = 0.0_f64;
    let mut hi = requested;
    let mut best: Option<MarginCalculation> = None;

    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        let calc = compute(entry_price, mid, leverage, lot_size);
        if calc.meets_minimum && calc.recommended <= available_quote {
            best = Some(calc);
            lo = mid;
        } else {
            hi = mid;
        }
        if (hi - lo).abs() < 1e-9 {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_happy_path_open() {
        // From spec.md §8 S1: price=100_000, quoteAmount=200, leverage=5,
        // lotSize=0.01 -> notional=1000, rawContracts=0.01, contracts=0.01,
        // requiredMargin=200.
        let calc = compute(100_000.0, 200.0, 5.0, 0.01);
        assert_eq!(calc.notional, 1_000.0);
        assert!((calc.raw_contracts - 0.01).abs() < 1e-9);
        assert!((calc.contracts - 0.01).abs() < 1e-9);
        assert!((calc.required_margin - 200.0).abs() < 1e-6);
        assert!(calc.meets_minimum);
    }

    #[test]
    fn contracts_is_always_a_multiple_of_lot_size() {
        for price in [1.0, 10.0, 100_000.0] {
            for quote in [1.0, 37.0, 500.0, 12_345.0] {
                for leverage in [1.0, 5.0, 10.0] {
                    for lot in [0.01, 0.1, 1.0, 10.0] {
                        let calc = compute(price, quote, leverage, lot);
                        let ratio = calc.contracts / lot;
                        assert!(
                            (ratio - ratio.round()).abs() < 1e-6,
                            "contracts {} not a multiple of lot {}",
                            calc.contracts,
                            lot
                        );
                        assert!(calc.contracts >= 0.0);
                        assert!(calc.contracts * price / leverage <= quote * (1.0 + 1e-9) + 1e-6);
                    }
                }
            }
        }
    }

    #[test]
    fn below_lot_size_does_not_meet_minimum() {
        let calc = compute(100_000.0, 1.0, 1.0, 0.01);
        // notional=1, rawContracts=0.00001 < lotSize
        assert!(!calc.meets_minimum);
    }

    #[test]
    fn adjust_to_available_finds_largest_affordable_amount() {
        let found = adjust_to_available(100_000.0, 1_000.0, 5.0, 0.01, 100.0).unwrap();
        assert!(found.recommended <= 100.0 + 1e-6);
        assert!(found.meets_minimum);
    }

    #[test]
    fn adjust_to_available_returns_none_when_nothing_fits() {
        let found = adjust_to_available(100_000.0, 1_000.0, 1.0, 0.01, 0.01);
        assert!(found.is_none());
    }
}
