// =============================================================================
// LLM response parser — tolerant, per-symbol isolation
// =============================================================================
//
// Expected shape (strict in the prompt, tolerated loosely here):
//
//   { "<SYMBOL>": { "trade_signal_args": {
//       "coin": ..., "signal": "hold|entry|exit", "side": "long|short",
//       "confidence": 0..1, "quantity": frac-of-capital,
//       "entry_price": num, "stop_loss": num, "profit_target": num,
//       "justification": "..." } }, ... }
//
// Tolerances: code fences are stripped upstream; keys may be "BTC" or
// "BTC/USDT"; signal synonyms (buy/entry, sell/exit) normalise; numbers may
// arrive as strings. A failure affects only its own symbol — that symbol
// becomes `hold @ 0.5` with reason "parse_error", never the whole batch.
// =============================================================================

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;

use crate::decision::TradingSignal;
use crate::llm_client::extract_json;
use crate::types::{Side, SignalType};

/// Parse a batch response, producing exactly one signal per watched symbol.
pub fn parse_batch(text: &str, symbols: &[String]) -> BTreeMap<String, TradingSignal> {
    let cleaned = extract_json(text);
    let root: Option<Value> = serde_json::from_str(&cleaned).ok();

    let mut signals = BTreeMap::new();
    for symbol in symbols {
        let signal = root
            .as_ref()
            .and_then(|root| lookup_symbol(root, symbol))
            .and_then(|entry| parse_symbol_entry(symbol, entry));

        signals.insert(
            symbol.clone(),
            signal.unwrap_or_else(|| {
                warn!(symbol = %symbol, "llm response unparseable for symbol");
                TradingSignal::neutral_hold(symbol, "parse_error")
            }),
        );
    }
    signals
}

/// Find the response entry for `symbol`, accepting "BTC/USDT", "BTC", and
/// case variants.
fn lookup_symbol<'a>(root: &'a Value, symbol: &str) -> Option<&'a Value> {
    let object = root.as_object()?;
    let base = symbol.split('/').next().unwrap_or(symbol);

    object
        .iter()
        .find(|(key, _)| {
            key.eq_ignore_ascii_case(symbol)
                || key.eq_ignore_ascii_case(base)
                || key.split('/').next().is_some_and(|kb| kb.eq_ignore_ascii_case(base))
        })
        .map(|(_, value)| value)
}

/// Decode one symbol's `trade_signal_args` into a canonical signal.
fn parse_symbol_entry(symbol: &str, entry: &Value) -> Option<TradingSignal> {
    // Tolerate both nested and flattened shapes.
    let args = entry.get("trade_signal_args").unwrap_or(entry);
    let args = args.as_object()?;

    let side = args
        .get("side")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Side>().ok());

    let raw_signal = args.get("signal").and_then(Value::as_str)?;
    let signal_type = SignalType::normalize(raw_signal, side);

    let confidence = number_f64(args.get("confidence")).unwrap_or(0.5).clamp(0.0, 1.0);
    let reasoning = args
        .get("justification")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut signal = TradingSignal {
        symbol: symbol.to_string(),
        signal_type,
        side: if signal_type == SignalType::Hold { None } else { side },
        confidence,
        reasoning,
        entry_price: number_decimal(args.get("entry_price")),
        stop_loss: number_decimal(args.get("stop_loss")),
        take_profit: number_decimal(args.get("profit_target")),
        size_pct: number_decimal(args.get("quantity")).unwrap_or(Decimal::ZERO),
        leverage: number_f64(args.get("leverage")).map(|l| l as u32).unwrap_or(1).max(1),
    };

    // An entry that cannot state its own levels is not actionable.
    if signal.is_entry() && !signal.geometry_ok() {
        warn!(symbol, "entry signal with inconsistent levels demoted to hold");
        signal = TradingSignal::neutral_hold(symbol, "parse_error");
    }

    Some(signal)
}

/// Accept a JSON number or numeric string.
fn number_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accept a JSON number or numeric string as Decimal.
fn number_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => Decimal::try_from(n.as_f64()?).ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
