// =============================================================================
// LLM prompt builder — one deterministic batch prompt per cycle
// =============================================================================
//
// The template is fixed: identical inputs render identical text, which is
// what makes the response cache fingerprint meaningful. Sections, in order:
// session context, portfolio performance, open positions (capped), today's
// trade stats, market regime across the watch-list (capped), per-symbol
// indicator blocks with short tail series, confidence instructions, and the
// strict JSON schema example.
// =============================================================================

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::db::Bot;
use crate::market_data::MarketSnapshot;
use crate::portfolio::PortfolioState;

/// Per-bot session counters carried across cycles.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub started_at: DateTime<Utc>,
    /// LLM invocations so far this session.
    pub invocations: u64,
    /// Render-time clock, passed in so rendering stays deterministic.
    pub now: DateTime<Utc>,
}

/// Caps applied while rendering.
#[derive(Debug, Clone, Copy)]
pub struct PromptLimits {
    pub max_positions: usize,
    pub max_context_symbols: usize,
}

/// Render the batch decision prompt.
pub fn render_prompt(
    bot: &Bot,
    snapshots: &BTreeMap<String, MarketSnapshot>,
    portfolio: &PortfolioState,
    session: &SessionContext,
    limits: &PromptLimits,
) -> String {
    let mut out = String::with_capacity(4096);

    // --- Session context -----------------------------------------------------
    let minutes = (session.now - session.started_at).num_minutes();
    let _ = writeln!(out, "## Session");
    let _ = writeln!(
        out,
        "Trading session running for {minutes} minutes, {} prior model invocations.",
        session.invocations
    );
    let _ = writeln!(out, "Bot: {} (paper={})", bot.name, bot.paper_trading);
    out.push('\n');

    // --- Portfolio performance ----------------------------------------------
    let _ = writeln!(out, "## Portfolio");
    let _ = writeln!(
        out,
        "Cash: {:.2} USD | Equity: {:.2} USD | Return: {:.2}%",
        portfolio.cash,
        portfolio.equity,
        portfolio.return_pct * rust_decimal_macros::dec!(100)
    );
    out.push('\n');

    // --- Open positions (capped) ---------------------------------------------
    let _ = writeln!(out, "## Open positions");
    if portfolio.open_positions.is_empty() {
        let _ = writeln!(out, "None.");
    } else {
        for position in portfolio.open_positions.iter().take(limits.max_positions) {
            let _ = writeln!(
                out,
                "- {} {} qty {} @ entry {} | mark {} | SL {} | TP {} | uPnL {:.2}",
                position.symbol,
                position.side,
                position.quantity,
                position.entry_price,
                position.current_price,
                position.stop_loss,
                position.take_profit,
                position.unrealized_pnl()
            );
        }
        let hidden = portfolio.open_positions.len().saturating_sub(limits.max_positions);
        if hidden > 0 {
            let _ = writeln!(out, "(+{hidden} more positions not shown)");
        }
    }
    out.push('\n');

    // --- Today's trade stats -------------------------------------------------
    let _ = writeln!(out, "## Today");
    let _ = writeln!(
        out,
        "Entries today: {} | Realized PnL today: {:.2} USD",
        portfolio.trades_today, portfolio.realized_pnl_today
    );
    out.push('\n');

    // --- Market regime across the watch-list (capped) -----------------------
    let _ = writeln!(out, "## Market regime");
    for (symbol, snapshot) in snapshots.iter().take(limits.max_context_symbols) {
        let trend = snapshot
            .indicators
            .supertrend
            .map(|st| st.color.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let _ = writeln!(
            out,
            "- {symbol}: price {} | 24h {:+.2}% | supertrend {trend} | confluence {:.0}",
            snapshot.last_price, snapshot.change_24h_pct, snapshot.confluence_score
        );
    }
    out.push('\n');

    // --- Per-symbol indicator blocks ----------------------------------------
    for (symbol, snapshot) in snapshots {
        let ind = &snapshot.indicators;
        let _ = writeln!(out, "## {symbol}");
        let _ = writeln!(
            out,
            "price={} sma200={} ema20={} ema50={} rsi14={} adx={} atr={} vol_ma={}",
            snapshot.last_price,
            fmt_opt(ind.sma_200),
            fmt_opt(ind.ema_20),
            fmt_opt(ind.ema_50),
            fmt_opt(ind.rsi_14),
            fmt_opt(ind.adx),
            fmt_opt(ind.atr),
            fmt_opt(ind.volume_ma),
        );
        if let Some(macd) = ind.macd {
            let _ = writeln!(
                out,
                "macd={:.4} signal={:.4} histogram={:.4}",
                macd.macd, macd.signal, macd.histogram
            );
        }
        if let Some(rate) = snapshot.funding_rate {
            let _ = writeln!(out, "funding_rate={rate}");
        }
        let _ = writeln!(out, "closes_tail={:?}", snapshot.closes_tail);
        let _ = writeln!(out, "ema20_tail={:?}", snapshot.ema_tail);
        let _ = writeln!(out, "rsi14_tail={:?}", snapshot.rsi_tail);
        out.push('\n');
    }

    // --- Instructions --------------------------------------------------------
    let _ = writeln!(out, "## Instructions");
    let _ = writeln!(
        out,
        "Evaluate each symbol independently. Only propose an entry when \
         confidence is at least 0.6; prefer hold when signals conflict. \
         Confidence must be between 0 and 1. Entries must state entry_price, \
         stop_loss and profit_target consistent with the side, and quantity \
         as a fraction of capital."
    );
    out.push('\n');

    // --- Strict output contract ----------------------------------------------
    let _ = writeln!(
        out,
        "Respond with pure JSON only: no prose, no code fences. One key per \
         symbol, exactly this shape:"
    );
    let _ = writeln!(
        out,
        r#"{{ "BTC": {{ "trade_signal_args": {{
  "coin": "BTC", "signal": "hold|entry|exit", "side": "long|short",
  "confidence": 0.0, "quantity": 0.0, "entry_price": 0.0,
  "stop_loss": 0.0, "profit_target": 0.0, "justification": "..." }} }} }}"#
    );

    out
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => "n/a".to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RiskParams;
    use crate::market_data::{EntrySignals, IndicatorBundle};
    use crate::portfolio::compute_state;
    use crate::types::{BotStatus, DecisionMode};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn bot() -> Bot {
        Bot {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            name: "alpha".into(),
            status: BotStatus::Active,
            initial_capital: dec!(10000),
            capital: dec!(10000),
            total_pnl: Decimal::ZERO,
            model_name: None,
            decision_mode: DecisionMode::Llm,
            symbols: vec!["BTC/USDT".into()],
            risk_params: RiskParams::default(),
            paper_trading: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn snapshot(symbol: &str, price: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.into(),
            last_price: price,
            change_24h_pct: 1.5,
            volume_24h: 1000.0,
            candles_1h: Vec::new(),
            candles_5m: Vec::new(),
            indicators: IndicatorBundle {
                rsi_14: Some(42.1234),
                ..IndicatorBundle::default()
            },
            signals: EntrySignals::default(),
            confluence_score: 40.0,
            closes_tail: vec![1.0, 2.0],
            ema_tail: vec![1.5],
            rsi_tail: vec![40.0],
            funding_rate: None,
        }
    }

    fn fixture() -> (Bot, BTreeMap<String, MarketSnapshot>, PortfolioState, SessionContext) {
        let bot = bot();
        let mut snapshots = BTreeMap::new();
        snapshots.insert("BTC/USDT".to_string(), snapshot("BTC/USDT", dec!(42000)));
        snapshots.insert("ETH/USDT".to_string(), snapshot("ETH/USDT", dec!(2500)));
        let portfolio = compute_state(&bot, vec![], 2, dec!(-12));
        let now = Utc::now();
        let session = SessionContext {
            started_at: now - chrono::Duration::minutes(90),
            invocations: 30,
            now,
        };
        (bot, snapshots, portfolio, session)
    }

    fn limits() -> PromptLimits {
        PromptLimits {
            max_positions: 8,
            max_context_symbols: 10,
        }
    }

    #[test]
    fn prompt_is_deterministic() {
        let (bot, snapshots, portfolio, session) = fixture();
        let a = render_prompt(&bot, &snapshots, &portfolio, &session, &limits());
        let b = render_prompt(&bot, &snapshots, &portfolio, &session, &limits());
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_contains_all_sections() {
        let (bot, snapshots, portfolio, session) = fixture();
        let prompt = render_prompt(&bot, &snapshots, &portfolio, &session, &limits());
        for section in [
            "## Session",
            "## Portfolio",
            "## Open positions",
            "## Today",
            "## Market regime",
            "## BTC/USDT",
            "## ETH/USDT",
            "## Instructions",
            "trade_signal_args",
        ] {
            assert!(prompt.contains(section), "missing section: {section}");
        }
        assert!(prompt.contains("90 minutes"));
        assert!(prompt.contains("Entries today: 2"));
    }

    #[test]
    fn context_symbols_capped() {
        let (bot, mut snapshots, portfolio, session) = fixture();
        for i in 0..15 {
            let symbol = format!("SYM{i:02}/USDT");
            snapshots.insert(symbol.clone(), snapshot(&symbol, dec!(10)));
        }
        let capped = PromptLimits {
            max_positions: 8,
            max_context_symbols: 3,
        };
        let prompt = render_prompt(&bot, &snapshots, &portfolio, &session, &capped);

        // Regime section holds exactly three entries.
        let regime_lines = prompt
            .split("## Market regime")
            .nth(1)
            .unwrap()
            .split("##")
            .next()
            .unwrap()
            .lines()
            .filter(|l| l.starts_with("- "))
            .count();
        assert_eq!(regime_lines, 3);
    }
}
