// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a bot. Bots are never deleted, only retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Active,
    Paused,
    Stopped,
}

impl Default for BotStatus {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown bot status: {other}")),
        }
    }
}

/// Direction of a position or entry signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Used in PnL and equity math.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => dec!(1),
            Self::Short => dec!(-1),
        }
    }

    /// Order side string expected by the exchange ("BUY"/"SELL") for entries.
    pub fn order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side string that closes a position of this direction.
    pub fn closing_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Canonical signal type produced by every decision block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    BuyToEnter,
    SellToEnter,
    Close,
    Hold,
}

impl SignalType {
    /// True for the two entry variants.
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::BuyToEnter | Self::SellToEnter)
    }

    /// Normalise the synonyms used by LLM responses and legacy callers into
    /// the canonical variants. `side` disambiguates bare "entry"/"exit".
    pub fn normalize(raw: &str, side: Option<Side>) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "buy_to_enter" | "buy" => Self::BuyToEnter,
            "sell_to_enter" => Self::SellToEnter,
            "entry" | "enter" | "open" => match side {
                Some(Side::Short) => Self::SellToEnter,
                _ => Self::BuyToEnter,
            },
            "sell" | "exit" | "close" => Self::Close,
            _ => Self::Hold,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyToEnter => write!(f, "buy_to_enter"),
            Self::SellToEnter => write!(f, "sell_to_enter"),
            Self::Close => write!(f, "close"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Which decision block a bot runs. Switchable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    Trinity,
    Llm,
    Indicator,
}

impl Default for DecisionMode {
    fn default() -> Self {
        Self::Trinity
    }
}

impl std::fmt::Display for DecisionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trinity => write!(f, "trinity"),
            Self::Llm => write!(f, "llm"),
            Self::Indicator => write!(f, "indicator"),
        }
    }
}

impl std::str::FromStr for DecisionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trinity" => Ok(Self::Trinity),
            "llm" => Ok(Self::Llm),
            "indicator" => Ok(Self::Indicator),
            other => Err(format!("unknown decision mode: {other}")),
        }
    }
}

/// Status of a tracked position.
///
/// `ClosePending` marks a position whose closing order failed after all
/// retries; the monitor re-attempts the close on subsequent cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    ClosePending,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::ClosePending => write!(f, "close_pending"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "close_pending" => Ok(Self::ClosePending),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown position status: {other}")),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Timeout,
    SignalExit,
    Manual,
    DrawdownHalt,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::Timeout => write!(f, "timeout"),
            Self::SignalExit => write!(f, "signal_exit"),
            Self::Manual => write!(f, "manual"),
            Self::DrawdownHalt => write!(f, "drawdown_halt"),
        }
    }
}

impl std::str::FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop_loss" => Ok(Self::StopLoss),
            "take_profit" => Ok(Self::TakeProfit),
            "timeout" => Ok(Self::Timeout),
            "signal_exit" => Ok(Self::SignalExit),
            "manual" => Ok(Self::Manual),
            "drawdown_halt" => Ok(Self::DrawdownHalt),
            other => Err(format!("unknown close reason: {other}")),
        }
    }
}
