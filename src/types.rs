//! Core types used throughout VolPaper
//!
//! Defines candles, timeframes, directions, signals, paper trades and the
//! per-tick price bar fed to the paper-trade monitor.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use crate::volatility::VolatilityBucket;

/// Tolerance for floating point equality checks.
pub const EPSILON: f64 = 1e-9;

/// Ceiling for configured second counts (ten years)
pub const MAX_CONFIG_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Configured seconds as a chrono span, saturating at `MAX_CONFIG_SECS`
pub fn config_duration(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_CONFIG_SECS) as i64)
}

/// Candle timeframes understood by the engine (serialized as "15m", "1h", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    Min1,
    Min5,
    Min15,
    Hour1,
    Hour4,
    Day1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Min15
    }
}

impl Timeframe {
    /// Get duration in seconds
    pub fn duration_secs(&self) -> u64 {
        match self {
            Timeframe::Min1 => 60,
            Timeframe::Min5 => 5 * 60,
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
            Timeframe::Hour4 => 4 * 60 * 60,
            Timeframe::Day1 => 24 * 60 * 60,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs() as i64)
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1m" | "1min" | "m1" => Some(Timeframe::Min1),
            "5m" | "5min" | "m5" => Some(Timeframe::Min5),
            "15m" | "15min" | "m15" => Some(Timeframe::Min15),
            "1h" | "1hour" | "h1" | "60m" => Some(Timeframe::Hour1),
            "4h" | "4hour" | "h4" => Some(Timeframe::Hour4),
            "1d" | "1day" | "d1" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::from_str(&value).ok_or_else(|| format!("unknown timeframe '{value}'"))
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Min1 => write!(f, "1m"),
            Timeframe::Min5 => write!(f, "5m"),
            Timeframe::Min15 => write!(f, "15m"),
            Timeframe::Hour1 => write!(f, "1h"),
            Timeframe::Hour4 => write!(f, "4h"),
            Timeframe::Day1 => write!(f, "1d"),
        }
    }
}

/// Trading direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for longs, -1 for shorts
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Descriptive holding-horizon label attached to a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TradingType {
    Scalp,
    Day,
    Swing,
}

impl TradingType {
    /// Next longer horizon (Swing stays Swing)
    pub fn promote(self) -> Self {
        match self {
            TradingType::Scalp => TradingType::Day,
            TradingType::Day | TradingType::Swing => TradingType::Swing,
        }
    }
}

impl fmt::Display for TradingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingType::Scalp => write!(f, "SCALP"),
            TradingType::Day => write!(f, "DAY"),
            TradingType::Swing => write!(f, "SWING"),
        }
    }
}

/// Candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Symbol, e.g. "BTCUSDT"
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Open time (start of period, UTC)
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
}

impl Candle {
    /// End of the candle period
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.timeframe.duration()
    }

    /// True range against the previous close
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

/// Price range observed for a symbol during one monitoring tick.
///
/// A single tick price is a bar with open = high = low = close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Instant the range was observed (end of the bar)
    pub as_of: DateTime<Utc>,
}

impl PriceBar {
    pub fn tick(price: f64, as_of: DateTime<Utc>) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            as_of,
        }
    }

    pub fn from_candle(candle: &Candle) -> Self {
        Self {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            as_of: candle.close_time(),
        }
    }
}

/// Signal lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalState {
    /// Proposed by the signal engine, not yet admitted
    Pending,
    /// Admitted; eligible to be executed
    Active,
    /// A paper position was opened from it
    Executed,
    /// Market contradicted the setup before execution
    Invalidated,
    /// `expires_at` elapsed without closure
    Expired,
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalState::Pending => write!(f, "PENDING"),
            SignalState::Active => write!(f, "ACTIVE"),
            SignalState::Executed => write!(f, "EXECUTED"),
            SignalState::Invalidated => write!(f, "INVALIDATED"),
            SignalState::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Trading signal generated by the signal engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    /// Symbol captured by value at creation
    pub symbol: String,
    /// Timeframe whose snapshot triggered the signal
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// ATR used for stop/target distances
    pub atr: f64,
    /// Confidence level (0.0 - 1.0)
    pub confidence: f64,
    pub trading_type: TradingType,
    /// Volatility bucket in force when the signal was generated
    pub bucket: VolatilityBucket,
    pub state: SignalState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the position opened from this signal has closed
    #[serde(default)]
    pub position_closed_at: Option<DateTime<Utc>>,
    /// Human-readable rule hits (for diagnostics)
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl Signal {
    /// Dedup key: at most one non-terminal signal per (symbol, direction)
    pub fn dedup_key(&self) -> (String, Direction) {
        (self.symbol.clone(), self.direction)
    }

    /// INVALIDATED, EXPIRED, or EXECUTED with the downstream position closed
    pub fn is_terminal(&self) -> bool {
        match self.state {
            SignalState::Invalidated | SignalState::Expired => true,
            SignalState::Executed => self.position_closed_at.is_some(),
            SignalState::Pending | SignalState::Active => false,
        }
    }
}

/// Paper trade status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    ClosedWin,
    ClosedLoss,
    ClosedManual,
    Cancelled,
}

impl TradeStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, TradeStatus::Open)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "OPEN"),
            TradeStatus::ClosedWin => write!(f, "CLOSED_WIN"),
            TradeStatus::ClosedLoss => write!(f, "CLOSED_LOSS"),
            TradeStatus::ClosedManual => write!(f, "CLOSED_MANUAL"),
            TradeStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Why a paper trade was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::StopLoss => write!(f, "STOP_LOSS"),
            CloseReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            CloseReason::Manual => write!(f, "MANUAL"),
            CloseReason::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Simulated position.
///
/// Owns copies of everything it needs; `originating_signal` is an advisory,
/// non-owning reference that may outlive the signal it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperTrade {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    /// Notional at entry
    pub position_size: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub status: TradeStatus,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
    /// Volatility bucket at open time
    pub bucket: VolatilityBucket,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    /// Net of fees; 0 while open
    pub realized_pnl: f64,
    pub fees_paid: f64,
    #[serde(default)]
    pub originating_signal_ref: Option<Uuid>,
}
