//! Persistence collaborators
//!
//! Narrow contracts the core reads from and writes to:
//! - `CandleStore`: ordered, deduplicated OHLCV series per symbol/timeframe
//! - `SignalStore`: signals with atomic create-if-absent on the dedup key
//! - `TradeStore`: paper trades with atomic close-if-open
//!
//! Implementations: in-memory store with JSON snapshots, in-memory and CSV
//! candle stores, and an append-only CSV journal of closed trades.

mod candles;
mod journal;
mod memory;

pub use candles::{CsvCandleStore, InMemoryCandleStore};
pub use journal::{CsvTradeJournal, TradeJournalRecord};
pub use memory::{InMemoryStore, StoreSnapshot};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::types::{Candle, PaperTrade, Signal, SignalState, Timeframe};

/// Source of candle history
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Last `lookback` candles, oldest first, strictly ordered by open time.
    /// `DataUnavailable` when the series is missing or empty.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> EngineResult<Vec<Candle>>;
}

/// Signal persistence
pub trait SignalStore: Send + Sync {
    /// Insert `signal` unless a non-terminal signal already holds its
    /// (symbol, direction) key. Check and insert happen atomically;
    /// the loser gets `DuplicateAdmission`.
    fn insert_signal_if_absent(&self, signal: Signal) -> EngineResult<Signal>;

    fn get_signal(&self, id: &Uuid) -> Option<Signal>;

    fn signals(&self) -> Vec<Signal>;

    /// Apply `update` only if the signal is currently in one of `expected`.
    /// `NotFound` if absent, `InvalidTransition` on state mismatch.
    fn update_signal_if(
        &self,
        id: &Uuid,
        expected: &[SignalState],
        update: &dyn Fn(&mut Signal),
    ) -> EngineResult<Signal>;

    /// Remove every signal matching `predicate`. Never touches trades.
    fn remove_signals_where(&self, predicate: &dyn Fn(&Signal) -> bool) -> Vec<Signal>;
}

/// Result of an atomic close attempt
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// This call closed the trade
    Closed(PaperTrade),
    /// Trade was no longer open; carries its unchanged record
    AlreadyClosed(PaperTrade),
    NotFound,
}

impl CloseOutcome {
    pub fn closed(self) -> Option<PaperTrade> {
        match self {
            CloseOutcome::Closed(trade) => Some(trade),
            _ => None,
        }
    }
}

/// Paper trade persistence
pub trait TradeStore: Send + Sync {
    /// Store a new OPEN trade. Refuses a second trade for the same
    /// originating signal.
    fn insert_trade(&self, trade: PaperTrade) -> EngineResult<()>;

    fn get_trade(&self, id: &Uuid) -> Option<PaperTrade>;

    /// All trades ordered by open time
    fn trades(&self) -> Vec<PaperTrade>;

    fn open_trades(&self) -> Vec<PaperTrade> {
        self.trades()
            .into_iter()
            .filter(|t| t.status.is_open())
            .collect()
    }

    /// Apply `close` only while the trade is OPEN. Exactly one caller can
    /// observe `Closed` for a given trade.
    fn close_if_open(&self, id: &Uuid, close: &dyn Fn(&mut PaperTrade)) -> CloseOutcome;
}
