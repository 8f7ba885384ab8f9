//! Error types for the signal and paper-trade core.
//!
//! Every variant is recoverable at the component boundary: batch passes log
//! the failure for one symbol or trade and carry on with the rest.

use thiserror::Error;

use crate::types::{Direction, Timeframe};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Candle or price data missing or stale; the symbol is skipped this tick.
    #[error("data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// Not enough history to compute an indicator; treated as "no signal".
    #[error("{indicator} not ready for {symbol} {timeframe}: {available}/{required} candles")]
    NotReady {
        symbol: String,
        timeframe: Timeframe,
        indicator: &'static str,
        required: usize,
        available: usize,
    },

    /// Candidate signal with nonsensical risk parameters.
    #[error("invalid setup for {symbol} {direction}: {reason}")]
    InvalidSetup {
        symbol: String,
        direction: Direction,
        reason: String,
    },

    /// Another non-terminal signal already holds the (symbol, direction) key.
    #[error("duplicate admission for {symbol} {direction}")]
    DuplicateAdmission { symbol: String, direction: Direction },

    #[error("not found: {0}")]
    NotFound(String),

    /// Signal state machine rejected the transition
    #[error("invalid state transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Outcomes that are part of normal operation rather than faults.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            EngineError::NotReady { .. }
                | EngineError::DuplicateAdmission { .. }
                | EngineError::DataUnavailable { .. }
        )
    }
}
