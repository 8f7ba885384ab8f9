//! VolPaper Library
//!
//! Volatility-aware mean-reversion signals with paper-trade simulation

pub mod config;
pub mod error;
pub mod indicators;
pub mod lifecycle;
pub mod paper_trading;
pub mod performance;
pub mod persistence;
pub mod runtime;
pub mod strategy;
pub mod types;
pub mod volatility;

pub use error::{EngineError, EngineResult};
