//! Candle stores: in-memory (append-only) and CSV-backed

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use super::CandleStore;
use crate::error::{EngineError, EngineResult};
use crate::types::{Candle, Timeframe};

fn tail(candles: &[Candle], lookback: usize) -> Vec<Candle> {
    let start = candles.len().saturating_sub(lookback);
    candles[start..].to_vec()
}

/// Candle series keyed by (symbol, timeframe), oldest first
#[derive(Default)]
pub struct InMemoryCandleStore {
    series: RwLock<HashMap<(String, Timeframe), Vec<Candle>>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one candle. Duplicates and out-of-order candles are dropped
    /// (returns false) so every series stays strictly ordered.
    pub fn append(&self, candle: Candle) -> bool {
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        let entry = series
            .entry((candle.symbol.clone(), candle.timeframe))
            .or_default();
        if let Some(last) = entry.last() {
            if candle.open_time <= last.open_time {
                debug!(
                    symbol = %candle.symbol,
                    timeframe = %candle.timeframe,
                    open_time = %candle.open_time,
                    "[CANDLES] Dropping duplicate/out-of-order candle"
                );
                return false;
            }
        }
        entry.push(candle);
        true
    }

    pub fn extend(&self, candles: impl IntoIterator<Item = Candle>) -> usize {
        candles.into_iter().map(|c| self.append(c)).filter(|ok| *ok).count()
    }

    pub fn len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.series
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(symbol.to_string(), timeframe))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> EngineResult<Vec<Candle>> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        match series.get(&(symbol.to_string(), timeframe)) {
            Some(candles) if !candles.is_empty() => Ok(tail(candles, lookback)),
            _ => Err(EngineError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: format!("no {timeframe} candles"),
            }),
        }
    }
}

/// Row layout of `<SYMBOL>_<tf>.csv`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleRecord {
    /// Open time, epoch milliseconds
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Reads `<dir>/<SYMBOL>_<tf>.csv` on every request.
///
/// Rows are sorted and deduplicated by open time on load, so hand-edited or
/// concatenated files still satisfy the ordering contract.
pub struct CsvCandleStore {
    dir: PathBuf,
}

impl CsvCandleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir.join(format!("{symbol}_{timeframe}.csv"))
    }

    fn parse(symbol: &str, timeframe: Timeframe, bytes: &[u8]) -> EngineResult<Vec<Candle>> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes);
        let mut candles = Vec::new();
        for result in reader.deserialize() {
            let record: CandleRecord = result?;
            let Some(open_time) = Utc.timestamp_millis_opt(record.open_time).single() else {
                warn!(symbol, open_time = record.open_time, "[CANDLES] Skipping row with bad timestamp");
                continue;
            };
            candles.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                open_time,
                open: record.open,
                high: record.high,
                low: record.low,
                close: record.close,
                volume: record.volume,
            });
        }
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        Ok(candles)
    }

    /// Write a full series (used by tooling and tests)
    pub fn write_series(path: &Path, candles: &[Candle]) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for c in candles {
            writer.serialize(CandleRecord {
                open_time: c.open_time.timestamp_millis(),
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl CandleStore for CsvCandleStore {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> EngineResult<Vec<Candle>> {
        let path = self.path_for(symbol, timeframe);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::DataUnavailable {
                    symbol: symbol.to_string(),
                    reason: format!("missing {}", path.display()),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let candles = Self::parse(symbol, timeframe, &bytes)?;
        if candles.is_empty() {
            return Err(EngineError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: format!("empty {}", path.display()),
            });
        }
        Ok(tail(&candles, lookback))
    }
}
