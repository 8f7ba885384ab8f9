//! Volatility Classifier
//!
//! Scores each symbol with a unit-free volatility ratio and buckets it into
//! LOW / MEDIUM / HIGH using two configured cut points. The same thresholds
//! apply to every symbol; each bucket maps to a parameter profile consumed by
//! the signal engine.
//!
//! Results are cached per symbol until `valid_until`. Short history never
//! fails: it yields MEDIUM flagged as low-confidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::indicators::atr_series;
use crate::types::{config_duration, Candle, EPSILON, MAX_CONFIG_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolatilityBucket {
    Low,
    Medium,
    High,
}

impl VolatilityBucket {
    pub const ALL: [VolatilityBucket; 3] = [
        VolatilityBucket::Low,
        VolatilityBucket::Medium,
        VolatilityBucket::High,
    ];
}

impl fmt::Display for VolatilityBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolatilityBucket::Low => write!(f, "LOW"),
            VolatilityBucket::Medium => write!(f, "MEDIUM"),
            VolatilityBucket::High => write!(f, "HIGH"),
        }
    }
}

/// Rule parameters for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketProfile {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// Mean reversion only fires at or below this ADX
    pub adx_max: f64,
    pub stop_atr_multiple: f64,
    pub target_atr_multiple: f64,
}

/// Bucket -> profile lookup table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileTable {
    pub low: BucketProfile,
    pub medium: BucketProfile,
    pub high: BucketProfile,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self {
            // Range-only: strict ADX ceiling, tight stop/target
            low: BucketProfile {
                rsi_oversold: 30.0,
                rsi_overbought: 70.0,
                adx_max: 20.0,
                stop_atr_multiple: 1.0,
                target_atr_multiple: 1.5,
            },
            medium: BucketProfile {
                rsi_oversold: 30.0,
                rsi_overbought: 70.0,
                adx_max: 25.0,
                stop_atr_multiple: 1.5,
                target_atr_multiple: 2.5,
            },
            // Trend-tolerant: looser ceiling, wider stop/target
            high: BucketProfile {
                rsi_oversold: 25.0,
                rsi_overbought: 75.0,
                adx_max: 30.0,
                stop_atr_multiple: 2.0,
                target_atr_multiple: 3.5,
            },
        }
    }
}

impl ProfileTable {
    pub fn get(&self, bucket: VolatilityBucket) -> &BucketProfile {
        match bucket {
            VolatilityBucket::Low => &self.low,
            VolatilityBucket::Medium => &self.medium,
            VolatilityBucket::High => &self.high,
        }
    }
}

/// How the volatility score is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    /// Mean of ATR / close over the last `window` candles
    AtrRatio,
    /// Standard deviation of close-to-close returns over `window` candles
    ReturnDispersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityConfig {
    /// Scores below this are LOW
    pub low_threshold: f64,
    /// Scores at or above this are HIGH
    pub high_threshold: f64,
    /// Number of recent candles averaged into the score
    pub window: usize,
    pub atr_period: usize,
    /// Cache lifetime of a classification
    pub refresh_secs: u64,
    pub method: ScoreMethod,
    pub profiles: ProfileTable,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.005,
            high_threshold: 0.015,
            window: 20,
            atr_period: 14,
            refresh_secs: 900,
            method: ScoreMethod::AtrRatio,
            profiles: ProfileTable::default(),
        }
    }
}

impl VolatilityConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.low_threshold >= 0.0 && self.low_threshold < self.high_threshold) {
            return Err(EngineError::Config(format!(
                "volatility thresholds must satisfy 0 <= low < high (got {} / {})",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.window == 0 || self.atr_period == 0 {
            return Err(EngineError::Config(
                "volatility window and atr_period must be positive".to_string(),
            ));
        }
        if self.refresh_secs > MAX_CONFIG_SECS {
            return Err(EngineError::Config(format!(
                "volatility refresh_secs must not exceed {MAX_CONFIG_SECS}"
            )));
        }
        for bucket in VolatilityBucket::ALL {
            let p = self.profiles.get(bucket);
            if p.rsi_oversold >= p.rsi_overbought {
                return Err(EngineError::Config(format!(
                    "{bucket} profile: rsi_oversold must be below rsi_overbought"
                )));
            }
            if p.stop_atr_multiple <= 0.0 || p.target_atr_multiple <= 0.0 {
                return Err(EngineError::Config(format!(
                    "{bucket} profile: ATR multiples must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Candles needed for a full-confidence score
    pub fn required_candles(&self) -> usize {
        match self.method {
            ScoreMethod::AtrRatio => self.atr_period + self.window,
            ScoreMethod::ReturnDispersion => self.window + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityClass {
    pub symbol: String,
    pub bucket: VolatilityBucket,
    pub score: f64,
    pub computed_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Set when history was too short to score; bucket falls back to MEDIUM
    pub low_confidence: bool,
}

impl VolatilityClass {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until
    }
}

/// Volatility classifier with a per-symbol TTL cache
pub struct VolatilityClassifier {
    config: VolatilityConfig,
    cache: RwLock<HashMap<String, VolatilityClass>>,
}

impl VolatilityClassifier {
    pub fn new(config: VolatilityConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &VolatilityConfig {
        &self.config
    }

    pub fn profile(&self, bucket: VolatilityBucket) -> &BucketProfile {
        self.config.profiles.get(bucket)
    }

    pub fn bucket_for(&self, score: f64) -> VolatilityBucket {
        if score < self.config.low_threshold {
            VolatilityBucket::Low
        } else if score >= self.config.high_threshold {
            VolatilityBucket::High
        } else {
            VolatilityBucket::Medium
        }
    }

    /// Cached class for `symbol`, valid or not
    pub fn cached(&self, symbol: &str) -> Option<VolatilityClass> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .cloned()
    }

    /// True when there is no cached class or it has passed `valid_until`
    pub fn needs_refresh(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.cached(symbol)
            .map(|c| !c.is_valid_at(now))
            .unwrap_or(true)
    }

    /// Return the cached class while valid, otherwise recompute from `candles`
    /// and cache the result.
    pub fn classify(&self, symbol: &str, candles: &[Candle], now: DateTime<Utc>) -> VolatilityClass {
        if let Some(cached) = self.cached(symbol) {
            if cached.is_valid_at(now) {
                return cached;
            }
        }

        let class = self.compute(symbol, candles, now);
        let previous = self
            .cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), class.clone());

        match previous {
            Some(prev) if prev.bucket != class.bucket => info!(
                symbol = %symbol,
                from = %prev.bucket,
                to = %class.bucket,
                score = class.score,
                "[VOL] Bucket changed"
            ),
            _ => debug!(
                symbol = %symbol,
                bucket = %class.bucket,
                score = class.score,
                low_confidence = class.low_confidence,
                "[VOL] Classified"
            ),
        }
        class
    }

    /// Uncached classification
    pub fn compute(&self, symbol: &str, candles: &[Candle], now: DateTime<Utc>) -> VolatilityClass {
        let valid_until = now + config_duration(self.config.refresh_secs);
        match self.score(candles) {
            Some(score) => VolatilityClass {
                symbol: symbol.to_string(),
                bucket: self.bucket_for(score),
                score,
                computed_at: now,
                valid_until,
                low_confidence: false,
            },
            None => VolatilityClass {
                symbol: symbol.to_string(),
                bucket: VolatilityBucket::Medium,
                score: 0.0,
                computed_at: now,
                valid_until,
                low_confidence: true,
            },
        }
    }

    /// Volatility score, `None` when history is too short
    pub fn score(&self, candles: &[Candle]) -> Option<f64> {
        if candles.len() < self.config.required_candles() {
            return None;
        }
        let window = self.config.window;

        match self.config.method {
            ScoreMethod::AtrRatio => {
                let atrs = atr_series(candles, self.config.atr_period);
                let start = candles.len() - window;
                let mut sum = 0.0;
                for i in start..candles.len() {
                    let atr = atrs[i]?;
                    let close = candles[i].close;
                    if close.abs() < EPSILON {
                        return None;
                    }
                    sum += atr / close;
                }
                Some((sum / window as f64).max(0.0))
            }
            ScoreMethod::ReturnDispersion => {
                let start = candles.len() - window;
                let mut returns = Vec::with_capacity(window);
                for i in start..candles.len() {
                    let prev = candles[i - 1].close;
                    if prev.abs() < EPSILON {
                        return None;
                    }
                    returns.push((candles[i].close - prev) / prev);
                }
                let mean = returns.iter().sum::<f64>() / returns.len() as f64;
                let variance =
                    returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
                Some(variance.sqrt())
            }
        }
    }
}

impl Default for VolatilityClassifier {
    fn default() -> Self {
        Self::new(VolatilityConfig::default())
    }
}
