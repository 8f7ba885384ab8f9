//! Signal Engine - volatility-adjusted mean reversion
//!
//! Consumes indicator snapshots for every configured timeframe plus the
//! symbol's volatility class and proposes at most one PENDING signal:
//! - LONG when RSI crosses into the bucket's oversold band
//! - SHORT when RSI crosses into the bucket's overbought band
//! - only while ADX sits at or below the bucket's ceiling (ranging market)
//!
//! Stop and target are ATR multiples from the bucket profile. Admission,
//! sanity checks and deduplication belong to the lifecycle manager.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::indicators::IndicatorSnapshot;
use crate::types::{
    config_duration, Direction, Signal, SignalState, Timeframe, TradingType, EPSILON,
};
use crate::volatility::{BucketProfile, ProfileTable, VolatilityClass};

/// How long a signal stays live, per trading type
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalValidity {
    pub scalp_secs: u64,
    pub day_secs: u64,
    pub swing_secs: u64,
}

impl Default for SignalValidity {
    fn default() -> Self {
        Self {
            scalp_secs: 2 * 60 * 60,
            day_secs: 24 * 60 * 60,
            swing_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl SignalValidity {
    pub fn for_type(&self, trading_type: TradingType) -> Duration {
        let secs = match trading_type {
            TradingType::Scalp => self.scalp_secs,
            TradingType::Day => self.day_secs,
            TradingType::Swing => self.swing_secs,
        };
        config_duration(secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Timeframes that must all be ready before a signal is considered
    pub timeframes: Vec<Timeframe>,
    /// Require RSI to cross into the band on the latest candle
    pub require_cross: bool,
    /// Weight of RSI extremity vs ADX quietness in the base confidence
    pub rsi_weight: f64,
    /// Confidence added per other timeframe leaning the same way
    pub multi_tf_bonus: f64,
    /// Minimum confidence to emit a signal
    pub min_confidence: f64,
    /// Longest timeframe labelled SCALP
    pub scalp_max_timeframe: Timeframe,
    /// Longest timeframe labelled DAY
    pub day_max_timeframe: Timeframe,
    /// Target distance (fraction of entry) above which the label moves one horizon up
    pub promote_target_pct: f64,
    pub validity: SignalValidity,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::Min15, Timeframe::Hour1],
            require_cross: true,
            rsi_weight: 0.6,
            multi_tf_bonus: 0.06,
            min_confidence: 0.0,
            scalp_max_timeframe: Timeframe::Min15,
            day_max_timeframe: Timeframe::Hour4,
            promote_target_pct: 0.03,
            validity: SignalValidity::default(),
        }
    }
}

/// Mean-reversion signal engine
pub struct SignalEngine {
    config: StrategyConfig,
    profiles: ProfileTable,
}

impl SignalEngine {
    pub fn new(config: StrategyConfig, profiles: ProfileTable) -> Self {
        Self { config, profiles }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Evaluate one symbol. Returns a PENDING signal or `None`.
    ///
    /// Any configured timeframe missing from `snapshots` (not ready or no
    /// data) suppresses the symbol for this tick.
    pub fn evaluate(
        &self,
        symbol: &str,
        snapshots: &BTreeMap<Timeframe, IndicatorSnapshot>,
        volatility: &VolatilityClass,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        if let Some(missing) = self
            .config
            .timeframes
            .iter()
            .find(|tf| !snapshots.contains_key(tf))
        {
            debug!(symbol = %symbol, timeframe = %missing, "[SIGNAL] Timeframe not ready, skipping");
            return None;
        }

        let profile = self.profiles.get(volatility.bucket);

        let mut ordered: Vec<Timeframe> = self.config.timeframes.clone();
        ordered.sort();
        ordered.dedup();

        // Shortest timeframe that fires is the trigger
        let (trigger_tf, direction) = ordered.iter().find_map(|tf| {
            let snap = snapshots.get(tf)?;
            self.trigger(snap, profile).map(|dir| (*tf, dir))
        })?;
        let trigger = snapshots.get(&trigger_tf)?;

        let entry = trigger.close;
        let sign = direction.sign();
        let stop_loss = entry - sign * trigger.atr * profile.stop_atr_multiple;
        let take_profit = entry + sign * trigger.atr * profile.target_atr_multiple;

        let mut reasons = vec![
            format!(
                "rsi_{}={:.1} ({})",
                if direction == Direction::Long { "oversold" } else { "overbought" },
                trigger.rsi,
                trigger_tf
            ),
            format!("adx={:.1}<={:.1}", trigger.adx, profile.adx_max),
            format!("bucket={}", volatility.bucket),
        ];

        let mut confidence = self.base_confidence(trigger, profile);
        for tf in ordered.iter().filter(|tf| **tf != trigger_tf) {
            if let Some(other) = snapshots.get(tf) {
                let aligned = match direction {
                    Direction::Long => other.rsi < 50.0,
                    Direction::Short => other.rsi > 50.0,
                };
                if aligned {
                    confidence += self.config.multi_tf_bonus;
                    reasons.push(format!("{}_aligned", tf));
                }
            }
        }
        let confidence = confidence.clamp(0.0, 1.0);

        if confidence < self.config.min_confidence {
            debug!(
                symbol = %symbol,
                direction = %direction,
                confidence = confidence,
                min_confidence = self.config.min_confidence,
                "[SIGNAL] Below minimum confidence"
            );
            return None;
        }

        let trading_type = self.trading_type(trigger_tf, entry, take_profit);
        let expires_at = now + self.config.validity.for_type(trading_type);

        debug!(
            symbol = %symbol,
            direction = %direction,
            timeframe = %trigger_tf,
            entry = entry,
            stop_loss = stop_loss,
            take_profit = take_profit,
            confidence = confidence,
            "[SIGNAL] Candidate generated"
        );

        Some(Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timeframe: trigger_tf,
            direction,
            entry_price: entry,
            stop_loss,
            take_profit,
            atr: trigger.atr,
            confidence,
            trading_type,
            bucket: volatility.bucket,
            state: SignalState::Pending,
            created_at: now,
            expires_at,
            updated_at: now,
            position_closed_at: None,
            reasons,
        })
    }

    /// Direction the snapshot fires in under `profile`, if any
    pub fn trigger(&self, snap: &IndicatorSnapshot, profile: &BucketProfile) -> Option<Direction> {
        if snap.adx > profile.adx_max + EPSILON {
            return None;
        }

        let crossed_below = |band: f64| -> bool {
            if !self.config.require_cross {
                return true;
            }
            snap.rsi_prev.map(|prev| prev > band).unwrap_or(false)
        };
        let crossed_above = |band: f64| -> bool {
            if !self.config.require_cross {
                return true;
            }
            snap.rsi_prev.map(|prev| prev < band).unwrap_or(false)
        };

        if snap.rsi <= profile.rsi_oversold && crossed_below(profile.rsi_oversold) {
            Some(Direction::Long)
        } else if snap.rsi >= profile.rsi_overbought && crossed_above(profile.rsi_overbought) {
            Some(Direction::Short)
        } else {
            None
        }
    }

    /// RSI distance from the midline blended with how far ADX sits below
    /// the ceiling. Deterministic, in [0, 1].
    pub fn base_confidence(&self, snap: &IndicatorSnapshot, profile: &BucketProfile) -> f64 {
        let extremity = ((snap.rsi - 50.0).abs() / 50.0).clamp(0.0, 1.0);
        let quietness = if profile.adx_max > EPSILON {
            (1.0 - snap.adx / profile.adx_max).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let w = self.config.rsi_weight.clamp(0.0, 1.0);
        (w * extremity + (1.0 - w) * quietness).clamp(0.0, 1.0)
    }

    /// Descriptive horizon label from the trigger timeframe and target distance
    pub fn trading_type(&self, timeframe: Timeframe, entry: f64, take_profit: f64) -> TradingType {
        let base = if timeframe <= self.config.scalp_max_timeframe {
            TradingType::Scalp
        } else if timeframe <= self.config.day_max_timeframe {
            TradingType::Day
        } else {
            TradingType::Swing
        };
        let target_pct = if entry.abs() > EPSILON {
            (take_profit - entry).abs() / entry.abs()
        } else {
            0.0
        };
        if target_pct > self.config.promote_target_pct {
            base.promote()
        } else {
            base
        }
    }
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new(StrategyConfig::default(), ProfileTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volatility::VolatilityBucket;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000, 0).unwrap()
    }

    fn snap(tf: Timeframe, rsi: f64, rsi_prev: f64, adx: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            symbol: "ETHUSDT".to_string(),
            timeframe: tf,
            computed_at: now(),
            close: 100.0,
            rsi,
            rsi_prev: Some(rsi_prev),
            adx,
            plus_di: 20.0,
            minus_di: 20.0,
            atr: 1.0,
        }
    }

    fn class(bucket: VolatilityBucket) -> VolatilityClass {
        VolatilityClass {
            symbol: "ETHUSDT".to_string(),
            bucket,
            score: 0.01,
            computed_at: now(),
            valid_until: now() + Duration::minutes(15),
            low_confidence: false,
        }
    }

    fn snapshots(items: Vec<IndicatorSnapshot>) -> BTreeMap<Timeframe, IndicatorSnapshot> {
        items.into_iter().map(|s| (s.timeframe, s)).collect()
    }

    #[test]
    fn oversold_cross_in_ranging_market_goes_long() {
        let engine = SignalEngine::default();
        let snaps = snapshots(vec![
            snap(Timeframe::Min15, 28.0, 33.0, 15.0),
            snap(Timeframe::Hour1, 45.0, 46.0, 18.0),
        ]);
        let signal = engine
            .evaluate("ETHUSDT", &snaps, &class(VolatilityBucket::Medium), now())
            .unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.state, SignalState::Pending);
        assert_eq!(signal.timeframe, Timeframe::Min15);
        // MEDIUM: stop 1.5 ATR, target 2.5 ATR
        assert!((signal.stop_loss - 98.5).abs() < 1e-9);
        assert!((signal.take_profit - 102.5).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&signal.confidence));
    }

    #[test]
    fn overbought_cross_goes_short() {
        let engine = SignalEngine::default();
        let snaps = snapshots(vec![
            snap(Timeframe::Min15, 72.0, 68.0, 10.0),
            snap(Timeframe::Hour1, 60.0, 58.0, 12.0),
        ]);
        let signal = engine
            .evaluate("ETHUSDT", &snaps, &class(VolatilityBucket::Medium), now())
            .unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.stop_loss > signal.entry_price);
        assert!(signal.take_profit < signal.entry_price);
    }

    #[test]
    fn trending_market_is_filtered_by_adx_ceiling() {
        let engine = SignalEngine::default();
        let snaps = snapshots(vec![
            snap(Timeframe::Min15, 28.0, 33.0, 40.0),
            snap(Timeframe::Hour1, 45.0, 46.0, 40.0),
        ]);
        assert!(engine
            .evaluate("ETHUSDT", &snaps, &class(VolatilityBucket::Medium), now())
            .is_none());
    }

    #[test]
    fn staying_in_band_without_cross_does_not_fire() {
        let engine = SignalEngine::default();
        let snaps = snapshots(vec![
            snap(Timeframe::Min15, 25.0, 27.0, 15.0),
            snap(Timeframe::Hour1, 45.0, 46.0, 18.0),
        ]);
        assert!(engine
            .evaluate("ETHUSDT", &snaps, &class(VolatilityBucket::Medium), now())
            .is_none());
    }

    #[test]
    fn missing_timeframe_suppresses_signal() {
        let engine = SignalEngine::default();
        let snaps = snapshots(vec![snap(Timeframe::Min15, 28.0, 33.0, 15.0)]);
        assert!(engine
            .evaluate("ETHUSDT", &snaps, &class(VolatilityBucket::Medium), now())
            .is_none());
    }

    #[test]
    fn high_bucket_widens_stop() {
        let engine = SignalEngine::default();
        let snaps = snapshots(vec![
            snap(Timeframe::Min15, 24.0, 35.0, 15.0),
            snap(Timeframe::Hour1, 45.0, 46.0, 18.0),
        ]);
        let low = engine
            .evaluate("ETHUSDT", &snaps, &class(VolatilityBucket::Low), now())
            .unwrap();
        let high = engine
            .evaluate("ETHUSDT", &snaps, &class(VolatilityBucket::High), now())
            .unwrap();
        assert!((low.entry_price - low.stop_loss) < (high.entry_price - high.stop_loss));
        assert_ne!(low.stop_loss, high.stop_loss);
    }

    #[test]
    fn confidence_rewards_lower_adx_and_alignment() {
        let engine = SignalEngine::default();
        let profile = ProfileTable::default().medium;
        let quiet = snap(Timeframe::Min15, 28.0, 33.0, 5.0);
        let noisy = snap(Timeframe::Min15, 28.0, 33.0, 24.0);
        assert!(engine.base_confidence(&quiet, &profile) > engine.base_confidence(&noisy, &profile));

        let aligned = snapshots(vec![
            snap(Timeframe::Min15, 28.0, 33.0, 15.0),
            snap(Timeframe::Hour1, 40.0, 41.0, 18.0),
        ]);
        let opposed = snapshots(vec![
            snap(Timeframe::Min15, 28.0, 33.0, 15.0),
            snap(Timeframe::Hour1, 60.0, 61.0, 18.0),
        ]);
        let c = class(VolatilityBucket::Medium);
        let a = engine.evaluate("ETHUSDT", &aligned, &c, now()).unwrap();
        let o = engine.evaluate("ETHUSDT", &opposed, &c, now()).unwrap();
        assert!(a.confidence > o.confidence);
    }

    #[test]
    fn trading_type_follows_timeframe_and_target() {
        let engine = SignalEngine::default();
        assert_eq!(engine.trading_type(Timeframe::Min5, 100.0, 101.0), TradingType::Scalp);
        assert_eq!(engine.trading_type(Timeframe::Hour1, 100.0, 101.0), TradingType::Day);
        assert_eq!(engine.trading_type(Timeframe::Day1, 100.0, 101.0), TradingType::Swing);
        // Wide target promotes one horizon
        assert_eq!(engine.trading_type(Timeframe::Min15, 100.0, 105.0), TradingType::Day);
    }
}
