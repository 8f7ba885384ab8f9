//! Indicator Engine - RSI, ADX and ATR from candle series
//!
//! Pure functions of the input window: the same candles always produce a
//! bit-identical snapshot. All three indicators use Wilder's smoothing:
//! - RSI: seeded with the simple average gain/loss of the first `period`
//!   changes, then smoothed over the rest of the window
//! - ATR: seeded with the mean of the first `period` true ranges
//! - ADX: Wilder-smoothed +DM/-DM/TR give +DI/-DI and DX; ADX is the
//!   Wilder-smoothed DX
//!
//! Insufficient history is reported as `EngineError::NotReady`, which callers
//! treat as "no signal" rather than a fault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{Candle, Timeframe, EPSILON};

/// Lookback periods for the indicator set
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub adx_period: usize,
    pub atr_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            adx_period: 14,
            atr_period: 14,
        }
    }
}

impl IndicatorConfig {
    /// Candles needed before every indicator in the snapshot is ready
    pub fn required_candles(&self) -> usize {
        (self.rsi_period + 1)
            .max(self.atr_period + 1)
            .max(self.adx_period * 2)
    }
}

/// Indicator values for one symbol/timeframe at the last candle of a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Close time of the last candle in the window
    pub computed_at: DateTime<Utc>,
    /// Latest close
    pub close: f64,
    /// RSI (0-100)
    pub rsi: f64,
    /// RSI one candle earlier, if the window is long enough
    pub rsi_prev: Option<f64>,
    /// ADX (0-100)
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    /// ATR in price units
    pub atr: f64,
}

/// Stateless indicator engine
#[derive(Debug, Clone, Default)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    /// Compute the snapshot for an ordered candle window.
    pub fn evaluate(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> EngineResult<IndicatorSnapshot> {
        let not_ready = |indicator: &'static str, required: usize| EngineError::NotReady {
            symbol: symbol.to_string(),
            timeframe,
            indicator,
            required,
            available: candles.len(),
        };

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let rsi = compute_rsi(&closes, self.config.rsi_period)
            .ok_or_else(|| not_ready("RSI", self.config.rsi_period + 1))?;
        let atr = compute_atr(candles, self.config.atr_period)
            .ok_or_else(|| not_ready("ATR", self.config.atr_period + 1))?;
        let adx = compute_adx(candles, self.config.adx_period)
            .ok_or_else(|| not_ready("ADX", self.config.adx_period * 2))?;

        let rsi_prev = compute_rsi(&closes[..closes.len() - 1], self.config.rsi_period);

        // compute_rsi succeeded, so the window is non-empty
        let last = &candles[candles.len() - 1];

        tracing::debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            rsi = rsi,
            adx = adx.adx,
            atr = atr,
            "[INDICATORS] Snapshot computed"
        );

        Ok(IndicatorSnapshot {
            symbol: symbol.to_string(),
            timeframe,
            computed_at: last.close_time(),
            close: last.close,
            rsi,
            rsi_prev,
            adx: adx.adx,
            plus_di: adx.plus_di,
            minus_di: adx.minus_di,
            atr,
        })
    }
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss < EPSILON {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - (100.0 / (1.0 + rs))).clamp(0.0, 100.0)
}

/// RSI with Wilder's smoothing over the whole series.
/// Returns `None` with fewer than `period + 1` closes.
pub fn compute_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            gains += change;
        } else {
            losses += change.abs();
        }
    }
    let p = period as f64;
    let mut avg_gain = gains / p;
    let mut avg_loss = losses / p;

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let gain = if change > 0.0 { change } else { 0.0 };
        let loss = if change < 0.0 { change.abs() } else { 0.0 };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    Some(rsi_from_averages(avg_gain, avg_loss))
}

/// Wilder ATR series aligned with `candles`: entry `i` is the ATR at candle
/// `i`, `None` until `period` true ranges are available.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; candles.len()];
    if period == 0 || candles.len() < period + 1 {
        return out;
    }

    let p = period as f64;
    let seed: f64 = (1..=period)
        .map(|i| candles[i].true_range(candles[i - 1].close))
        .sum::<f64>()
        / p;
    let mut atr = seed.max(0.0);
    out[period] = Some(atr);

    for i in (period + 1)..candles.len() {
        let tr = candles[i].true_range(candles[i - 1].close);
        atr = ((atr * (p - 1.0) + tr) / p).max(0.0);
        out[i] = Some(atr);
    }
    out
}

/// Latest Wilder ATR, `None` with fewer than `period + 1` candles
pub fn compute_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).last().copied().flatten()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxOutput {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// ADX with Wilder smoothing. Needs `2 * period` candles: `period` bars to
/// seed the directional sums, then `period` DX values to seed the ADX.
pub fn compute_adx(candles: &[Candle], period: usize) -> Option<AdxOutput> {
    if period == 0 || candles.len() < period * 2 {
        return None;
    }

    let mut plus_dm_values = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm_values = Vec::with_capacity(candles.len() - 1);
    let mut tr_values = Vec::with_capacity(candles.len() - 1);

    for i in 1..candles.len() {
        let curr = &candles[i];
        let prev = &candles[i - 1];

        let up_move = curr.high - prev.high;
        let down_move = prev.low - curr.low;

        let plus_dm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let minus_dm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        plus_dm_values.push(plus_dm);
        minus_dm_values.push(minus_dm);
        tr_values.push(curr.true_range(prev.close));
    }

    let p = period as f64;
    let mut smoothed_plus_dm: f64 = plus_dm_values.iter().take(period).sum();
    let mut smoothed_minus_dm: f64 = minus_dm_values.iter().take(period).sum();
    let mut smoothed_tr: f64 = tr_values.iter().take(period).sum();

    let directional = |plus: f64, minus: f64, tr: f64| -> (f64, f64, f64) {
        if tr < EPSILON {
            return (0.0, 0.0, 0.0);
        }
        let plus_di = (100.0 * plus / tr).clamp(0.0, 100.0);
        let minus_di = (100.0 * minus / tr).clamp(0.0, 100.0);
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > EPSILON {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };
        (dx, plus_di, minus_di)
    };

    let mut dx_values = Vec::with_capacity(tr_values.len() - period + 1);
    dx_values.push(directional(smoothed_plus_dm, smoothed_minus_dm, smoothed_tr));

    for i in period..tr_values.len() {
        smoothed_plus_dm = smoothed_plus_dm - (smoothed_plus_dm / p) + plus_dm_values[i];
        smoothed_minus_dm = smoothed_minus_dm - (smoothed_minus_dm / p) + minus_dm_values[i];
        smoothed_tr = smoothed_tr - (smoothed_tr / p) + tr_values[i];
        dx_values.push(directional(smoothed_plus_dm, smoothed_minus_dm, smoothed_tr));
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx = dx_values.iter().take(period).map(|(dx, _, _)| dx).sum::<f64>() / p;
    for (dx, _, _) in dx_values.iter().skip(period) {
        adx = (adx * (p - 1.0) + dx) / p;
    }

    let (_, plus_di, minus_di) = dx_values[dx_values.len() - 1];
    Some(AdxOutput {
        adx: adx.clamp(0.0, 100.0),
        plus_di,
        minus_di,
    })
}
