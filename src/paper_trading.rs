//! Paper Trading Engine
//!
//! Opens simulated positions from executed signals and closes them against
//! observed price ranges.
//!
//! Key features:
//! - **Exactly-once closure**: every close goes through the trade store's
//!   atomic close-if-open, so a trade hit by two monitor passes (or a monitor
//!   pass racing a manual close) settles once
//! - **Idealized fills**: stop and target exits fill at the level itself
//! - **Gap-aware tie-break**: when one bar spans both levels, an open already
//!   beyond a level decides; otherwise the configured policy does
//! - **Pluggable sizing and fees**: fixed notional or fixed-fractional risk,
//!   no fees or a flat basis-point fee per side

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::SignalLifecycleManager;
use crate::persistence::{CloseOutcome, TradeStore};
use crate::types::{
    CloseReason, Direction, PaperTrade, PriceBar, Signal, SignalState, TradeStatus,
};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// How much notional to commit per trade
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SizingPolicy {
    /// Same notional for every trade
    FixedNotional { notional: f64 },
    /// Risk `risk_fraction` of `equity` between entry and stop, capped
    FixedFractional {
        equity: f64,
        risk_fraction: f64,
        max_notional: f64,
    },
}

impl Default for SizingPolicy {
    fn default() -> Self {
        SizingPolicy::FixedNotional { notional: 1000.0 }
    }
}

impl SizingPolicy {
    /// Notional for an entry/stop pair; 0 when the setup cannot be sized
    pub fn position_size(&self, entry: f64, stop: f64) -> f64 {
        match *self {
            SizingPolicy::FixedNotional { notional } => notional.max(0.0),
            SizingPolicy::FixedFractional {
                equity,
                risk_fraction,
                max_notional,
            } => {
                if entry <= 0.0 {
                    return 0.0;
                }
                let stop_distance_pct = (entry - stop).abs() / entry;
                if stop_distance_pct <= 0.0 {
                    return 0.0;
                }
                let risk_amount = equity * risk_fraction;
                (risk_amount / stop_distance_pct).clamp(0.0, max_notional)
            }
        }
    }
}

/// Which level wins when one bar touches both stop and target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    AdverseFirst,
    FavorableFirst,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaperTradingConfig {
    pub sizing: SizingPolicy,
    /// Fee per side in basis points (0 = no fees)
    pub fee_bps: f64,
    pub tie_break: TieBreak,
    /// JSON snapshot of signals and trades for restart recovery
    pub state_file: Option<String>,
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        Self {
            sizing: SizingPolicy::default(),
            fee_bps: 0.0,
            tie_break: TieBreak::AdverseFirst,
            state_file: Some("./data/paper_state.json".to_string()),
        }
    }
}

impl PaperTradingConfig {
    pub fn fee_model(&self) -> Arc<dyn FeeModel> {
        if self.fee_bps > 0.0 {
            Arc::new(BpsFee { bps: self.fee_bps })
        } else {
            Arc::new(NoFees)
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Fees
// ─────────────────────────────────────────────────────────────────

pub trait FeeModel: Send + Sync {
    /// Fee charged on one side of a trade with the given notional
    fn fee(&self, notional: f64) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFees;

impl FeeModel for NoFees {
    fn fee(&self, _notional: f64) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BpsFee {
    pub bps: f64,
}

impl FeeModel for BpsFee {
    fn fee(&self, notional: f64) -> f64 {
        notional.abs() * self.bps / 10_000.0
    }
}

// ─────────────────────────────────────────────────────────────────
// Exit evaluation
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitFill {
    pub reason: CloseReason,
    pub price: f64,
}

impl ExitFill {
    fn stop(trade: &PaperTrade) -> Self {
        Self {
            reason: CloseReason::StopLoss,
            price: trade.stop_loss,
        }
    }

    fn target(trade: &PaperTrade) -> Self {
        Self {
            reason: CloseReason::TakeProfit,
            price: trade.take_profit,
        }
    }
}

/// Decide whether `bar` closes `trade`, and at which level
pub fn evaluate_exit(trade: &PaperTrade, bar: &PriceBar, tie_break: TieBreak) -> Option<ExitFill> {
    let (stop_hit, target_hit, open_past_stop, open_past_target) = match trade.direction {
        Direction::Long => (
            bar.low <= trade.stop_loss,
            bar.high >= trade.take_profit,
            bar.open <= trade.stop_loss,
            bar.open >= trade.take_profit,
        ),
        Direction::Short => (
            bar.high >= trade.stop_loss,
            bar.low <= trade.take_profit,
            bar.open >= trade.stop_loss,
            bar.open <= trade.take_profit,
        ),
    };

    match (stop_hit, target_hit) {
        (false, false) => None,
        (true, false) => Some(ExitFill::stop(trade)),
        (false, true) => Some(ExitFill::target(trade)),
        (true, true) if open_past_stop => Some(ExitFill::stop(trade)),
        (true, true) if open_past_target => Some(ExitFill::target(trade)),
        (true, true) => match tie_break {
            TieBreak::AdverseFirst => Some(ExitFill::stop(trade)),
            TieBreak::FavorableFirst => Some(ExitFill::target(trade)),
        },
    }
}

/// Mark-to-market PnL before fees
pub fn gross_pnl(trade: &PaperTrade, price: f64) -> f64 {
    (price - trade.entry_price) * trade.quantity * trade.direction.sign()
}

// ─────────────────────────────────────────────────────────────────
// Paper Trading Engine
// ─────────────────────────────────────────────────────────────────

pub struct PaperTradingEngine {
    config: PaperTradingConfig,
    fees: Arc<dyn FeeModel>,
    store: Arc<dyn TradeStore>,
}

impl PaperTradingEngine {
    pub fn new(config: PaperTradingConfig, store: Arc<dyn TradeStore>) -> Self {
        let fees = config.fee_model();
        Self {
            config,
            fees,
            store,
        }
    }

    /// Override the fee model derived from `fee_bps`
    pub fn with_fee_model(mut self, fees: Arc<dyn FeeModel>) -> Self {
        self.fees = fees;
        self
    }

    pub fn config(&self) -> &PaperTradingConfig {
        &self.config
    }

    pub fn get_trade(&self, id: &Uuid) -> Option<PaperTrade> {
        self.store.get_trade(id)
    }

    pub fn open_trades(&self) -> Vec<PaperTrade> {
        self.store.open_trades()
    }

    pub fn trades(&self) -> Vec<PaperTrade> {
        self.store.trades()
    }

    /// Open a position at the signal's entry price.
    ///
    /// Only EXECUTED signals are accepted: the lifecycle's ACTIVE→EXECUTED
    /// transition is the gate, and the store refuses a second trade per
    /// signal. The trade copies everything it needs from the signal; the
    /// signal id is kept only as an advisory back-reference.
    pub fn open(&self, signal: &Signal, now: DateTime<Utc>) -> EngineResult<PaperTrade> {
        if signal.state != SignalState::Executed {
            return Err(EngineError::InvalidTransition {
                from: signal.state.to_string(),
                to: TradeStatus::Open.to_string(),
                reason: format!("signal {} cannot be traded", signal.id),
            });
        }
        SignalLifecycleManager::validate_setup(signal)?;

        let position_size = self
            .config
            .sizing
            .position_size(signal.entry_price, signal.stop_loss);
        if position_size <= 0.0 {
            return Err(EngineError::InvalidSetup {
                symbol: signal.symbol.clone(),
                direction: signal.direction,
                reason: format!("sizing produced notional {position_size:.4}"),
            });
        }

        let trade = PaperTrade {
            id: Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            entry_price: signal.entry_price,
            position_size,
            quantity: position_size / signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            status: TradeStatus::Open,
            close_reason: None,
            bucket: signal.bucket,
            opened_at: now,
            closed_at: None,
            exit_price: None,
            realized_pnl: 0.0,
            fees_paid: self.fees.fee(position_size),
            originating_signal_ref: Some(signal.id),
        };
        self.store.insert_trade(trade.clone())?;

        info!(
            trade_id = %trade.id,
            signal_id = %signal.id,
            symbol = %trade.symbol,
            direction = %trade.direction,
            bucket = %trade.bucket,
            entry = %format!("${:.4}", trade.entry_price),
            stop = %format!("${:.4}", trade.stop_loss),
            target = %format!("${:.4}", trade.take_profit),
            size = %format!("${:.2}", trade.position_size),
            "📝 [PAPER] Position opened"
        );
        Ok(trade)
    }

    fn settle(
        &self,
        trade: &mut PaperTrade,
        exit_price: f64,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) {
        let exit_fee = self.fees.fee(trade.quantity * exit_price);
        trade.fees_paid += exit_fee;
        trade.realized_pnl = gross_pnl(trade, exit_price) - trade.fees_paid;
        trade.exit_price = Some(exit_price);
        trade.closed_at = Some(closed_at);
        trade.close_reason = Some(reason);
        trade.status = match reason {
            CloseReason::Manual => TradeStatus::ClosedManual,
            CloseReason::Cancelled => TradeStatus::Cancelled,
            CloseReason::StopLoss | CloseReason::TakeProfit => {
                if trade.realized_pnl > 0.0 {
                    TradeStatus::ClosedWin
                } else {
                    TradeStatus::ClosedLoss
                }
            }
        };
    }

    fn log_close(trade: &PaperTrade) {
        let emoji = if trade.realized_pnl > 0.0 { "✅" } else { "❌" };
        info!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            direction = %trade.direction,
            entry_price = %format!("${:.4}", trade.entry_price),
            exit_price = %format!("${:.4}", trade.exit_price.unwrap_or(trade.entry_price)),
            pnl = %format!("${:+.2}", trade.realized_pnl),
            fees = %format!("${:.4}", trade.fees_paid),
            status = %trade.status,
            reason = ?trade.close_reason,
            "[PAPER] {} {} | PnL ${:+.2}",
            emoji,
            trade.status,
            trade.realized_pnl
        );
    }

    /// Check open trades against the latest price range per symbol.
    ///
    /// Returns only trades this call closed. Bars observed at or before a
    /// trade's open are ignored; stale copies of already-closed trades are
    /// no-ops.
    pub fn monitor(
        &self,
        open_trades: &[PaperTrade],
        latest: &HashMap<String, PriceBar>,
    ) -> Vec<PaperTrade> {
        let mut closed = Vec::new();

        for trade in open_trades.iter().filter(|t| t.status.is_open()) {
            let Some(bar) = latest.get(&trade.symbol) else {
                debug!(symbol = %trade.symbol, "[PAPER] No price for open trade");
                continue;
            };
            if bar.as_of <= trade.opened_at {
                continue;
            }
            let Some(fill) = evaluate_exit(trade, bar, self.config.tie_break) else {
                continue;
            };

            let outcome = self.store.close_if_open(&trade.id, &|t| {
                self.settle(t, fill.price, fill.reason, bar.as_of);
            });
            match outcome {
                CloseOutcome::Closed(done) => {
                    Self::log_close(&done);
                    closed.push(done);
                }
                CloseOutcome::AlreadyClosed(_) => {
                    debug!(trade_id = %trade.id, "[PAPER] Trade already closed");
                }
                CloseOutcome::NotFound => {
                    warn!(trade_id = %trade.id, "[PAPER] Monitored trade missing from store");
                }
            }
        }

        closed
    }

    /// Close an open trade at `price`.
    ///
    /// A non-finite or non-positive price on an existing trade is an
    /// `InvalidSetup` error; the trade is left untouched.
    pub fn close_manual(
        &self,
        id: &Uuid,
        price: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<CloseOutcome> {
        if !price.is_finite() || price <= 0.0 {
            let Some(trade) = self.store.get_trade(id) else {
                return Ok(CloseOutcome::NotFound);
            };
            warn!(trade_id = %id, price, "[PAPER] Rejecting manual close with invalid price");
            return Err(EngineError::InvalidSetup {
                symbol: trade.symbol,
                direction: trade.direction,
                reason: format!("invalid exit price {price}"),
            });
        }
        let outcome = self
            .store
            .close_if_open(id, &|t| self.settle(t, price, CloseReason::Manual, now));
        if let CloseOutcome::Closed(ref done) = outcome {
            Self::log_close(done);
        }
        Ok(outcome)
    }

    /// Cancel an open trade: no fill, no PnL, no fees
    pub fn cancel(&self, id: &Uuid, now: DateTime<Utc>) -> CloseOutcome {
        let outcome = self.store.close_if_open(id, &|t| {
            t.status = TradeStatus::Cancelled;
            t.close_reason = Some(CloseReason::Cancelled);
            t.exit_price = Some(t.entry_price);
            t.closed_at = Some(now);
            t.realized_pnl = 0.0;
            t.fees_paid = 0.0;
        });
        if let CloseOutcome::Closed(ref done) = outcome {
            info!(trade_id = %done.id, symbol = %done.symbol, "🚫 [PAPER] Trade cancelled");
        }
        outcome
    }
}
