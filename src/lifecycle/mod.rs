//! Signal Lifecycle Manager
//!
//! Owns every signal state transition after generation:
//!
//! ```text
//! PENDING ──admit──▶ ACTIVE ──execute──▶ EXECUTED ──position closed──▶ (terminal)
//!                      │                     │
//!                      ├──price vs setup──▶ INVALIDATED
//!                      └──expires_at──────▶ EXPIRED ◀── (position still open)
//! ```
//!
//! Admission is an atomic create-if-absent on (symbol, direction): two
//! concurrent candidates for the same key yield one ACTIVE signal and one
//! duplicate, never two. Retention purges terminal signals only; trades that
//! reference a purged signal are left untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::persistence::SignalStore;
use crate::types::{config_duration, Direction, PaperTrade, PriceBar, Signal, SignalState, EPSILON};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// Time past `expires_at` before a terminal signal is purged
    pub retention_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retention_grace_secs: 24 * 60 * 60,
        }
    }
}

/// Outcome of offering a candidate signal
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Stored as ACTIVE
    Admitted(Signal),
    /// A non-terminal signal already holds the key; candidate discarded
    Duplicate { symbol: String, direction: Direction },
    /// Failed sanity checks; candidate discarded
    Rejected(String),
}

/// Transitions applied by one refresh pass
#[derive(Debug, Clone, Default)]
pub struct LifecycleReport {
    pub invalidated: Vec<Uuid>,
    pub expired: Vec<Uuid>,
}

pub struct SignalLifecycleManager {
    config: LifecycleConfig,
    store: Arc<dyn SignalStore>,
}

impl SignalLifecycleManager {
    pub fn new(config: LifecycleConfig, store: Arc<dyn SignalStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn get(&self, id: &Uuid) -> Option<Signal> {
        self.store.get_signal(id)
    }

    /// Resolve a trade's back-reference. A purged signal reads as absent;
    /// the trade itself is never touched.
    pub fn origin_of(&self, trade: &PaperTrade) -> Option<Signal> {
        trade
            .originating_signal_ref
            .and_then(|id| self.store.get_signal(&id))
    }

    /// Non-terminal signals
    pub fn live_signals(&self) -> Vec<Signal> {
        self.store
            .signals()
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect()
    }

    pub fn signals_in_state(&self, state: SignalState) -> Vec<Signal> {
        self.store
            .signals()
            .into_iter()
            .filter(|s| s.state == state)
            .collect()
    }

    /// Stop and target must sit on opposite sides of entry, each on the
    /// correct side for the direction.
    pub fn validate_setup(signal: &Signal) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidSetup {
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            reason,
        };

        let values = [signal.entry_price, signal.stop_loss, signal.take_profit];
        if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(invalid(format!("non-positive or non-finite price in {values:?}")));
        }
        if (signal.stop_loss - signal.entry_price).abs() < EPSILON {
            return Err(invalid("stop equals entry".to_string()));
        }

        let sign = signal.direction.sign();
        if (signal.entry_price - signal.stop_loss) * sign <= 0.0 {
            return Err(invalid(format!(
                "stop {:.4} on the wrong side of entry {:.4}",
                signal.stop_loss, signal.entry_price
            )));
        }
        if (signal.take_profit - signal.entry_price) * sign <= 0.0 {
            return Err(invalid(format!(
                "target {:.4} not in the profitable direction from entry {:.4}",
                signal.take_profit, signal.entry_price
            )));
        }
        Ok(())
    }

    /// PENDING → ACTIVE, or discard
    pub fn admit(&self, candidate: Signal, now: DateTime<Utc>) -> Admission {
        if candidate.state != SignalState::Pending {
            return Admission::Rejected(format!("candidate in state {}", candidate.state));
        }
        if let Err(e) = Self::validate_setup(&candidate) {
            warn!(
                symbol = %candidate.symbol,
                direction = %candidate.direction,
                error = %e,
                "[LIFECYCLE] Rejected candidate"
            );
            return Admission::Rejected(e.to_string());
        }
        if candidate.expires_at <= now {
            return Admission::Rejected("already expired".to_string());
        }

        let mut signal = candidate;
        signal.state = SignalState::Active;
        signal.updated_at = now;

        match self.store.insert_signal_if_absent(signal) {
            Ok(admitted) => {
                info!(
                    signal_id = %admitted.id,
                    symbol = %admitted.symbol,
                    direction = %admitted.direction,
                    timeframe = %admitted.timeframe,
                    bucket = %admitted.bucket,
                    entry = %format!("{:.4}", admitted.entry_price),
                    stop = %format!("{:.4}", admitted.stop_loss),
                    target = %format!("{:.4}", admitted.take_profit),
                    confidence = %format!("{:.2}", admitted.confidence),
                    "[LIFECYCLE] Signal ACTIVE"
                );
                Admission::Admitted(admitted)
            }
            Err(EngineError::DuplicateAdmission { symbol, direction }) => {
                debug!(%symbol, %direction, "[LIFECYCLE] Duplicate candidate discarded");
                Admission::Duplicate { symbol, direction }
            }
            Err(e) => Admission::Rejected(e.to_string()),
        }
    }

    /// ACTIVE → EXECUTED. Fails if another caller got there first or the
    /// signal moved on.
    pub fn mark_executed(&self, id: &Uuid, now: DateTime<Utc>) -> EngineResult<Signal> {
        let signal = self
            .store
            .update_signal_if(id, &[SignalState::Active], &|s| {
                s.state = SignalState::Executed;
                s.updated_at = now;
            })?;
        info!(signal_id = %id, symbol = %signal.symbol, "[LIFECYCLE] Signal EXECUTED");
        Ok(signal)
    }

    /// EXECUTED → INVALIDATED when no position could be opened for the
    /// signal, releasing its dedup key.
    pub fn abandon_execution(
        &self,
        id: &Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Signal> {
        let signal = self
            .store
            .update_signal_if(id, &[SignalState::Executed], &|s| {
                s.state = SignalState::Invalidated;
                s.updated_at = now;
                s.reasons.push(format!("execution failed: {reason}"));
            })?;
        warn!(signal_id = %id, reason, "[LIFECYCLE] Signal INVALIDATED after failed execution");
        Ok(signal)
    }

    /// Record that the position opened from `id` has closed. The reference is
    /// advisory: a purged or already-expired signal is simply skipped.
    pub fn mark_position_closed(&self, id: &Uuid, now: DateTime<Utc>) -> Option<Signal> {
        match self
            .store
            .update_signal_if(id, &[SignalState::Executed], &|s| {
                s.position_closed_at = Some(now);
                s.updated_at = now;
            }) {
            Ok(signal) => {
                debug!(signal_id = %id, "[LIFECYCLE] Position closed, signal terminal");
                Some(signal)
            }
            Err(e) => {
                debug!(signal_id = %id, reason = %e, "[LIFECYCLE] Position close not recorded on signal");
                None
            }
        }
    }

    /// Whether the latest price range contradicts an unexecuted setup:
    /// price traded through the stop, or reached the target before entry.
    pub fn invalidation_reason(signal: &Signal, bar: &PriceBar) -> Option<&'static str> {
        match signal.direction {
            Direction::Long if bar.low <= signal.stop_loss => Some("price through stop"),
            Direction::Long if bar.high >= signal.take_profit => Some("target reached before entry"),
            Direction::Short if bar.high >= signal.stop_loss => Some("price through stop"),
            Direction::Short if bar.low <= signal.take_profit => Some("target reached before entry"),
            _ => None,
        }
    }

    /// Apply expiry and invalidation to every live signal.
    ///
    /// Only bars observed after the signal was admitted can invalidate it.
    pub fn refresh(
        &self,
        latest: &HashMap<String, PriceBar>,
        now: DateTime<Utc>,
    ) -> LifecycleReport {
        let mut report = LifecycleReport::default();

        for signal in self.live_signals() {
            let expiring = now >= signal.expires_at
                && matches!(signal.state, SignalState::Active | SignalState::Executed);
            if expiring {
                let from = signal.state;
                let result = self.store.update_signal_if(&signal.id, &[from], &|s| {
                    s.state = SignalState::Expired;
                    s.updated_at = now;
                });
                if result.is_ok() {
                    info!(
                        signal_id = %signal.id,
                        symbol = %signal.symbol,
                        from = %from,
                        "[LIFECYCLE] Signal EXPIRED"
                    );
                    report.expired.push(signal.id);
                }
                continue;
            }

            if signal.state != SignalState::Active {
                continue;
            }
            let Some(bar) = latest.get(&signal.symbol) else {
                continue;
            };
            if bar.as_of <= signal.updated_at {
                continue;
            }
            if let Some(reason) = Self::invalidation_reason(&signal, bar) {
                let result = self
                    .store
                    .update_signal_if(&signal.id, &[SignalState::Active], &|s| {
                        s.state = SignalState::Invalidated;
                        s.updated_at = now;
                        s.reasons.push(reason.to_string());
                    });
                if result.is_ok() {
                    info!(
                        signal_id = %signal.id,
                        symbol = %signal.symbol,
                        reason,
                        "[LIFECYCLE] Signal INVALIDATED"
                    );
                    report.invalidated.push(signal.id);
                }
            }
        }

        report
    }

    /// Delete terminal signals whose `expires_at` is more than the grace
    /// window in the past. Returns the purged ids.
    pub fn purge(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let grace = config_duration(self.config.retention_grace_secs);
        let removed = self
            .store
            .remove_signals_where(&|s| s.is_terminal() && s.expires_at + grace < now);
        if !removed.is_empty() {
            info!(count = removed.len(), "[LIFECYCLE] Purged terminal signals");
        }
        removed.into_iter().map(|s| s.id).collect()
    }
}
