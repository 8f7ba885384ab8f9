//! In-memory signal/trade store with JSON snapshot save/load

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{CloseOutcome, SignalStore, TradeStore};
use crate::error::{EngineError, EngineResult};
use crate::types::{PaperTrade, Signal, SignalState};

/// Serializable store contents (for restart recovery)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub signals: Vec<Signal>,
    pub trades: Vec<PaperTrade>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

/// Signals and trades live in separate maps under separate locks: nothing
/// that happens to a signal can reach a trade row.
#[derive(Default)]
pub struct InMemoryStore {
    signals: RwLock<HashMap<Uuid, Signal>>,
    trades: RwLock<HashMap<Uuid, PaperTrade>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export_state(&self) -> StoreSnapshot {
        let mut signals: Vec<Signal> = self
            .signals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        signals.sort_by_key(|s| s.created_at);

        StoreSnapshot {
            signals,
            trades: self.trades(),
            saved_at: Some(Utc::now()),
        }
    }

    pub fn import_state(&self, snapshot: StoreSnapshot) {
        let signal_count = snapshot.signals.len();
        let trade_count = snapshot.trades.len();
        {
            let mut signals = self.signals.write().unwrap_or_else(|e| e.into_inner());
            signals.clear();
            signals.extend(snapshot.signals.into_iter().map(|s| (s.id, s)));
        }
        {
            let mut trades = self.trades.write().unwrap_or_else(|e| e.into_inner());
            trades.clear();
            trades.extend(snapshot.trades.into_iter().map(|t| (t.id, t)));
        }
        info!(
            signals = signal_count,
            trades = trade_count,
            "💾 [STORE] State restored"
        );
    }

    /// Save current state to a JSON file
    pub fn save_state(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed creating {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(&self.export_state())?;
        fs::write(path, json).with_context(|| format!("Failed writing {}", path.display()))?;
        info!(path = %path.display(), "💾 [STORE] State saved");
        Ok(())
    }

    /// Load state from a JSON file; a missing file leaves the store empty
    pub fn load_state(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            info!(path = %path.display(), "💾 [STORE] No state file found, starting fresh");
            return Ok(());
        }
        let json =
            fs::read_to_string(path).with_context(|| format!("Failed reading {}", path.display()))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed parsing {}", path.display()))?;
        self.import_state(snapshot);
        Ok(())
    }
}

impl SignalStore for InMemoryStore {
    fn insert_signal_if_absent(&self, signal: Signal) -> EngineResult<Signal> {
        let mut signals = self.signals.write().unwrap_or_else(|e| e.into_inner());
        let holder = signals.values().find(|s| {
            !s.is_terminal() && s.symbol == signal.symbol && s.direction == signal.direction
        });
        if holder.is_some() {
            return Err(EngineError::DuplicateAdmission {
                symbol: signal.symbol,
                direction: signal.direction,
            });
        }
        signals.insert(signal.id, signal.clone());
        Ok(signal)
    }

    fn get_signal(&self, id: &Uuid) -> Option<Signal> {
        self.signals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn signals(&self) -> Vec<Signal> {
        let mut out: Vec<Signal> = self
            .signals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    fn update_signal_if(
        &self,
        id: &Uuid,
        expected: &[SignalState],
        update: &dyn Fn(&mut Signal),
    ) -> EngineResult<Signal> {
        let mut signals = self.signals.write().unwrap_or_else(|e| e.into_inner());
        let signal = signals
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("signal {id}")))?;
        if !expected.contains(&signal.state) {
            return Err(EngineError::InvalidTransition {
                from: signal.state.to_string(),
                to: format!("{expected:?}"),
                reason: format!("signal {id} is not in an expected state"),
            });
        }
        update(signal);
        Ok(signal.clone())
    }

    fn remove_signals_where(&self, predicate: &dyn Fn(&Signal) -> bool) -> Vec<Signal> {
        let mut signals = self.signals.write().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<Uuid> = signals
            .values()
            .filter(|s| predicate(s))
            .map(|s| s.id)
            .collect();
        ids.iter().filter_map(|id| signals.remove(id)).collect()
    }
}

impl TradeStore for InMemoryStore {
    fn insert_trade(&self, trade: PaperTrade) -> EngineResult<()> {
        let mut trades = self.trades.write().unwrap_or_else(|e| e.into_inner());
        if trades.contains_key(&trade.id) {
            warn!(trade_id = %trade.id, "[STORE] Refusing to overwrite existing trade");
            return Err(EngineError::InvalidTransition {
                from: "EXISTS".to_string(),
                to: "OPEN".to_string(),
                reason: format!("trade {} already stored", trade.id),
            });
        }
        if let Some(signal_id) = trade.originating_signal_ref {
            if let Some(existing) = trades
                .values()
                .find(|t| t.originating_signal_ref == Some(signal_id))
            {
                warn!(
                    trade_id = %existing.id,
                    signal_id = %signal_id,
                    "[STORE] Signal already has a trade"
                );
                return Err(EngineError::InvalidTransition {
                    from: "EXECUTED".to_string(),
                    to: "OPEN".to_string(),
                    reason: format!("signal {signal_id} already traded as {}", existing.id),
                });
            }
        }
        trades.insert(trade.id, trade);
        Ok(())
    }

    fn get_trade(&self, id: &Uuid) -> Option<PaperTrade> {
        self.trades
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn trades(&self) -> Vec<PaperTrade> {
        let mut out: Vec<PaperTrade> = self
            .trades
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|t| t.opened_at);
        out
    }

    fn close_if_open(&self, id: &Uuid, close: &dyn Fn(&mut PaperTrade)) -> CloseOutcome {
        let mut trades = self.trades.write().unwrap_or_else(|e| e.into_inner());
        match trades.get_mut(id) {
            None => CloseOutcome::NotFound,
            Some(trade) if !trade.status.is_open() => CloseOutcome::AlreadyClosed(trade.clone()),
            Some(trade) => {
                close(trade);
                CloseOutcome::Closed(trade.clone())
            }
        }
    }
}
