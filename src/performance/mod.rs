//! Performance Aggregator
//!
//! Folds closed paper trades into running statistics, globally and per
//! volatility bucket (the bucket recorded on the trade at open time).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{PaperTrade, TradeStatus, VolatilityBucket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PerformanceScope {
    Global,
    Bucket(VolatilityBucket),
}

impl fmt::Display for PerformanceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformanceScope::Global => write!(f, "GLOBAL"),
            PerformanceScope::Bucket(b) => write!(f, "{b}"),
        }
    }
}

/// Running statistics for one scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    /// Sum of winning PnL
    pub gross_profit: f64,
    /// Sum of losing PnL magnitudes (non-negative)
    pub gross_loss: f64,
    pub net_pnl: f64,
    pub total_fees: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Positive for a win streak, negative for a loss streak
    pub current_streak: i32,
    pub best_streak: i32,
    pub worst_streak: i32,
    /// Highest cumulative PnL reached (starts at 0)
    pub peak_equity: f64,
    /// Largest peak-to-trough decline of cumulative PnL
    pub max_drawdown: f64,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl PerformanceRecord {
    /// wins / total; 0 with no trades
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.total_trades as f64
        }
    }

    /// gross profit / gross loss. `f64::INFINITY` when there are profits and
    /// no losses; 0 when there are neither.
    pub fn profit_factor(&self) -> f64 {
        if self.gross_loss > 0.0 {
            self.gross_profit / self.gross_loss
        } else if self.gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    pub fn avg_win(&self) -> f64 {
        if self.wins > 0 {
            self.gross_profit / self.wins as f64
        } else {
            0.0
        }
    }

    pub fn avg_loss(&self) -> f64 {
        if self.losses > 0 {
            -self.gross_loss / self.losses as f64
        } else {
            0.0
        }
    }

    /// Mean PnL per trade
    pub fn expectancy(&self) -> f64 {
        if self.total_trades > 0 {
            self.net_pnl / self.total_trades as f64
        } else {
            0.0
        }
    }

    fn apply(&mut self, pnl: f64, fees: f64, at: Option<DateTime<Utc>>) {
        self.total_trades += 1;
        self.net_pnl += pnl;
        self.total_fees += fees;
        self.last_trade_at = at.or(self.last_trade_at);

        if pnl > 0.0 {
            self.wins += 1;
            self.gross_profit += pnl;
            self.largest_win = self.largest_win.max(pnl);
            self.current_streak = if self.current_streak > 0 {
                self.current_streak + 1
            } else {
                1
            };
        } else {
            self.losses += 1;
            self.gross_loss += -pnl;
            self.largest_loss = self.largest_loss.min(pnl);
            self.current_streak = if self.current_streak < 0 {
                self.current_streak - 1
            } else {
                -1
            };
        }
        self.best_streak = self.best_streak.max(self.current_streak);
        self.worst_streak = self.worst_streak.min(self.current_streak);

        self.peak_equity = self.peak_equity.max(self.net_pnl);
        self.max_drawdown = self.max_drawdown.max(self.peak_equity - self.net_pnl);
    }
}

#[derive(Default)]
struct AggregatorState {
    records: HashMap<PerformanceScope, PerformanceRecord>,
    /// One id per folded trade, kept for the life of the process (a
    /// restart rebuilds it from the trade store)
    recorded: HashSet<Uuid>,
}

#[derive(Default)]
pub struct PerformanceAggregator {
    state: RwLock<AggregatorState>,
}

impl PerformanceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a closed trade into the global and bucket records.
    ///
    /// Returns false (and changes nothing) for open or cancelled trades and
    /// for trades already recorded.
    pub fn record(&self, trade: &PaperTrade) -> bool {
        if matches!(trade.status, TradeStatus::Open | TradeStatus::Cancelled) {
            return false;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.recorded.insert(trade.id) {
            debug!(trade_id = %trade.id, "[PERF] Trade already recorded");
            return false;
        }
        for scope in [
            PerformanceScope::Global,
            PerformanceScope::Bucket(trade.bucket),
        ] {
            state.records.entry(scope).or_default().apply(
                trade.realized_pnl,
                trade.fees_paid,
                trade.closed_at,
            );
        }
        true
    }

    /// Rebuild from persisted trades (oldest close first)
    pub fn rebuild(&self, trades: &[PaperTrade]) -> usize {
        let mut closed: Vec<&PaperTrade> = trades.iter().filter(|t| !t.status.is_open()).collect();
        closed.sort_by_key(|t| t.closed_at);
        closed.into_iter().filter(|t| self.record(t)).count()
    }

    pub fn snapshot(&self, scope: PerformanceScope) -> PerformanceRecord {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .get(&scope)
            .cloned()
            .unwrap_or_default()
    }

    pub fn global(&self) -> PerformanceRecord {
        self.snapshot(PerformanceScope::Global)
    }

    pub fn by_bucket(&self) -> Vec<(VolatilityBucket, PerformanceRecord)> {
        VolatilityBucket::ALL
            .iter()
            .map(|b| (*b, self.snapshot(PerformanceScope::Bucket(*b))))
            .collect()
    }

    pub fn summary_string(&self) -> String {
        let g = self.global();
        format!(
            "Trades: {} | WR: {:.1}% | PnL: ${:+.2} | PF: {:.2} | Max DD: ${:.2}",
            g.total_trades,
            g.win_rate() * 100.0,
            g.net_pnl,
            g.profit_factor(),
            g.max_drawdown
        )
    }

    pub fn print_summary(&self) {
        let g = self.global();
        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║  📋 VOLPAPER PERFORMANCE                                     ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║  📈 P&L: ${:+.2} | Fees: ${:.4} | Expectancy: ${:+.4}",
            g.net_pnl,
            g.total_fees,
            g.expectancy()
        );
        info!(
            "║  🎯 WINRATE: {:.1}% ({} W / {} L / {} total) | Streak: {}",
            g.win_rate() * 100.0,
            g.wins,
            g.losses,
            g.total_trades,
            g.current_streak
        );
        info!(
            "║  📊 Avg Win: ${:+.4} | Avg Loss: ${:+.4} | Profit Factor: {:.2}",
            g.avg_win(),
            g.avg_loss(),
            g.profit_factor()
        );
        info!(
            "║  📊 Best: ${:+.4} | Worst: ${:+.4} | Max DD: ${:.2}",
            g.largest_win, g.largest_loss, g.max_drawdown
        );
        info!("║  ─── Per-Bucket Breakdown ───");
        for (bucket, r) in self.by_bucket() {
            info!(
                "║  {:<6} | {} trades | WR {:.1}% | PnL ${:+.2} | PF {:.2}",
                bucket.to_string(),
                r.total_trades,
                r.win_rate() * 100.0,
                r.net_pnl,
                r.profit_factor()
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}
