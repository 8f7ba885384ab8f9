//! Trading Runtime
//!
//! Wires the components together and exposes the scheduler entry points:
//! - signal pass: candles → indicators → volatility → signal → admission
//!   (→ paper trade when `auto_execute`)
//! - monitor pass: latest price bar per symbol → paper-trade exits
//! - lifecycle pass: invalidate / expire live signals
//! - retention pass: purge terminal signals past the grace window
//!
//! Each pass is independent; `tick` runs them in order and `run_until`
//! drives `tick` on an interval.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::indicators::IndicatorEngine;
use crate::lifecycle::{Admission, LifecycleReport, SignalLifecycleManager};
use crate::paper_trading::PaperTradingEngine;
use crate::performance::PerformanceAggregator;
use crate::persistence::{CandleStore, CloseOutcome, CsvTradeJournal, SignalStore, TradeStore};
use crate::strategy::SignalEngine;
use crate::types::{Candle, PaperTrade, PriceBar, Signal, Timeframe};
use crate::volatility::VolatilityClassifier;

/// What happened to one symbol during a signal pass
#[derive(Debug, Clone)]
pub enum SymbolOutcome {
    /// Candle data missing; symbol skipped this tick
    Skipped(String),
    /// Not enough history for at least one indicator
    NotReady,
    NoSignal,
    Admitted(Signal),
    Duplicate,
    Rejected(String),
    /// Admitted and a paper trade opened from it
    Opened { signal: Signal, trade: PaperTrade },
}

#[derive(Debug, Clone, Default)]
pub struct SignalPassReport {
    pub evaluated: usize,
    pub skipped: usize,
    pub not_ready: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub admitted: Vec<Signal>,
    pub opened: Vec<PaperTrade>,
}

impl SignalPassReport {
    fn absorb(&mut self, outcome: SymbolOutcome) {
        self.evaluated += 1;
        match outcome {
            SymbolOutcome::Skipped(_) => self.skipped += 1,
            SymbolOutcome::NotReady => self.not_ready += 1,
            SymbolOutcome::NoSignal => {}
            SymbolOutcome::Admitted(signal) => self.admitted.push(signal),
            SymbolOutcome::Duplicate => self.duplicates += 1,
            SymbolOutcome::Rejected(_) => self.rejected += 1,
            SymbolOutcome::Opened { signal, trade } => {
                self.admitted.push(signal);
                self.opened.push(trade);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub closed: Vec<PaperTrade>,
    pub lifecycle: LifecycleReport,
    pub signals: SignalPassReport,
    pub purged: Vec<Uuid>,
}

pub struct TradingRuntime {
    engine: EngineConfig,
    candles: Arc<dyn CandleStore>,
    indicators: IndicatorEngine,
    classifier: VolatilityClassifier,
    signals: SignalEngine,
    lifecycle: SignalLifecycleManager,
    paper: PaperTradingEngine,
    performance: PerformanceAggregator,
    journal: Option<CsvTradeJournal>,
}

impl TradingRuntime {
    pub fn new(
        config: &AppConfig,
        candles: Arc<dyn CandleStore>,
        signal_store: Arc<dyn SignalStore>,
        trade_store: Arc<dyn TradeStore>,
    ) -> Self {
        Self {
            engine: config.engine.clone(),
            candles,
            indicators: IndicatorEngine::new(config.indicators.clone()),
            classifier: VolatilityClassifier::new(config.volatility.clone()),
            signals: SignalEngine::new(config.strategy.clone(), config.volatility.profiles.clone()),
            lifecycle: SignalLifecycleManager::new(config.lifecycle.clone(), signal_store),
            paper: PaperTradingEngine::new(config.paper_trading.clone(), trade_store),
            performance: PerformanceAggregator::new(),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: CsvTradeJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn lifecycle(&self) -> &SignalLifecycleManager {
        &self.lifecycle
    }

    pub fn paper(&self) -> &PaperTradingEngine {
        &self.paper
    }

    pub fn performance(&self) -> &PerformanceAggregator {
        &self.performance
    }

    pub fn classifier(&self) -> &VolatilityClassifier {
        &self.classifier
    }

    /// Rebuild performance from trades already in the store (after restart)
    pub fn restore_performance(&self) -> usize {
        let restored = self.performance.rebuild(&self.paper.trades());
        if restored > 0 {
            info!(trades = restored, "[PERF] Performance restored from stored trades");
        }
        restored
    }

    // ── Signal pass ───────────────────────────────────────────────

    /// Evaluate every configured symbol concurrently
    pub async fn run_signal_pass(&self, now: DateTime<Utc>) -> SignalPassReport {
        let outcomes = join_all(
            self.engine
                .symbols
                .iter()
                .map(|symbol| self.evaluate_symbol(symbol, now)),
        )
        .await;

        let mut report = SignalPassReport::default();
        for (symbol, outcome) in self.engine.symbols.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => report.absorb(outcome),
                Err(e) => {
                    if e.is_benign() {
                        debug!(symbol = %symbol, reason = %e, "[SIGNAL] Symbol skipped");
                    } else {
                        warn!(symbol = %symbol, error = %e, "[SIGNAL] Symbol evaluation failed");
                    }
                    report.absorb(SymbolOutcome::Skipped(e.to_string()));
                }
            }
        }

        if !report.admitted.is_empty() || report.skipped > 0 {
            info!(
                evaluated = report.evaluated,
                admitted = report.admitted.len(),
                opened = report.opened.len(),
                duplicates = report.duplicates,
                skipped = report.skipped,
                not_ready = report.not_ready,
                "[SIGNAL] Pass complete"
            );
        }
        report
    }

    async fn fetch(&self, symbol: &str, timeframe: Timeframe) -> EngineResult<Vec<Candle>> {
        self.candles
            .get_candles(symbol, timeframe, self.engine.candle_lookback)
            .await
    }

    /// Full pipeline for one symbol
    pub async fn evaluate_symbol(&self, symbol: &str, now: DateTime<Utc>) -> EngineResult<SymbolOutcome> {
        let mut series: BTreeMap<_, Vec<Candle>> = BTreeMap::new();
        for tf in &self.signals.config().timeframes {
            match self.fetch(symbol, *tf).await {
                Ok(candles) => {
                    series.insert(*tf, candles);
                }
                Err(EngineError::DataUnavailable { reason, .. }) => {
                    warn!(symbol = %symbol, timeframe = %tf, reason = %reason, "[SIGNAL] Data unavailable, skipping symbol");
                    return Ok(SymbolOutcome::Skipped(reason));
                }
                Err(e) => return Err(e),
            }
        }

        let mut snapshots = BTreeMap::new();
        for (tf, candles) in &series {
            match self.indicators.evaluate(symbol, *tf, candles) {
                Ok(snapshot) => {
                    snapshots.insert(*tf, snapshot);
                }
                Err(e @ EngineError::NotReady { .. }) => {
                    debug!(symbol = %symbol, reason = %e, "[SIGNAL] Indicators not ready");
                    return Ok(SymbolOutcome::NotReady);
                }
                Err(e) => return Err(e),
            }
        }

        let vol_tf = self.engine.volatility_timeframe;
        let cached = self
            .classifier
            .cached(symbol)
            .filter(|class| class.is_valid_at(now));
        let class = if let Some(class) = cached {
            class
        } else {
            let vol_candles = match series.get(&vol_tf) {
                Some(candles) => candles.clone(),
                None => match self.fetch(symbol, vol_tf).await {
                    Ok(candles) => candles,
                    Err(EngineError::DataUnavailable { reason, .. }) => {
                        warn!(symbol = %symbol, timeframe = %vol_tf, reason = %reason, "[VOL] Data unavailable, skipping symbol");
                        return Ok(SymbolOutcome::Skipped(reason));
                    }
                    Err(e) => return Err(e),
                },
            };
            self.classifier.classify(symbol, &vol_candles, now)
        };

        let Some(candidate) = self.signals.evaluate(symbol, &snapshots, &class, now) else {
            return Ok(SymbolOutcome::NoSignal);
        };

        match self.lifecycle.admit(candidate, now) {
            Admission::Admitted(signal) => {
                if !self.engine.auto_execute {
                    return Ok(SymbolOutcome::Admitted(signal));
                }
                match self.execute_signal(&signal.id, now) {
                    Ok(trade) => Ok(SymbolOutcome::Opened { signal, trade }),
                    Err(e) => {
                        warn!(signal_id = %signal.id, error = %e, "[PAPER] Could not open trade for admitted signal");
                        Ok(SymbolOutcome::Admitted(signal))
                    }
                }
            }
            Admission::Duplicate { .. } => Ok(SymbolOutcome::Duplicate),
            Admission::Rejected(reason) => Ok(SymbolOutcome::Rejected(reason)),
        }
    }

    /// ACTIVE signal → EXECUTED → OPEN paper trade. If the trade cannot be
    /// opened the signal is invalidated so its key is released.
    pub fn execute_signal(&self, signal_id: &Uuid, now: DateTime<Utc>) -> EngineResult<PaperTrade> {
        let executed = self.lifecycle.mark_executed(signal_id, now)?;
        match self.paper.open(&executed, now) {
            Ok(trade) => Ok(trade),
            Err(e) => {
                if let Err(revert) = self.lifecycle.abandon_execution(signal_id, &e.to_string(), now) {
                    error!(signal_id = %signal_id, error = %revert, "[LIFECYCLE] Failed to release signal after open failure");
                }
                Err(e)
            }
        }
    }

    // ── Price bars ────────────────────────────────────────────────

    async fn latest_bars<'a>(
        &self,
        symbols: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, PriceBar> {
        let tf = self.engine.monitor_timeframe;
        let symbols: Vec<&str> = symbols.into_iter().collect();
        let results = join_all(
            symbols
                .iter()
                .map(|symbol| self.candles.get_candles(symbol, tf, 1)),
        )
        .await;

        let mut bars = HashMap::new();
        for (symbol, result) in symbols.into_iter().zip(results) {
            match result {
                Ok(candles) => {
                    if let Some(last) = candles.last() {
                        bars.insert(symbol.to_string(), PriceBar::from_candle(last));
                    }
                }
                Err(e) => debug!(symbol = %symbol, error = %e, "[PAPER] No latest price"),
            }
        }
        bars
    }

    // ── Monitor pass ──────────────────────────────────────────────

    /// Close open trades whose stop or target the latest bar reached
    pub async fn run_monitor_pass(&self, now: DateTime<Utc>) -> Vec<PaperTrade> {
        let open = self.paper.open_trades();
        if open.is_empty() {
            return Vec::new();
        }
        let symbols: HashSet<&str> = open.iter().map(|t| t.symbol.as_str()).collect();
        let bars = self.latest_bars(symbols).await;

        let closed = self.paper.monitor(&open, &bars);
        for trade in &closed {
            self.on_trade_closed(trade, now).await;
        }
        closed
    }

    /// Bookkeeping after this process closed a trade
    async fn on_trade_closed(&self, trade: &PaperTrade, now: DateTime<Utc>) {
        self.performance.record(trade);
        if let Some(signal_id) = trade.originating_signal_ref {
            self.lifecycle.mark_position_closed(&signal_id, now);
        }
        if let Some(ref journal) = self.journal {
            if let Err(e) = journal.append(trade).await {
                error!(trade_id = %trade.id, error = %e, "Failed to journal closed trade");
            }
        }
    }

    /// Manual close at `price`, or at the latest bar close when `None`
    pub async fn close_trade(
        &self,
        trade_id: &Uuid,
        price: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<CloseOutcome> {
        let Some(trade) = self.paper.get_trade(trade_id) else {
            return Ok(CloseOutcome::NotFound);
        };
        let price = match price {
            Some(p) => p,
            None => self
                .latest_bars([trade.symbol.as_str()])
                .await
                .get(&trade.symbol)
                .map(|bar| bar.close)
                .ok_or_else(|| EngineError::DataUnavailable {
                    symbol: trade.symbol.clone(),
                    reason: "no price for manual close".to_string(),
                })?,
        };
        let outcome = self.paper.close_manual(trade_id, price, now)?;
        if let CloseOutcome::Closed(ref done) = outcome {
            self.on_trade_closed(done, now).await;
        }
        Ok(outcome)
    }

    pub async fn cancel_trade(&self, trade_id: &Uuid, now: DateTime<Utc>) -> CloseOutcome {
        let outcome = self.paper.cancel(trade_id, now);
        if let CloseOutcome::Closed(ref done) = outcome {
            self.on_trade_closed(done, now).await;
        }
        outcome
    }

    // ── Lifecycle / retention ─────────────────────────────────────

    pub async fn run_lifecycle_pass(&self, now: DateTime<Utc>) -> LifecycleReport {
        let live = self.lifecycle.live_signals();
        if live.is_empty() {
            return LifecycleReport::default();
        }
        let symbols: HashSet<&str> = live.iter().map(|s| s.symbol.as_str()).collect();
        let bars = self.latest_bars(symbols).await;
        self.lifecycle.refresh(&bars, now)
    }

    pub fn run_retention_pass(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.lifecycle.purge(now)
    }

    /// One scheduler tick: monitor, lifecycle, signals, retention
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let closed = self.run_monitor_pass(now).await;
        let lifecycle = self.run_lifecycle_pass(now).await;
        let signals = self.run_signal_pass(now).await;
        let purged = self.run_retention_pass(now);
        TickReport {
            closed,
            lifecycle,
            signals,
            purged,
        }
    }

    /// Tick every `tick_interval_secs` until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(self.engine.tick_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let summary_every = self.engine.summary_interval_secs;
        let mut last_summary = Utc::now();
        tokio::pin!(shutdown);

        info!(
            symbols = ?self.engine.symbols,
            interval_secs = self.engine.tick_interval_secs,
            "🚀 Runtime started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let report = self.tick(now).await;
                    debug!(
                        closed = report.closed.len(),
                        expired = report.lifecycle.expired.len(),
                        invalidated = report.lifecycle.invalidated.len(),
                        admitted = report.signals.admitted.len(),
                        purged = report.purged.len(),
                        "Tick complete"
                    );
                    if summary_every > 0 && (now - last_summary).num_seconds() >= summary_every as i64 {
                        self.performance.print_summary();
                        last_summary = now;
                    }
                }
                _ = &mut shutdown => {
                    info!("🛑 Shutdown requested");
                    break;
                }
            }
        }
        self.performance.print_summary();
    }
}
