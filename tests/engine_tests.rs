//! End-to-end tests for the VolPaper engine

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use mockall::mock;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use uuid::Uuid;

    use volpaper::config::AppConfig;
    use volpaper::error::{EngineError, EngineResult};
    use volpaper::indicators::{compute_adx, compute_rsi, IndicatorEngine, IndicatorSnapshot};
    use volpaper::lifecycle::{Admission, LifecycleConfig, SignalLifecycleManager};
    use volpaper::paper_trading::{PaperTradingConfig, PaperTradingEngine};
    use volpaper::performance::PerformanceAggregator;
    use volpaper::persistence::{
        CandleStore, CloseOutcome, CsvCandleStore, InMemoryCandleStore, InMemoryStore,
    };
    use volpaper::runtime::TradingRuntime;
    use volpaper::strategy::SignalEngine;
    use volpaper::types::{
        Candle, CloseReason, Direction, PriceBar, Signal, SignalState, Timeframe, TradeStatus,
        TradingType, VolatilityBucket,
    };
    use volpaper::volatility::VolatilityClassifier;

    mock! {
        pub Candles {}

        #[async_trait]
        impl CandleStore for Candles {
            async fn get_candles(
                &self,
                symbol: &str,
                timeframe: Timeframe,
                lookback: usize,
            ) -> EngineResult<Vec<Candle>>;
        }
    }

    // ============================================================================
    // Fixtures
    // ============================================================================

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    /// Ranging market that ends with two sharp down closes: RSI crosses
    /// below 30 with ADX ~15.7 and ATR ~1.22 (MEDIUM volatility)
    fn oversold_closes() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + 1.5 * (2.0 * std::f64::consts::PI * i as f64 / 10.0).sin())
            .collect();
        let last = closes[59];
        closes.push(last - 2.0);
        closes.push(last - 5.0);
        closes
    }

    /// Candles whose open is the previous close, with a 0.2 wick either side
    fn series(symbol: &str, tf: Timeframe, closes: &[f64]) -> Vec<Candle> {
        let mut prev = closes[0];
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = prev;
                prev = close;
                Candle {
                    symbol: symbol.to_string(),
                    timeframe: tf,
                    open_time: t0() + tf.duration() * i as i32,
                    open,
                    high: open.max(close) + 0.2,
                    low: open.min(close) - 0.2,
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    }

    /// Flat candles of a fixed range around 100
    fn flat(symbol: &str, range: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                symbol: symbol.to_string(),
                timeframe: Timeframe::Hour1,
                open_time: t0() + Duration::hours(i as i64),
                open: 100.0,
                high: 100.0 + range / 2.0,
                low: 100.0 - range / 2.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect()
    }

    fn long_signal(symbol: &str, now: DateTime<Utc>) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timeframe: Timeframe::Min15,
            direction: Direction::Long,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 103.0,
            atr: 1.0,
            confidence: 0.6,
            trading_type: TradingType::Scalp,
            bucket: VolatilityBucket::Medium,
            state: SignalState::Pending,
            created_at: now,
            expires_at: now + Duration::hours(2),
            updated_at: now,
            position_closed_at: None,
            reasons: vec![],
        }
    }

    fn config(symbols: &[&str]) -> AppConfig {
        let mut config = AppConfig::default_config().unwrap();
        config.engine.symbols = symbols.iter().map(|s| s.to_string()).collect();
        config
    }

    fn seeded_candles(symbol: &str) -> Arc<InMemoryCandleStore> {
        let candles = Arc::new(InMemoryCandleStore::new());
        let closes = oversold_closes();
        for tf in [Timeframe::Min15, Timeframe::Hour1] {
            candles.extend(series(symbol, tf, &closes));
        }
        candles
    }

    // ============================================================================
    // Indicators
    // ============================================================================

    #[test]
    fn test_indicators_bounded_and_idempotent() {
        let candles = series("BTCUSDT", Timeframe::Min15, &oversold_closes());
        let engine = IndicatorEngine::default();

        let first = engine.evaluate("BTCUSDT", Timeframe::Min15, &candles).unwrap();
        let second = engine.evaluate("BTCUSDT", Timeframe::Min15, &candles).unwrap();
        assert_eq!(first, second);

        assert!((0.0..=100.0).contains(&first.rsi));
        assert!((0.0..=100.0).contains(&first.adx));
        assert!(first.atr >= 0.0);
        assert!((first.rsi - 25.99).abs() < 0.05);
        assert!((first.rsi_prev.unwrap() - 35.19).abs() < 0.05);
        assert!((first.adx - 15.69).abs() < 0.05);
        assert!((first.atr - 1.2196).abs() < 1e-3);

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        for end in 15..closes.len() {
            let rsi = compute_rsi(&closes[..end], 14).unwrap();
            assert!((0.0..=100.0).contains(&rsi));
        }
        for end in 28..candles.len() {
            let adx = compute_adx(&candles[..end], 14).unwrap();
            assert!((0.0..=100.0).contains(&adx.adx));
        }
    }

    #[test]
    fn test_short_history_is_not_ready() {
        let candles = series("BTCUSDT", Timeframe::Min15, &oversold_closes()[..20]);
        let err = IndicatorEngine::default()
            .evaluate("BTCUSDT", Timeframe::Min15, &candles)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotReady { indicator: "ADX", .. }));
    }

    // ============================================================================
    // Volatility-adaptive stops
    // ============================================================================

    fn snapshot(tf: Timeframe) -> IndicatorSnapshot {
        IndicatorSnapshot {
            symbol: "BTCUSDT".to_string(),
            timeframe: tf,
            computed_at: t0(),
            close: 100.0,
            rsi: 22.0,
            rsi_prev: Some(33.0),
            adx: 15.0,
            plus_di: 18.0,
            minus_di: 22.0,
            atr: 1.0,
        }
    }

    #[test]
    fn test_low_bucket_stops_tighter_than_high() {
        let classifier = VolatilityClassifier::default();
        let calm = classifier.compute("BTCUSDT", &flat("BTCUSDT", 0.2, 40), t0());
        let wild = classifier.compute("BTCUSDT", &flat("BTCUSDT", 4.0, 40), t0());
        assert_eq!(calm.bucket, VolatilityBucket::Low);
        assert_eq!(wild.bucket, VolatilityBucket::High);

        let engine = SignalEngine::default();
        let snaps: BTreeMap<_, _> = [Timeframe::Min15, Timeframe::Hour1]
            .into_iter()
            .map(|tf| (tf, snapshot(tf)))
            .collect();

        let low = engine.evaluate("BTCUSDT", &snaps, &calm, t0()).unwrap();
        let high = engine.evaluate("BTCUSDT", &snaps, &wild, t0()).unwrap();
        assert_eq!(low.direction, Direction::Long);
        assert_eq!(high.direction, Direction::Long);
        assert_eq!(low.bucket, VolatilityBucket::Low);
        assert_eq!(high.bucket, VolatilityBucket::High);

        let low_distance = low.entry_price - low.stop_loss;
        let high_distance = high.entry_price - high.stop_loss;
        assert!((low_distance - 1.0).abs() < 1e-9);
        assert!((high_distance - 2.0).abs() < 1e-9);
        assert!(low_distance < high_distance);
    }

    #[test]
    fn test_no_signal_without_every_timeframe() {
        let engine = SignalEngine::default();
        let class = VolatilityClassifier::default().compute("BTCUSDT", &flat("BTCUSDT", 1.0, 40), t0());
        let snaps: BTreeMap<_, _> = [(Timeframe::Min15, snapshot(Timeframe::Min15))].into();
        assert!(engine.evaluate("BTCUSDT", &snaps, &class, t0()).is_none());
    }

    // ============================================================================
    // Deduplication
    // ============================================================================

    #[test]
    fn test_dedup_until_terminal() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = SignalLifecycleManager::new(LifecycleConfig::default(), store);
        let now = t0();

        let Admission::Admitted(first) = lifecycle.admit(long_signal("ETHUSDT", now), now) else {
            panic!("first signal should be admitted");
        };
        assert!(matches!(
            lifecycle.admit(long_signal("ETHUSDT", now), now),
            Admission::Duplicate { .. }
        ));

        // Opposite direction is a different key
        let mut short = long_signal("ETHUSDT", now);
        short.direction = Direction::Short;
        short.stop_loss = 102.0;
        short.take_profit = 97.0;
        assert!(matches!(lifecycle.admit(short, now), Admission::Admitted(_)));

        let report = lifecycle.refresh(&HashMap::new(), first.expires_at);
        assert!(report.expired.contains(&first.id));
        assert!(matches!(
            lifecycle.admit(long_signal("ETHUSDT", first.expires_at), first.expires_at),
            Admission::Admitted(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_admits_one_per_key() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = Arc::new(SignalLifecycleManager::new(LifecycleConfig::default(), store));
        let now = t0();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                tokio::spawn(async move { lifecycle.admit(long_signal("SOLUSDT", now), now) })
            })
            .collect();

        let mut admitted = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Admission::Admitted(_) => admitted += 1,
                Admission::Duplicate { .. } => duplicates += 1,
                Admission::Rejected(reason) => panic!("unexpected rejection: {reason}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(duplicates, 15);
        assert_eq!(lifecycle.live_signals().len(), 1);
    }

    // ============================================================================
    // Paper trading
    // ============================================================================

    /// Admit and execute through the lifecycle, as the runtime does
    fn executed(lifecycle: &SignalLifecycleManager, candidate: Signal, now: DateTime<Utc>) -> Signal {
        let Admission::Admitted(signal) = lifecycle.admit(candidate, now) else {
            panic!("signal should be admitted");
        };
        lifecycle.mark_executed(&signal.id, now).unwrap()
    }

    fn paper_engine() -> (SignalLifecycleManager, PaperTradingEngine) {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = SignalLifecycleManager::new(LifecycleConfig::default(), store.clone());
        let paper = PaperTradingEngine::new(PaperTradingConfig::default(), store);
        (lifecycle, paper)
    }

    #[test]
    fn test_long_round_trip_stops_out() {
        let (lifecycle, paper) = paper_engine();
        let now = t0();

        let signal = executed(&lifecycle, long_signal("BTCUSDT", now), now);
        let trade = paper.open(&signal, now).unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert!((trade.quantity - 10.0).abs() < 1e-9);
        assert_eq!(trade.originating_signal_ref, Some(signal.id));

        // Last-trade ticks 101 then 99 never touch the 98 stop
        for (minute, price) in [(1, 101.0), (2, 99.0)] {
            let tick = HashMap::from([(
                "BTCUSDT".to_string(),
                PriceBar::tick(price, now + Duration::minutes(minute)),
            )]);
            assert!(paper.monitor(&paper.open_trades(), &tick).is_empty());
        }
        assert_eq!(paper.get_trade(&trade.id).unwrap().status, TradeStatus::Open);

        // A bar that trades down to 98 before settling at 99 does
        let down = HashMap::from([(
            "BTCUSDT".to_string(),
            PriceBar {
                open: 101.0,
                high: 101.0,
                low: 98.0,
                close: 99.0,
                as_of: now + Duration::minutes(3),
            },
        )]);
        let closed = paper.monitor(&paper.open_trades(), &down);
        assert_eq!(closed.len(), 1);
        let done = &closed[0];
        assert_eq!(done.status, TradeStatus::ClosedLoss);
        assert_eq!(done.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(done.exit_price, Some(98.0));
        assert!((done.realized_pnl + 20.0).abs() < 1e-9);

        // Same bar again: nothing left to close
        let stale = vec![trade.clone()];
        assert!(paper.monitor(&stale, &down).is_empty());
        assert_eq!(paper.get_trade(&trade.id).unwrap().realized_pnl, done.realized_pnl);
    }

    #[test]
    fn test_signal_opens_at_most_one_trade() {
        let (lifecycle, paper) = paper_engine();
        let now = t0();

        let Admission::Admitted(active) = lifecycle.admit(long_signal("BTCUSDT", now), now) else {
            panic!("signal should be admitted");
        };
        // ACTIVE is not enough: execution goes through the lifecycle first
        assert!(matches!(
            paper.open(&active, now),
            Err(EngineError::InvalidTransition { .. })
        ));

        let signal = lifecycle.mark_executed(&active.id, now).unwrap();
        let trade = paper.open(&signal, now).unwrap();
        assert!(paper.open(&signal, now).is_err());
        assert!(lifecycle.mark_executed(&active.id, now).is_err());

        let trades = paper.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].id, trade.id);
    }

    #[test]
    fn test_manual_close_is_exactly_once() {
        let (lifecycle, paper) = paper_engine();
        let now = t0();
        let signal = executed(&lifecycle, long_signal("BTCUSDT", now), now);
        let trade = paper.open(&signal, now).unwrap();

        assert!(matches!(
            paper.close_manual(&trade.id, f64::NAN, now),
            Err(EngineError::InvalidSetup { .. })
        ));
        assert!(paper.get_trade(&trade.id).unwrap().status.is_open());

        let first = paper.close_manual(&trade.id, 102.0, now).unwrap();
        let second = paper.close_manual(&trade.id, 90.0, now).unwrap();
        let closed = first.closed().unwrap();
        assert_eq!(closed.status, TradeStatus::ClosedManual);
        assert!((closed.realized_pnl - 20.0).abs() < 1e-9);
        match second {
            CloseOutcome::AlreadyClosed(t) => assert_eq!(t.exit_price, Some(102.0)),
            other => panic!("expected AlreadyClosed, got {other:?}"),
        }
        assert!(matches!(
            paper.close_manual(&Uuid::new_v4(), 100.0, now),
            Ok(CloseOutcome::NotFound)
        ));
    }

    // ============================================================================
    // Performance
    // ============================================================================

    #[test]
    fn test_profit_factor_sentinel_and_bucket_split() {
        let (lifecycle, paper) = paper_engine();
        let perf = PerformanceAggregator::new();
        let now = t0();

        let mut candidate = long_signal("BTCUSDT", now);
        candidate.bucket = VolatilityBucket::Low;
        let winner = paper.open(&executed(&lifecycle, candidate, now), now).unwrap();
        let won = paper.close_manual(&winner.id, 101.0, now).unwrap().closed().unwrap();
        assert!(perf.record(&won));

        let g = perf.global();
        assert_eq!(g.wins, 1);
        assert!(g.profit_factor().is_infinite());

        let mut candidate = long_signal("ETHUSDT", now);
        candidate.bucket = VolatilityBucket::High;
        let loser = paper.open(&executed(&lifecycle, candidate, now), now).unwrap();
        let lost = paper.close_manual(&loser.id, 99.5, now).unwrap().closed().unwrap();
        assert!(perf.record(&lost));

        let g = perf.global();
        assert_eq!(g.total_trades, 2);
        assert!((g.profit_factor() - 2.0).abs() < 1e-9);
        assert!((g.net_pnl - 5.0).abs() < 1e-9);

        let buckets: HashMap<_, _> = perf.by_bucket().into_iter().collect();
        assert_eq!(buckets[&VolatilityBucket::Low].wins, 1);
        assert_eq!(buckets[&VolatilityBucket::High].losses, 1);
    }

    // ============================================================================
    // Runtime pipeline
    // ============================================================================

    #[tokio::test]
    async fn test_runtime_full_cycle() {
        let candles = seeded_candles("BTCUSDT");
        let store = Arc::new(InMemoryStore::new());
        let rt = TradingRuntime::new(&config(&["BTCUSDT"]), candles.clone(), store.clone(), store.clone());
        let now = t0() + Duration::hours(62);

        // Pass 1: oversold cross in a MEDIUM market → LONG admitted and opened
        let report = rt.run_signal_pass(now).await;
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(report.opened.len(), 1);
        let signal = report.admitted[0].clone();
        let trade = report.opened[0].clone();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.bucket, VolatilityBucket::Medium);
        assert_eq!(signal.timeframe, Timeframe::Min15);
        assert!((signal.entry_price - 94.1183).abs() < 1e-3);
        assert!((signal.stop_loss - 92.289).abs() < 1e-2);
        assert!((signal.take_profit - 97.167).abs() < 1e-2);
        assert_eq!(trade.originating_signal_ref, Some(signal.id));
        assert_eq!(rt.lifecycle().get(&signal.id).unwrap().state, SignalState::Executed);

        // Pass 2: same setup while the position is open → duplicate
        let report = rt.run_signal_pass(now).await;
        assert_eq!(report.duplicates, 1);
        assert!(report.admitted.is_empty());
        assert_eq!(rt.paper().open_trades().len(), 1);

        // Price falls through the stop
        candles.append(Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::Min1,
            open_time: now,
            open: 94.1,
            high: 94.3,
            low: 92.0,
            close: 92.5,
            volume: 1.0,
        });
        let closed = rt.run_monitor_pass(now + Duration::minutes(1)).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, TradeStatus::ClosedLoss);
        assert_eq!(closed[0].close_reason, Some(CloseReason::StopLoss));
        assert!(closed[0].realized_pnl < 0.0);
        assert!(rt.run_monitor_pass(now + Duration::minutes(1)).await.is_empty());

        let perf = rt.performance().global();
        assert_eq!(perf.total_trades, 1);
        assert_eq!(perf.losses, 1);
        assert_eq!(perf.profit_factor(), 0.0);
        assert!(rt.lifecycle().get(&signal.id).unwrap().is_terminal());

        // Key released: the next pass may admit again
        let report = rt.run_signal_pass(now + Duration::minutes(1)).await;
        assert_eq!(report.admitted.len(), 1);
        assert_ne!(report.admitted[0].id, signal.id);
    }

    #[tokio::test]
    async fn test_trade_survives_signal_purge() {
        let candles = seeded_candles("BTCUSDT");
        let store = Arc::new(InMemoryStore::new());
        let rt = TradingRuntime::new(&config(&["BTCUSDT"]), candles, store.clone(), store.clone());
        let now = t0() + Duration::hours(62);

        let report = rt.run_signal_pass(now).await;
        let signal = report.admitted[0].clone();
        let trade = report.opened[0].clone();
        rt.close_trade(&trade.id, Some(95.0), now).await.unwrap();

        assert_eq!(rt.lifecycle().origin_of(&trade).map(|s| s.id), Some(signal.id));

        let purge_at = signal.expires_at
            + Duration::seconds(rt.lifecycle().config().retention_grace_secs as i64)
            + Duration::seconds(1);
        let purged = rt.run_retention_pass(purge_at);
        assert_eq!(purged, vec![signal.id]);
        assert!(rt.lifecycle().get(&signal.id).is_none());
        assert!(rt.lifecycle().origin_of(&trade).is_none());

        let kept = rt.paper().get_trade(&trade.id).unwrap();
        assert_eq!(kept.status, TradeStatus::ClosedManual);
        assert_eq!(kept.originating_signal_ref, Some(signal.id));
        assert_eq!(rt.performance().global().total_trades, 1);
    }

    #[tokio::test]
    async fn test_auto_execute_disabled_leaves_signal_active() {
        let mut cfg = config(&["BTCUSDT"]);
        cfg.engine.auto_execute = false;
        let store = Arc::new(InMemoryStore::new());
        let rt = TradingRuntime::new(&cfg, seeded_candles("BTCUSDT"), store.clone(), store.clone());
        let now = t0() + Duration::hours(62);

        let report = rt.run_signal_pass(now).await;
        assert_eq!(report.admitted.len(), 1);
        assert!(report.opened.is_empty());
        let signal = &report.admitted[0];
        assert_eq!(signal.state, SignalState::Active);

        let trade = rt.execute_signal(&signal.id, now).unwrap();
        assert_eq!(trade.entry_price, signal.entry_price);
        // A second execution loses the race
        assert!(rt.execute_signal(&signal.id, now).is_err());
    }

    #[tokio::test]
    async fn test_csv_candles_feed_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let csv = CsvCandleStore::new(dir.path());
        let closes = oversold_closes();
        for tf in [Timeframe::Min15, Timeframe::Hour1] {
            CsvCandleStore::write_series(&csv.path_for("ETHUSDT", tf), &series("ETHUSDT", tf, &closes))
                .unwrap();
        }

        let store = Arc::new(InMemoryStore::new());
        let rt = TradingRuntime::new(&config(&["ETHUSDT", "XRPUSDT"]), Arc::new(csv), store.clone(), store.clone());
        let report = rt.run_signal_pass(t0() + Duration::hours(62)).await;
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.opened.len(), 1);
        assert_eq!(report.opened[0].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_store_failures_skip_symbol() {
        let mut mock = MockCandles::new();
        mock.expect_get_candles()
            .withf(|symbol, _, _| symbol == "BTCUSDT")
            .returning(|symbol, _, _| {
                Err(EngineError::DataUnavailable {
                    symbol: symbol.to_string(),
                    reason: "feed offline".to_string(),
                })
            });
        mock.expect_get_candles()
            .withf(|symbol, _, _| symbol == "ETHUSDT")
            .returning(|_, _, _| {
                Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "denied",
                )))
            });

        let store = Arc::new(InMemoryStore::new());
        let rt = TradingRuntime::new(&config(&["BTCUSDT", "ETHUSDT"]), Arc::new(mock), store.clone(), store.clone());
        let report = rt.run_signal_pass(t0()).await;
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.skipped, 2);
        assert!(report.admitted.is_empty());
        assert!(rt.lifecycle().live_signals().is_empty());
    }

    #[tokio::test]
    async fn test_not_ready_produces_no_signal() {
        let candles = Arc::new(InMemoryCandleStore::new());
        let closes = oversold_closes();
        candles.extend(series("BTCUSDT", Timeframe::Min15, &closes));
        // 1h history too short for ADX
        candles.extend(series("BTCUSDT", Timeframe::Hour1, &closes[..20]));

        let store = Arc::new(InMemoryStore::new());
        let rt = TradingRuntime::new(&config(&["BTCUSDT"]), candles, store.clone(), store.clone());
        let report = rt.run_signal_pass(t0() + Duration::hours(62)).await;
        assert_eq!(report.not_ready, 1);
        assert!(report.admitted.is_empty());
        assert!(rt.paper().trades().is_empty());
    }
}
