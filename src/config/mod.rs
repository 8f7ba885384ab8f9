//! Configuration management for VolPaper
//!
//! Loads from TOML/YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

use crate::indicators::IndicatorConfig;
use crate::lifecycle::LifecycleConfig;
use crate::paper_trading::PaperTradingConfig;
use crate::strategy::StrategyConfig;
use crate::types::{Timeframe, MAX_CONFIG_SECS};
use crate::volatility::VolatilityConfig;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub indicators: IndicatorConfig,
    pub volatility: VolatilityConfig,
    pub strategy: StrategyConfig,
    pub lifecycle: LifecycleConfig,
    pub paper_trading: PaperTradingConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Symbols to evaluate each tick
    pub symbols: Vec<String>,
    /// Seconds between ticks
    pub tick_interval_secs: u64,
    /// Candles requested per symbol/timeframe
    pub candle_lookback: usize,
    /// Timeframe whose latest candle feeds the monitor and lifecycle passes
    pub monitor_timeframe: Timeframe,
    /// Series the volatility classifier scores
    pub volatility_timeframe: Timeframe,
    /// Open a paper trade as soon as a signal is admitted
    pub auto_execute: bool,
    /// Seconds between performance summaries (0 = never)
    pub summary_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            tick_interval_secs: 60,
            candle_lookback: 200,
            monitor_timeframe: Timeframe::Min1,
            volatility_timeframe: Timeframe::Hour1,
            auto_execute: true,
            summary_interval_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Root for candles/, trades/ and the state file
    pub data_dir: String,
    /// Append closed trades to trades/paper_trades.csv
    pub journal_enabled: bool,
}

impl PersistenceConfig {
    pub fn candles_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("candles")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl AppConfig {
    /// Builder preloaded with every default
    fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            .set_default("engine.symbols", vec!["BTCUSDT", "ETHUSDT"])?
            .set_default("engine.tick_interval_secs", 60)?
            .set_default("engine.candle_lookback", 200)?
            .set_default("engine.monitor_timeframe", "1m")?
            .set_default("engine.volatility_timeframe", "1h")?
            .set_default("engine.auto_execute", true)?
            .set_default("engine.summary_interval_secs", 900)?
            // Indicators
            .set_default("indicators.rsi_period", 14)?
            .set_default("indicators.adx_period", 14)?
            .set_default("indicators.atr_period", 14)?
            // Volatility
            .set_default("volatility.low_threshold", 0.005)?
            .set_default("volatility.high_threshold", 0.015)?
            .set_default("volatility.window", 20)?
            .set_default("volatility.atr_period", 14)?
            .set_default("volatility.refresh_secs", 900)?
            .set_default("volatility.method", "atr_ratio")?
            .set_default("volatility.profiles.low.rsi_oversold", 30.0)?
            .set_default("volatility.profiles.low.rsi_overbought", 70.0)?
            .set_default("volatility.profiles.low.adx_max", 20.0)?
            .set_default("volatility.profiles.low.stop_atr_multiple", 1.0)?
            .set_default("volatility.profiles.low.target_atr_multiple", 1.5)?
            .set_default("volatility.profiles.medium.rsi_oversold", 30.0)?
            .set_default("volatility.profiles.medium.rsi_overbought", 70.0)?
            .set_default("volatility.profiles.medium.adx_max", 25.0)?
            .set_default("volatility.profiles.medium.stop_atr_multiple", 1.5)?
            .set_default("volatility.profiles.medium.target_atr_multiple", 2.5)?
            .set_default("volatility.profiles.high.rsi_oversold", 25.0)?
            .set_default("volatility.profiles.high.rsi_overbought", 75.0)?
            .set_default("volatility.profiles.high.adx_max", 30.0)?
            .set_default("volatility.profiles.high.stop_atr_multiple", 2.0)?
            .set_default("volatility.profiles.high.target_atr_multiple", 3.5)?
            // Strategy
            .set_default("strategy.timeframes", vec!["15m", "1h"])?
            .set_default("strategy.require_cross", true)?
            .set_default("strategy.rsi_weight", 0.6)?
            .set_default("strategy.multi_tf_bonus", 0.06)?
            .set_default("strategy.min_confidence", 0.0)?
            .set_default("strategy.scalp_max_timeframe", "15m")?
            .set_default("strategy.day_max_timeframe", "4h")?
            .set_default("strategy.promote_target_pct", 0.03)?
            .set_default("strategy.validity.scalp_secs", 2 * 60 * 60)?
            .set_default("strategy.validity.day_secs", 24 * 60 * 60)?
            .set_default("strategy.validity.swing_secs", 7 * 24 * 60 * 60)?
            // Lifecycle
            .set_default("lifecycle.retention_grace_secs", 24 * 60 * 60)?
            // Paper trading
            .set_default("paper_trading.sizing.policy", "fixed_notional")?
            .set_default("paper_trading.sizing.notional", 1000.0)?
            .set_default("paper_trading.fee_bps", 0.0)?
            .set_default("paper_trading.tie_break", "adverse_first")?
            .set_default("paper_trading.state_file", "./data/paper_state.json")?
            // Persistence
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.journal_enabled", true)?
            // Logging
            .set_default("logging.json", false)?
            .set_default("logging.level", "info")?;
        Ok(builder)
    }

    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (VOLPAPER__*)
            .add_source(Environment::with_prefix("VOLPAPER").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    /// Defaults only, no files or environment
    pub fn default_config() -> Result<Self> {
        let config = Self::defaults()?
            .build()
            .context("Failed to build configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.symbols.is_empty() {
            bail!("engine.symbols must not be empty");
        }
        if self.engine.tick_interval_secs == 0 {
            bail!("engine.tick_interval_secs must be positive");
        }
        if self.strategy.timeframes.is_empty() {
            bail!("strategy.timeframes must not be empty");
        }
        if self.indicators.rsi_period == 0
            || self.indicators.adx_period == 0
            || self.indicators.atr_period == 0
        {
            bail!("indicator periods must be positive");
        }
        let required = self
            .indicators
            .required_candles()
            .max(self.volatility.required_candles());
        if self.engine.candle_lookback < required {
            bail!(
                "engine.candle_lookback ({}) is below the {} candles indicators need",
                self.engine.candle_lookback,
                required
            );
        }
        if !(0.0..=1.0).contains(&self.strategy.rsi_weight) {
            bail!("strategy.rsi_weight must be within [0, 1]");
        }
        if self.paper_trading.fee_bps < 0.0 {
            bail!("paper_trading.fee_bps must not be negative");
        }
        let validity = &self.strategy.validity;
        for (key, secs) in [
            ("strategy.validity.scalp_secs", validity.scalp_secs),
            ("strategy.validity.day_secs", validity.day_secs),
            ("strategy.validity.swing_secs", validity.swing_secs),
            ("lifecycle.retention_grace_secs", self.lifecycle.retention_grace_secs),
            ("volatility.refresh_secs", self.volatility.refresh_secs),
            ("engine.tick_interval_secs", self.engine.tick_interval_secs),
        ] {
            if secs > MAX_CONFIG_SECS {
                bail!("{key} ({secs}) exceeds the {MAX_CONFIG_SECS}s ceiling");
            }
        }
        self.volatility.validate()?;
        Ok(())
    }

    pub fn state_file(&self) -> Option<PathBuf> {
        self.paper_trading.state_file.as_ref().map(PathBuf::from)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "symbols={:?} timeframes={:?} tick={}s vol_thresholds={:.4}/{:.4} sizing={:?} tie_break={:?}",
            self.engine.symbols,
            self.strategy
                .timeframes
                .iter()
                .map(|tf| tf.to_string())
                .collect::<Vec<_>>(),
            self.engine.tick_interval_secs,
            self.volatility.low_threshold,
            self.volatility.high_threshold,
            self.paper_trading.sizing,
            self.paper_trading.tie_break,
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
