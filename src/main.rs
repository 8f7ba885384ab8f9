//! VolPaper binary
//!
//! Loads configuration, restores state, and runs the signal / paper-trade
//! loop against CSV candle files until Ctrl-C.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use volpaper::config::{AppConfig, LoggingConfig};
use volpaper::persistence::{CsvCandleStore, CsvTradeJournal, InMemoryStore};
use volpaper::runtime::TradingRuntime;
use volpaper::types::SignalState;

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging);

    info!("═══════════════════════════════════════════════════");
    info!("  📈 VolPaper v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════");
    info!(config = %config.digest(), "Configuration loaded");

    let store = Arc::new(InMemoryStore::new());
    let state_file = config.state_file();
    if let Some(ref path) = state_file {
        store
            .load_state(path)
            .with_context(|| format!("Failed to restore state from {}", path.display()))?;
    }

    let candles = Arc::new(CsvCandleStore::new(config.persistence.candles_dir()));
    let mut runtime = TradingRuntime::new(&config, candles, store.clone(), store.clone());
    if config.persistence.journal_enabled {
        let journal = CsvTradeJournal::new(&PathBuf::from(&config.persistence.data_dir))?;
        info!(path = %journal.path().display(), "📒 Trade journal enabled");
        runtime = runtime.with_journal(journal);
    }
    runtime.restore_performance();
    info!(
        active = runtime.lifecycle().signals_in_state(SignalState::Active).len(),
        executed = runtime.lifecycle().signals_in_state(SignalState::Executed).len(),
        open_trades = runtime.paper().open_trades().len(),
        "📂 State restored"
    );

    runtime
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await;

    if let Some(ref path) = state_file {
        if let Err(e) = store.save_state(path) {
            error!(error = %e, "Failed to save state on shutdown");
        }
    }
    info!(summary = %runtime.performance().summary_string(), "👋 VolPaper stopped");
    Ok(())
}
