//! Append-only CSV journal of closed paper trades

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;

use crate::types::PaperTrade;

/// One closed trade, flattened for CSV
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeJournalRecord {
    pub closed_at: i64,
    pub trade_id: String,
    pub symbol: String,
    pub direction: String,
    pub bucket: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub position_size: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub status: String,
    pub close_reason: String,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub opened_at: i64,
    #[serde(default)]
    pub signal_ref: Option<String>,
}

impl From<&PaperTrade> for TradeJournalRecord {
    fn from(trade: &PaperTrade) -> Self {
        Self {
            closed_at: trade
                .closed_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_default(),
            trade_id: trade.id.to_string(),
            symbol: trade.symbol.clone(),
            direction: trade.direction.to_string(),
            bucket: trade.bucket.to_string(),
            entry_price: trade.entry_price,
            exit_price: trade.exit_price.unwrap_or(trade.entry_price),
            position_size: trade.position_size,
            quantity: trade.quantity,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            status: trade.status.to_string(),
            close_reason: trade
                .close_reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
            realized_pnl: trade.realized_pnl,
            fees_paid: trade.fees_paid,
            opened_at: trade.opened_at.timestamp_millis(),
            signal_ref: trade.originating_signal_ref.map(|id| id.to_string()),
        }
    }
}

/// Writes `<data_dir>/trades/paper_trades.csv`
pub struct CsvTradeJournal {
    path: PathBuf,
    writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
}

impl CsvTradeJournal {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("trades");
        fs::create_dir_all(&dir).context("Failed to create trades directory")?;
        let path = dir.join("paper_trades.csv");

        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open trade journal")?;
        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(Self {
            path,
            writer: Arc::new(AsyncRwLock::new(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, trade: &PaperTrade) -> Result<()> {
        let mut writer = self.writer.write().await;
        writer
            .serialize(TradeJournalRecord::from(trade))
            .context("Failed to write trade record")?;
        writer.flush().context("Failed to flush trade journal")?;
        Ok(())
    }

    /// Read every journaled trade, oldest close first
    pub fn load(&self) -> Result<Vec<TradeJournalRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path).context("Failed to open trade journal")?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: TradeJournalRecord =
                result.context("Failed to deserialize trade record")?;
            records.push(record);
        }
        records.sort_by_key(|r| r.closed_at);
        Ok(records)
    }
}
