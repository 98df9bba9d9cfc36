pub mod binance;
pub mod binance_ws;
pub mod coinmarketcap;
pub mod telegram;

pub use binance::BinanceClient;
pub use binance_ws::BinanceKlineFeed;
pub use coinmarketcap::{CoinMarketCapClient, CoinQuote};
pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::Bar;
use crate::Result;

/// Historical bars and spot price lookups
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Last `count` bars at `interval`, oldest first
    async fn fetch_bars(&self, symbol: &str, interval: &str, count: u32) -> Result<Vec<Bar>>;

    async fn get_price(&self, symbol: &str) -> Result<f64>;
}

/// Live bar subscription
///
/// The returned receiver is unbounded in time. Reconnects are the feed's job;
/// the consumer only sees a stream that pauses and resumes.
#[async_trait]
pub trait BarFeed: Send + Sync {
    async fn subscribe(&self, symbols: &[String], interval: &str) -> Result<mpsc::Receiver<Bar>>;
}

/// Best-effort, fire-and-forget alert delivery
pub trait AlertSink: Send + Sync {
    fn notify(&self, text: &str, silent: bool);
}

/// Alert sink that only writes to the log, used for dry runs
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn notify(&self, text: &str, silent: bool) {
        tracing::info!(silent, "📱 {}", text);
    }
}
