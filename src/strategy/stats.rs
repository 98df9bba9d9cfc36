use chrono::{Timelike, Utc};
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::api::MarketData;
use crate::execution::InstrumentRepository;
use crate::models::Bar;
use crate::persistence::StateStore;
use crate::Result;

/// Mean quote volume of completed bars, scaled to one live bar
///
/// `normalization` is how many live bars fit into one historical bar, so the
/// result is directly comparable with a live bar's quote volume. Bars still
/// forming are ignored. `None` when no completed bar is available.
pub fn average_volume(bars: &[Bar], normalization: f64) -> Option<f64> {
    let completed: Vec<&Bar> = bars.iter().filter(|b| b.is_final).collect();
    if completed.is_empty() || normalization <= 0.0 {
        return None;
    }
    let sum: f64 = completed.iter().map(|b| b.quote_volume).sum();
    Some(sum / completed.len() as f64 / normalization)
}

/// Outcome of one refresh pass over the universe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshSummary {
    pub updated: usize,
    pub failed: usize,
}

/// Keeps `avg_volume` of every instrument up to date from historical bars
pub struct RollingStatsTracker {
    market: Arc<dyn MarketData>,
    repo: InstrumentRepository,
    store: Arc<dyn StateStore>,
    interval: String,
    periods: u32,
    normalization: f64,
}

impl RollingStatsTracker {
    pub fn new(
        market: Arc<dyn MarketData>,
        repo: InstrumentRepository,
        store: Arc<dyn StateStore>,
        interval: impl Into<String>,
        periods: u32,
        normalization: f64,
    ) -> Self {
        Self {
            market,
            repo,
            store,
            interval: interval.into(),
            periods,
            normalization,
        }
    }

    /// Recompute the average for one instrument and store it
    pub async fn refresh(&self, symbol: &str) -> Result<f64> {
        // one extra row: the newest kline is the one still forming
        let mut bars = self
            .market
            .fetch_bars(symbol, &self.interval, self.periods + 1)
            .await?;
        bars.retain(|b| b.is_final);
        if bars.len() > self.periods as usize {
            bars.drain(..bars.len() - self.periods as usize);
        }

        let avg = average_volume(&bars, self.normalization).ok_or_else(|| {
            crate::BotError::Data(format!("no completed {} bars for {}", self.interval, symbol))
        })?;

        self.repo.update(symbol, |state| state.avg_volume = Some(avg))?;
        tracing::debug!(symbol, avg_volume = avg, bars = bars.len(), "Refreshed average volume");
        Ok(avg)
    }

    /// Refresh every instrument; one failure never stops the batch
    pub async fn refresh_all(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        for symbol in self.repo.symbols() {
            match self.refresh(&symbol).await {
                Ok(_) => summary.updated += 1,
                Err(e) => {
                    tracing::error!("❌ Error refreshing volume for {}: {}", symbol, e);
                    summary.failed += 1;
                }
            }
        }

        if let Err(e) = self.store.save(&self.repo.snapshot()).await {
            tracing::warn!("Failed to persist volume refresh: {}", e);
        }

        let (up, down) = self.repo.breadth();
        tracing::info!(
            "✅ Volume refresh: {} updated, {} failed | breaks up: {} down: {}",
            summary.updated,
            summary.failed,
            up,
            down
        );

        summary
    }

    /// Refresh now, then every `every`, first timed tick on a clock-minute boundary
    pub async fn run(self: Arc<Self>, every: Duration) {
        self.refresh_all().await;

        let start = next_minute_boundary();
        tracing::info!(
            "Volume refresh scheduled every {:?}, first in {:?}",
            every,
            start - Instant::now()
        );

        let mut ticker = interval_at(start, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.refresh_all().await;
        }
    }
}

/// Instant of the next XX:XX:00 wall-clock boundary
fn next_minute_boundary() -> Instant {
    let seconds_until_next = 60 - Utc::now().second() as u64;
    Instant::now() + Duration::from_secs(seconds_until_next)
}
