use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::api::{AlertSink, MarketData};
use crate::config::StrategyConfig;
use crate::error::BotError;
use crate::execution::{ExitScheduler, InstrumentRepository};
use crate::models::{Bar, ClosedTrade, ExitReason, InstrumentState, Position, Side, SignalState};
use crate::persistence::StateStore;
use crate::Result;

/// Percent PnL of a position closed at `exit_price`, before fees
pub fn pnl_pct(side: Side, entry_price: f64, exit_price: f64) -> f64 {
    match side {
        Side::Long => (exit_price - entry_price) / entry_price * 100.0,
        Side::Short => (entry_price - exit_price) / entry_price * 100.0,
    }
}

/// What one exit check did
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Closed(ClosedTrade),
    /// No exit condition met yet
    Holding,
    NoPosition,
    /// Price lookup failed; the position is untouched
    PriceUnavailable,
    /// Shutdown started, nothing was mutated
    Cancelled,
}

/// Owns every position from entry to exit
///
/// Positions live inside the instrument records and are only mutated here,
/// under the instrument lock. Exit checks run as one scheduled task per
/// instrument that polls until an exit condition fires.
pub struct TradeLifecycleManager {
    config: StrategyConfig,
    repo: InstrumentRepository,
    market: Arc<dyn MarketData>,
    alerts: Arc<dyn AlertSink>,
    store: Arc<dyn StateStore>,
    scheduler: ExitScheduler,
    cumulative_pnl: Mutex<f64>,
    /// Held across one snapshot-and-write so writes land in lock order
    persist_lock: tokio::sync::Mutex<()>,
}

impl TradeLifecycleManager {
    pub fn new(
        config: StrategyConfig,
        repo: InstrumentRepository,
        market: Arc<dyn MarketData>,
        alerts: Arc<dyn AlertSink>,
        store: Arc<dyn StateStore>,
        cumulative_pnl: f64,
    ) -> Self {
        Self {
            config,
            repo,
            market,
            alerts,
            store,
            scheduler: ExitScheduler::new(),
            cumulative_pnl: Mutex::new(cumulative_pnl),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> &ExitScheduler {
        &self.scheduler
    }

    /// Running PnL in percent, fees included
    pub fn cumulative_pnl(&self) -> f64 {
        *self.cumulative_pnl.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the instrument map and the running PnL as they are now
    ///
    /// Both values are read after the writer lock is taken, so the last
    /// write to land always carries the newest state.
    pub async fn persist(&self) -> Result<()> {
        let _writer = self.persist_lock.lock().await;
        let instruments = self.store.save(&self.repo.snapshot()).await;
        let pnl = self.store.save_pnl(self.cumulative_pnl()).await;
        instruments.and(pnl)
    }

    /// Record a new position on an instrument the caller has locked
    ///
    /// Fails if the instrument already holds one.
    pub fn open_position(
        state: &mut InstrumentState,
        side: Side,
        price: f64,
        time: DateTime<Utc>,
    ) -> Result<Position> {
        if state.has_open_position() {
            return Err(BotError::PositionAlreadyOpen(state.symbol.clone()));
        }

        let position = Position {
            id: Uuid::new_v4(),
            side,
            entry_price: price,
            entry_time: time,
        };
        state.position = Some(position.clone());
        state.last_entry_time = Some(time);
        state.signal = SignalState::EntrySignaled;
        Ok(position)
    }

    /// Open a position and start watching it
    pub async fn enter(
        self: &Arc<Self>,
        symbol: &str,
        side: Side,
        price: f64,
        time: DateTime<Utc>,
    ) -> Result<Position> {
        let position = self
            .repo
            .update(symbol, |state| Self::open_position(state, side, price, time))??;
        self.on_entered(symbol, &position).await;
        Ok(position)
    }

    /// Notify, persist and schedule the first exit check for a fresh position
    pub async fn on_entered(self: &Arc<Self>, symbol: &str, position: &Position) {
        tracing::info!(
            symbol,
            id = %position.id,
            "📈 Opened {} @ {:.6}",
            position.side,
            position.entry_price
        );
        self.alerts.notify(
            &format!("{} {} @ {}", position.side, symbol, position.entry_price),
            false,
        );

        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to persist entry for {}: {}", symbol, e);
        }

        if !self.schedule_exit_check(symbol, self.config.first_check_delay()) {
            tracing::warn!("Exit check for {} not scheduled, shutting down", symbol);
        }
    }

    /// Replace any outstanding exit check for `symbol` with one due after `delay`
    pub fn schedule_exit_check(self: &Arc<Self>, symbol: &str, delay: Duration) -> bool {
        let manager = Arc::clone(self);
        let owned = symbol.to_string();
        self.scheduler
            .schedule(symbol, async move { manager.exit_check_loop(owned, delay).await })
    }

    /// Check, and keep checking every `retry_interval` until the position is gone
    async fn exit_check_loop(self: Arc<Self>, symbol: String, delay: Duration) {
        tokio::time::sleep(delay).await;

        loop {
            match self.check_exit(&symbol, Utc::now()).await {
                CheckOutcome::Holding | CheckOutcome::PriceUnavailable => {
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
                CheckOutcome::Closed(_) | CheckOutcome::NoPosition | CheckOutcome::Cancelled => {
                    return;
                }
            }
        }
    }

    /// Exit reason for `position` at `price` and `now`, if any
    pub fn evaluate_exit(
        &self,
        position: &Position,
        price: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        let pnl = pnl_pct(position.side, position.entry_price, price);

        if pnl >= self.config.take_profit_pct {
            return Some(ExitReason::TakeProfit);
        }
        if pnl <= -self.config.stop_loss_pct {
            return Some(ExitReason::StopLoss);
        }
        if now - position.entry_time >= self.config.max_hold() {
            return Some(ExitReason::TimeStop);
        }
        None
    }

    /// One exit check against the current market price
    pub async fn check_exit(&self, symbol: &str, now: DateTime<Utc>) -> CheckOutcome {
        let Some(position) = self.repo.get(symbol).and_then(|s| s.position) else {
            return CheckOutcome::NoPosition;
        };

        let price = match self.market.get_price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!("⚠️  Price unavailable for {}, retrying: {}", symbol, e);
                return CheckOutcome::PriceUnavailable;
            }
        };

        let outcome = self.repo.update(symbol, |state| {
            if self.scheduler.is_closed() {
                return CheckOutcome::Cancelled;
            }
            if state.position.as_ref().map(|p| p.id) != Some(position.id) {
                return CheckOutcome::NoPosition;
            }
            match self.evaluate_exit(&position, price, now) {
                Some(reason) => self
                    .close_locked(state, price, reason)
                    .map_or(CheckOutcome::NoPosition, CheckOutcome::Closed),
                None => CheckOutcome::Holding,
            }
        });

        match outcome {
            Ok(CheckOutcome::Closed(trade)) => {
                self.after_exit(&trade).await;
                CheckOutcome::Closed(trade)
            }
            Ok(CheckOutcome::Holding) => {
                tracing::debug!(
                    symbol,
                    price,
                    pnl = pnl_pct(position.side, position.entry_price, price),
                    "Holding"
                );
                CheckOutcome::Holding
            }
            Ok(other) => other,
            Err(e) => {
                tracing::error!("❌ Exit check for {} failed: {}", symbol, e);
                CheckOutcome::NoPosition
            }
        }
    }

    /// Evaluate exits against a live bar close
    ///
    /// Only active with `exit_on_bar_close`. A close here cancels the
    /// scheduled check for the instrument.
    pub async fn exit_on_bar(&self, bar: &Bar) -> Option<ClosedTrade> {
        if !self.config.exit_on_bar_close {
            return None;
        }

        let trade = self
            .repo
            .update(&bar.symbol, |state| {
                if self.scheduler.is_closed() {
                    return None;
                }
                let reason = self.evaluate_exit(state.position.as_ref()?, bar.close, bar.close_time)?;
                self.close_locked(state, bar.close, reason)
            })
            .ok()
            .flatten()?;

        self.scheduler.cancel(&bar.symbol);
        self.after_exit(&trade).await;
        Some(trade)
    }

    /// Close the position on a locked instrument
    fn close_locked(
        &self,
        state: &mut InstrumentState,
        price: f64,
        reason: ExitReason,
    ) -> Option<ClosedTrade> {
        let position = state.position.take()?;
        let pnl = pnl_pct(position.side, position.entry_price, price);

        let cumulative_pnl_pct = {
            let mut total = self.cumulative_pnl.lock().unwrap_or_else(|e| e.into_inner());
            *total += pnl - self.config.fee_pct;
            *total
        };
        state.signal = SignalState::NoSignal;

        Some(ClosedTrade {
            symbol: state.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price: price,
            pnl_pct: pnl,
            reason,
            cumulative_pnl_pct,
        })
    }

    /// Silent alert plus persistence of the instrument map and counter
    async fn after_exit(&self, trade: &ClosedTrade) {
        let emoji = if trade.pnl_pct >= 0.0 { "✅" } else { "❌" };
        tracing::info!(
            symbol = %trade.symbol,
            "{} Closed {} ({}): {:+.2}% | total {:+.2}%",
            emoji,
            trade.side,
            trade.reason,
            trade.pnl_pct,
            trade.cumulative_pnl_pct
        );
        self.alerts.notify(
            &format!(
                "Closed {} {} @ {} ({}) {:+.2}% | total {:+.2}%",
                trade.side,
                trade.symbol,
                trade.exit_price,
                trade.reason,
                trade.pnl_pct,
                trade.cumulative_pnl_pct
            ),
            true,
        );

        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to persist exit for {}: {}", trade.symbol, e);
        }
    }

    /// Reschedule exit checks for positions restored from the store
    pub fn resume_open_positions(self: &Arc<Self>) -> usize {
        let mut resumed = 0;
        for symbol in self.repo.open_positions() {
            let Some(position) = self.repo.get(&symbol).and_then(|s| s.position) else {
                continue;
            };
            let due = position.entry_time
                + chrono::Duration::seconds(self.config.first_check_delay_secs as i64);
            // overdue checks run immediately
            let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            if self.schedule_exit_check(&symbol, delay) {
                tracing::info!(
                    "Resumed {} position on {}, first check in {:?}",
                    position.side,
                    symbol,
                    delay
                );
                resumed += 1;
            }
        }
        resumed
    }

    /// Stop all exit checks; no position is mutated afterwards
    pub fn shutdown(&self) -> usize {
        let cancelled = self.scheduler.cancel_all();
        tracing::info!("Cancelled {} pending exit checks", cancelled);
        cancelled
    }
}
