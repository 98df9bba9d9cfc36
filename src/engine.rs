use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;

use crate::api::{AlertSink, BarFeed, MarketData};
use crate::config::Settings;
use crate::execution::{InstrumentRepository, TradeLifecycleManager};
use crate::models::{Bar, Side};
use crate::persistence::{InstrumentMap, StateStore};
use crate::strategy::{ExtremumTracker, RollingStatsTracker, SignalDetector};
use crate::Result;

/// Wires the feed, trackers, detector and lifecycle manager together
///
/// Bars for one instrument are handled strictly in arrival order by a
/// dedicated worker; instruments never wait on each other.
pub struct Engine {
    settings: Settings,
    repo: InstrumentRepository,
    extremum: ExtremumTracker,
    detector: SignalDetector,
    stats: Arc<RollingStatsTracker>,
    lifecycle: Arc<TradeLifecycleManager>,
    feed: Arc<dyn BarFeed>,
    alerts: Arc<dyn AlertSink>,
    store: Arc<dyn StateStore>,
}

impl Engine {
    /// Build every component from settings and restore persisted state
    ///
    /// An unreadable store is logged and the bot starts fresh.
    pub async fn bootstrap(
        settings: Settings,
        market: Arc<dyn MarketData>,
        feed: Arc<dyn BarFeed>,
        alerts: Arc<dyn AlertSink>,
        store: Arc<dyn StateStore>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let normalization = settings.volume_normalization()?;

        let loaded = store.load().await.unwrap_or_else(|e| {
            tracing::warn!("⚠️  Could not load instrument state, starting fresh: {}", e);
            InstrumentMap::new()
        });
        let cumulative_pnl = store.load_pnl().await.unwrap_or_else(|e| {
            tracing::warn!("⚠️  Could not load cumulative PnL, starting at 0: {}", e);
            0.0
        });

        let repo = InstrumentRepository::new(&settings.universe, loaded);

        let stats = Arc::new(RollingStatsTracker::new(
            market.clone(),
            repo.clone(),
            store.clone(),
            settings.stats.interval.clone(),
            settings.stats.periods,
            normalization,
        ));

        let lifecycle = Arc::new(TradeLifecycleManager::new(
            settings.strategy.clone(),
            repo.clone(),
            market,
            alerts.clone(),
            store.clone(),
            cumulative_pnl,
        ));

        tracing::info!("\n📊 Configuration:");
        tracing::info!("  Instruments: {}", settings.universe.len());
        tracing::info!("  Bar interval: {}", settings.bar_interval);
        tracing::info!(
            "  Volume average: {} x {} (normalization {})",
            settings.stats.periods,
            settings.stats.interval,
            normalization
        );
        tracing::info!(
            "  TP/SL: +{}% / -{}%, max hold {}s",
            settings.strategy.take_profit_pct,
            settings.strategy.stop_loss_pct,
            settings.strategy.max_hold_secs
        );
        tracing::info!("  Cumulative PnL: {:+.2}%", cumulative_pnl);

        Ok(Arc::new(Self {
            extremum: ExtremumTracker::new(settings.strategy.clone()),
            detector: SignalDetector::new(settings.strategy.clone()),
            settings,
            repo,
            stats,
            lifecycle,
            feed,
            alerts,
            store,
        }))
    }

    pub fn repository(&self) -> &InstrumentRepository {
        &self.repo
    }

    pub fn lifecycle(&self) -> &Arc<TradeLifecycleManager> {
        &self.lifecycle
    }

    pub fn stats(&self) -> &Arc<RollingStatsTracker> {
        &self.stats
    }

    /// Feed one live bar through exits, break tracking and entry detection
    ///
    /// Returns the side of a position opened on this bar.
    pub async fn process_bar(&self, bar: Bar) -> Result<Option<Side>> {
        self.lifecycle.exit_on_bar(&bar).await;

        let accepting = !self.lifecycle.scheduler().is_closed();
        let (entry, spike, dirty) = self.repo.update(&bar.symbol, |state| {
            // fresh breaks are visible to the detector before stale ones are dropped
            let marked = self.extremum.mark_breaks(&mut state.extremum, &bar);
            let (signal, spike) = if accepting {
                (
                    self.detector.evaluate(state, &bar),
                    self.detector.volume_spike(state, &bar),
                )
            } else {
                (None, None)
            };
            let settled = self.extremum.settle(&mut state.extremum, &bar);

            let entry = signal.map(|side| {
                TradeLifecycleManager::open_position(state, side, bar.close, bar.close_time)
            });
            let dirty = marked.merge(settled).is_dirty() || spike.is_some();
            (entry, spike, dirty)
        })?;

        if let Some(pressure) = spike {
            let share = if bar.volume > 0.0 {
                bar.buy_volume / bar.volume * 100.0
            } else {
                0.0
            };
            self.alerts.notify(
                &format!(
                    "{} {} @ {} | quote volume {:.0} | taker buy {:.0}%",
                    pressure, bar.symbol, bar.close, bar.quote_volume, share
                ),
                false,
            );
        }

        match entry.transpose() {
            Ok(Some(position)) => {
                self.lifecycle.on_entered(&bar.symbol, &position).await;
                Ok(Some(position.side))
            }
            Ok(None) => {
                if dirty {
                    if let Err(e) = self.lifecycle.persist().await {
                        tracing::warn!("Failed to persist {} levels: {}", bar.symbol, e);
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run until `shutdown` resolves or the feed ends, then shut down in order
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        let resumed = self.lifecycle.resume_open_positions();
        if resumed > 0 {
            tracing::info!("♻️  Resumed {} open positions", resumed);
        }

        let stats_task = {
            let stats = self.stats.clone();
            let every = Duration::from_secs(self.settings.stats.refresh_secs);
            tokio::spawn(stats.run(every))
        };

        let bars = match self
            .feed
            .subscribe(&self.settings.universe, &self.settings.bar_interval)
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                self.shutdown(stats_task, None).await;
                return Err(e);
            }
        };
        tracing::info!(
            "✅ Subscribed to {} {} streams",
            self.settings.universe.len(),
            self.settings.bar_interval
        );

        let mut dispatch_task = tokio::spawn(self.clone().dispatch(bars));

        tokio::select! {
            _ = shutdown => {
                tracing::info!("⚠️  Shutdown requested");
            }
            result = &mut dispatch_task => {
                tracing::error!("Bar feed ended: {:?}", result);
            }
        }

        self.shutdown(stats_task, Some(dispatch_task)).await;
        Ok(())
    }

    /// Route bars to one ordered worker per instrument
    async fn dispatch(self: Arc<Self>, mut bars: mpsc::Receiver<Bar>) {
        let mut workers = JoinSet::new();
        let mut queues: HashMap<String, mpsc::UnboundedSender<Bar>> = HashMap::new();

        while let Some(bar) = bars.recv().await {
            if !self.repo.contains(&bar.symbol) {
                tracing::debug!(symbol = %bar.symbol, "Dropping bar outside the universe");
                continue;
            }

            let queue = queues.entry(bar.symbol.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                workers.spawn(self.clone().worker(bar.symbol.clone(), rx));
                tx
            });
            if queue.send(bar).is_err() {
                tracing::error!("❌ Worker queue closed unexpectedly");
            }
        }

        // feed closed: let workers drain what they have
        drop(queues);
        while workers.join_next().await.is_some() {}
    }

    async fn worker(self: Arc<Self>, symbol: String, mut bars: mpsc::UnboundedReceiver<Bar>) {
        tracing::debug!(symbol = %symbol, "Worker started");
        while let Some(bar) = bars.recv().await {
            if let Err(e) = self.process_bar(bar).await {
                tracing::warn!("Bar for {} skipped: {}", symbol, e);
            }
        }
    }

    /// Stop intake, cancel timers and exit checks, flush, then close the store
    async fn shutdown(&self, stats_task: JoinHandle<()>, dispatch_task: Option<JoinHandle<()>>) {
        if let Some(dispatch) = dispatch_task {
            dispatch.abort();
            let _ = dispatch.await;
        }
        stats_task.abort();
        let _ = stats_task.await;

        self.lifecycle.shutdown();

        // an exit check aborted mid-write leaves the counter unsaved
        if let Err(e) = self.lifecycle.persist().await {
            tracing::warn!("Final state flush failed: {}", e);
        }
        self.store.close();

        tracing::info!(
            "👋 Stopped | open positions: {} | cumulative PnL {:+.2}%",
            self.repo.open_positions().len(),
            self.lifecycle.cumulative_pnl()
        );
    }
}
