use chrono::{DateTime, Utc};

use crate::config::StrategyConfig;
use crate::models::{Bar, ExtremumState, Level};

/// What a single bar changed in an [`ExtremumState`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtremumUpdate {
    pub recomputed: bool,
    pub max_changed: bool,
    pub min_changed: bool,
    pub max_break_set: bool,
    pub min_break_set: bool,
    pub max_break_cleared: bool,
    pub min_break_cleared: bool,
}

impl ExtremumUpdate {
    /// Anything worth persisting
    pub fn is_dirty(&self) -> bool {
        self.max_changed
            || self.min_changed
            || self.max_break_set
            || self.min_break_set
            || self.max_break_cleared
            || self.min_break_cleared
    }

    pub fn merge(self, other: ExtremumUpdate) -> ExtremumUpdate {
        ExtremumUpdate {
            recomputed: self.recomputed || other.recomputed,
            max_changed: self.max_changed || other.max_changed,
            min_changed: self.min_changed || other.min_changed,
            max_break_set: self.max_break_set || other.max_break_set,
            min_break_set: self.min_break_set || other.min_break_set,
            max_break_cleared: self.max_break_cleared || other.max_break_cleared,
            min_break_cleared: self.min_break_cleared || other.min_break_cleared,
        }
    }
}

/// True when `candidate` moved away from `current` by more than `threshold_pct` percent
pub fn exceeds_hysteresis(current: f64, candidate: f64, threshold_pct: f64) -> bool {
    if current == 0.0 {
        return candidate != 0.0;
    }
    ((candidate - current) / current).abs() * 100.0 > threshold_pct
}

/// Sliding-window local high/low tracking with breakout timing
///
/// A bar is handled in two steps so a caller can look at fresh break markers
/// before stale ones are dropped: [`mark_breaks`] then [`settle`].
/// [`on_bar`] does both.
///
/// [`mark_breaks`]: ExtremumTracker::mark_breaks
/// [`settle`]: ExtremumTracker::settle
/// [`on_bar`]: ExtremumTracker::on_bar
#[derive(Debug, Clone)]
pub struct ExtremumTracker {
    config: StrategyConfig,
}

impl ExtremumTracker {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn on_bar(&self, state: &mut ExtremumState, bar: &Bar) -> ExtremumUpdate {
        self.mark_breaks(state, bar).merge(self.settle(state, bar))
    }

    /// Record a break when the close leaves the current range
    pub fn mark_breaks(&self, state: &mut ExtremumState, bar: &Bar) -> ExtremumUpdate {
        let mut update = ExtremumUpdate::default();
        let time = bar.close_time;

        if let Some(max) = state.local_max {
            if bar.close > max.price && state.max_break_time.is_none() {
                state.max_break_time = Some(time);
                update.max_break_set = true;
                tracing::debug!(symbol = %bar.symbol, close = bar.close, level = max.price, "Upside break");
            }
        }
        if let Some(min) = state.local_min {
            if bar.close < min.price && state.min_break_time.is_none() {
                state.min_break_time = Some(time);
                update.min_break_set = true;
                tracing::debug!(symbol = %bar.symbol, close = bar.close, level = min.price, "Downside break");
            }
        }

        update
    }

    /// Drop stale breaks, slide the window, maybe recompute levels
    pub fn settle(&self, state: &mut ExtremumState, bar: &Bar) -> ExtremumUpdate {
        let mut update = ExtremumUpdate::default();
        let now = bar.close_time;

        if Self::inside_range(state, bar.close) {
            let confirmation = self.config.confirmation_window();
            if state.max_break_time.is_some_and(|t| now - t > confirmation) {
                state.max_break_time = None;
                update.max_break_cleared = true;
            }
            if state.min_break_time.is_some_and(|t| now - t > confirmation) {
                state.min_break_time = None;
                update.min_break_cleared = true;
            }
        }

        self.push_bar(state, bar.clone());

        if self.should_recompute(state, now) {
            let (max_changed, min_changed) = self.recompute(state, now);
            update.recomputed = true;
            update.max_changed = max_changed;
            update.min_changed = min_changed;
        }

        update
    }

    fn inside_range(state: &ExtremumState, price: f64) -> bool {
        match (state.local_min, state.local_max) {
            (Some(min), Some(max)) => price >= min.price && price <= max.price,
            _ => false,
        }
    }

    /// Append and evict bars older than the horizon, measured from the newest bar
    fn push_bar(&self, state: &mut ExtremumState, bar: Bar) {
        let horizon_start = bar.close_time - self.config.window_horizon();
        state.window.push_back(bar);
        state.bars_since_recompute += 1;

        while state
            .window
            .front()
            .is_some_and(|b| b.close_time < horizon_start)
        {
            state.window.pop_front();
        }
    }

    fn should_recompute(&self, state: &ExtremumState, now: DateTime<Utc>) -> bool {
        if state.window.len() <= self.config.exclude_recent_bars {
            return false;
        }
        match state.last_recompute {
            None => true,
            Some(last) => {
                now - last >= self.config.recompute_interval()
                    || state.bars_since_recompute >= self.config.recompute_bars
            }
        }
    }

    /// Scan the window (minus the newest bars) and apply hysteresis
    ///
    /// Returns whether max and min were replaced.
    fn recompute(&self, state: &mut ExtremumState, now: DateTime<Utc>) -> (bool, bool) {
        state.last_recompute = Some(now);
        state.bars_since_recompute = 0;

        let scan_len = state.window.len() - self.config.exclude_recent_bars;
        let scanned = state.window.iter().take(scan_len);

        let mut candidate_max: Option<Level> = None;
        let mut candidate_min: Option<Level> = None;
        for bar in scanned {
            if candidate_max.map_or(true, |m| bar.high > m.price) {
                candidate_max = Some(Level {
                    price: bar.high,
                    time: bar.open_time,
                });
            }
            if candidate_min.map_or(true, |m| bar.low < m.price) {
                candidate_min = Some(Level {
                    price: bar.low,
                    time: bar.open_time,
                });
            }
        }

        let (Some(candidate_max), Some(candidate_min)) = (candidate_max, candidate_min) else {
            return (false, false);
        };

        let threshold = self.config.hysteresis_pct;
        let replace = |current: Option<Level>, candidate: Level| {
            current.map_or(true, |c| exceeds_hysteresis(c.price, candidate.price, threshold))
        };
        let mut max_changed = replace(state.local_max, candidate_max);
        let mut min_changed = replace(state.local_min, candidate_min);

        let next_max = if max_changed { Some(candidate_max) } else { state.local_max };
        let next_min = if min_changed { Some(candidate_min) } else { state.local_min };

        // a kept level may not cross a replaced one
        let crossed = matches!((next_max, next_min), (Some(max), Some(min)) if max.price < min.price);
        if crossed {
            max_changed = true;
            min_changed = true;
        }

        if max_changed {
            state.local_max = Some(candidate_max);
        }
        if min_changed {
            state.local_min = Some(candidate_min);
        }

        (max_changed, min_changed)
    }
}
