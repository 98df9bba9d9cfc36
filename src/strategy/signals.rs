use chrono::{DateTime, Utc};

use crate::config::StrategyConfig;
use crate::models::{Bar, InstrumentState, Pressure, Side, SignalState};

/// Breakout/reversal entry rules
///
/// Reads the break markers left by the extremum tracker and decides whether
/// the current bar is an entry. Nothing is emitted while a position is open.
#[derive(Debug, Clone)]
pub struct SignalDetector {
    config: StrategyConfig,
}

impl SignalDetector {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    /// Advance the signal state for one bar
    ///
    /// # Arguments
    /// * `state` - Instrument record, already holding this bar's break markers
    /// * `bar` - The live bar; its close time is "now"
    ///
    /// # Returns
    /// The entry side when every condition holds. Break markers are consumed
    /// and the state moves to `EntrySignaled` in that case.
    pub fn evaluate(&self, state: &mut InstrumentState, bar: &Bar) -> Option<Side> {
        if state.has_open_position() {
            return None;
        }

        let now = bar.close_time;
        let ext = &state.extremum;

        let (max_break, min_break) = match (ext.max_break_time, ext.min_break_time) {
            (None, None) => {
                state.signal = SignalState::NoSignal;
                return None;
            }
            (Some(max_break), Some(min_break)) if self.is_reversal(max_break, min_break, now) => {
                (max_break, min_break)
            }
            _ => {
                state.signal = SignalState::BreakoutPending;
                return None;
            }
        };

        if state.signal != SignalState::ReversalConfirmed {
            tracing::debug!(symbol = %bar.symbol, %max_break, %min_break, "Reversal confirmed");
        }
        state.signal = SignalState::ReversalConfirmed;

        let side = self.direction(state, bar, max_break, min_break)?;

        if !self.volume_confirms(state, bar) {
            tracing::debug!(
                symbol = %bar.symbol,
                quote_volume = bar.quote_volume,
                avg_volume = ?state.avg_volume,
                "{} setup rejected by volume gate",
                side
            );
            return None;
        }

        if let Some(last) = state.last_entry_time {
            if now - last < self.config.reentry_cooldown() {
                tracing::debug!(symbol = %bar.symbol, last_entry = %last, "{} setup inside cooldown", side);
                return None;
            }
        }

        state.extremum.max_break_time = None;
        state.extremum.min_break_time = None;
        state.signal = SignalState::EntrySignaled;

        tracing::info!(
            symbol = %bar.symbol,
            close = bar.close,
            quote_volume = bar.quote_volume,
            "🎯 {} entry signal",
            side
        );
        Some(side)
    }

    /// Spike alert for an unusually heavy bar, at most once per cooldown
    ///
    /// Independent of the entry state machine; the direction comes from
    /// the taker buy share of the bar.
    pub fn volume_spike(&self, state: &mut InstrumentState, bar: &Bar) -> Option<Pressure> {
        if !self.config.spike_alerts {
            return None;
        }
        let avg = state.avg_volume?;
        if bar.quote_volume <= avg * self.config.spike_multiplier {
            return None;
        }
        if let Some(last) = state.last_spike_alert {
            if bar.close_time - last < self.config.spike_cooldown() {
                return None;
            }
        }

        state.last_spike_alert = Some(bar.close_time);
        let pressure = Pressure::of(bar);
        tracing::info!(
            symbol = %bar.symbol,
            quote_volume = bar.quote_volume,
            avg_volume = avg,
            "🚨 {} volume spike",
            pressure
        );
        Some(pressure)
    }

    /// Both breaks recent and strictly ordered
    fn is_reversal(&self, max_break: DateTime<Utc>, min_break: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let lookback = self.config.reversal_lookback();
        max_break != min_break && now - max_break <= lookback && now - min_break <= lookback
    }

    fn direction(
        &self,
        state: &InstrumentState,
        bar: &Bar,
        max_break: DateTime<Utc>,
        min_break: DateTime<Utc>,
    ) -> Option<Side> {
        if min_break > max_break {
            // swept the high then the low, now turning back up
            let min = state.extremum.local_min?;
            (bar.close > min.price && bar.close > bar.open).then_some(Side::Long)
        } else {
            let max = state.extremum.local_max?;
            (bar.close < max.price && bar.close < bar.open).then_some(Side::Short)
        }
    }

    fn volume_confirms(&self, state: &InstrumentState, bar: &Bar) -> bool {
        match state.avg_volume {
            Some(avg) => bar.quote_volume > avg * self.config.volume_multiplier,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Level, Position};
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    /// Bar closing at minute `minute`
    fn bar(minute: i64, open: f64, close: f64, quote_volume: f64) -> Bar {
        let high = open.max(close) + 0.5;
        let low = open.min(close) - 0.5;
        Bar::new("ETHUSDT", t(minute - 1), t(minute), open, high, low, close)
            .with_volumes(0.0, 0.0, quote_volume)
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            reversal_lookback_secs: 3600,
            volume_multiplier: 3.0,
            reentry_cooldown_secs: 1200,
            ..Default::default()
        }
    }

    /// Range [90, 100], average volume 100
    fn instrument() -> InstrumentState {
        let mut state = InstrumentState::new("ETHUSDT");
        state.avg_volume = Some(100.0);
        state.extremum.local_max = Some(Level { price: 100.0, time: t(-60) });
        state.extremum.local_min = Some(Level { price: 90.0, time: t(-60) });
        state
    }

    fn with_breaks(max_break: i64, min_break: i64) -> InstrumentState {
        let mut state = instrument();
        state.extremum.max_break_time = Some(t(max_break));
        state.extremum.min_break_time = Some(t(min_break));
        state
    }

    #[test]
    fn test_no_breaks_no_signal() {
        let detector = SignalDetector::new(config());
        let mut state = instrument();

        assert_eq!(detector.evaluate(&mut state, &bar(1, 95.0, 96.0, 1000.0)), None);
        assert_eq!(state.signal, SignalState::NoSignal);
    }

    #[test]
    fn test_single_break_is_pending() {
        let detector = SignalDetector::new(config());
        let mut state = instrument();
        state.extremum.max_break_time = Some(t(0));

        assert_eq!(detector.evaluate(&mut state, &bar(1, 99.0, 101.0, 1000.0)), None);
        assert_eq!(state.signal, SignalState::BreakoutPending);
    }

    #[test]
    fn test_long_after_high_then_low() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(5, 10);

        let side = detector.evaluate(&mut state, &bar(15, 90.5, 92.0, 301.0));

        assert_eq!(side, Some(Side::Long));
        assert_eq!(state.signal, SignalState::EntrySignaled);
        assert!(state.extremum.max_break_time.is_none());
        assert!(state.extremum.min_break_time.is_none());
    }

    #[test]
    fn test_short_after_low_then_high() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(10, 5);

        let side = detector.evaluate(&mut state, &bar(15, 99.5, 98.0, 301.0));

        assert_eq!(side, Some(Side::Short));
    }

    #[test]
    fn test_low_then_high_never_goes_long() {
        let detector = SignalDetector::new(config());
        // min break first, max break later: only a short can follow
        let mut state = with_breaks(10, 5);

        // below local max but rising
        let side = detector.evaluate(&mut state, &bar(15, 96.0, 97.0, 1000.0));

        assert_eq!(side, None);
        assert_eq!(state.signal, SignalState::ReversalConfirmed);
    }

    #[test]
    fn test_long_waits_for_close_above_min() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(5, 10);

        // green bar still below the min
        assert_eq!(detector.evaluate(&mut state, &bar(15, 88.0, 89.5, 1000.0)), None);
        assert_eq!(state.signal, SignalState::ReversalConfirmed);
        // exactly at the min is not above it
        assert_eq!(detector.evaluate(&mut state, &bar(16, 89.0, 90.0, 1000.0)), None);

        assert_eq!(
            detector.evaluate(&mut state, &bar(17, 89.5, 90.5, 1000.0)),
            Some(Side::Long)
        );
    }

    #[test]
    fn test_long_needs_green_bar() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(5, 10);

        assert_eq!(detector.evaluate(&mut state, &bar(15, 93.0, 92.0, 1000.0)), None);
    }

    #[test]
    fn test_volume_gate() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(5, 10);

        // exactly 3x the average does not pass
        assert_eq!(detector.evaluate(&mut state, &bar(15, 90.5, 92.0, 300.0)), None);
        assert!(state.extremum.min_break_time.is_some());

        assert_eq!(
            detector.evaluate(&mut state, &bar(16, 90.5, 92.0, 300.5)),
            Some(Side::Long)
        );
    }

    #[test]
    fn test_unknown_average_blocks_entry() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(5, 10);
        state.avg_volume = None;

        assert_eq!(detector.evaluate(&mut state, &bar(15, 90.5, 92.0, 1e9)), None);
    }

    #[test]
    fn test_stale_break_outside_lookback() {
        let detector = SignalDetector::new(config());
        // max break 70 minutes before the bar
        let mut state = with_breaks(-55, 10);

        assert_eq!(detector.evaluate(&mut state, &bar(15, 90.5, 92.0, 1000.0)), None);
        assert_eq!(state.signal, SignalState::BreakoutPending);
    }

    #[test]
    fn test_simultaneous_breaks_not_ordered() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(10, 10);

        assert_eq!(detector.evaluate(&mut state, &bar(15, 90.5, 92.0, 1000.0)), None);
        assert_eq!(state.signal, SignalState::BreakoutPending);
    }

    #[test]
    fn test_reentry_cooldown() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(5, 10);
        state.last_entry_time = Some(t(0));

        // 15 minutes after the last entry, cooldown is 20
        assert_eq!(detector.evaluate(&mut state, &bar(15, 90.5, 92.0, 1000.0)), None);
        assert_eq!(
            detector.evaluate(&mut state, &bar(20, 90.5, 92.0, 1000.0)),
            Some(Side::Long)
        );
    }

    #[test]
    fn test_suppressed_while_position_open() {
        let detector = SignalDetector::new(config());
        let mut state = with_breaks(5, 10);
        state.signal = SignalState::EntrySignaled;
        state.position = Some(Position {
            id: Uuid::new_v4(),
            side: Side::Short,
            entry_price: 95.0,
            entry_time: t(0),
        });

        assert_eq!(detector.evaluate(&mut state, &bar(15, 90.5, 92.0, 1000.0)), None);
        assert_eq!(state.signal, SignalState::EntrySignaled);
        assert!(state.extremum.min_break_time.is_some());
    }

    fn spike_detector() -> SignalDetector {
        SignalDetector::new(StrategyConfig {
            spike_alerts: true,
            spike_multiplier: 5.0,
            spike_cooldown_secs: 3600,
            ..Default::default()
        })
    }

    #[test]
    fn test_spike_direction_from_taker_buys() {
        let detector = spike_detector();
        let mut state = instrument();

        let buying = bar(1, 95.0, 96.0, 600.0).with_volumes(10.0, 7.0, 600.0);
        assert_eq!(detector.volume_spike(&mut state, &buying), Some(Pressure::Pump));
        assert_eq!(state.last_spike_alert, Some(t(1)));

        let mut other = instrument();
        let selling = bar(1, 96.0, 95.0, 600.0).with_volumes(10.0, 3.0, 600.0);
        assert_eq!(detector.volume_spike(&mut other, &selling), Some(Pressure::Dump));
    }

    #[test]
    fn test_spike_threshold_and_cooldown() {
        let detector = spike_detector();
        let mut state = instrument();

        // exactly average x multiplier is not a spike
        let at_threshold = bar(1, 95.0, 96.0, 500.0).with_volumes(10.0, 7.0, 500.0);
        assert_eq!(detector.volume_spike(&mut state, &at_threshold), None);

        let spike = |minute| bar(minute, 95.0, 96.0, 900.0).with_volumes(10.0, 7.0, 900.0);
        assert!(detector.volume_spike(&mut state, &spike(2)).is_some());
        assert_eq!(detector.volume_spike(&mut state, &spike(30)), None);
        assert!(detector.volume_spike(&mut state, &spike(62)).is_some());
    }

    #[test]
    fn test_spike_alerts_off_or_without_average() {
        let heavy = bar(1, 95.0, 96.0, 10_000.0).with_volumes(10.0, 7.0, 10_000.0);

        let mut state = instrument();
        assert_eq!(SignalDetector::new(config()).volume_spike(&mut state, &heavy), None);

        state.avg_volume = None;
        assert_eq!(spike_detector().volume_spike(&mut state, &heavy), None);
        assert!(state.last_spike_alert.is_none());
    }
}
