use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use crate::error::BotError;
use crate::Result;

/// One OHLCV record for a fixed interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Base asset volume
    pub volume: f64,
    /// Taker buy base asset volume
    pub buy_volume: f64,
    pub quote_volume: f64,
    /// Bar-close event time
    pub close_time: DateTime<Utc>,
    /// False while the bar is still forming
    pub is_final: bool,
}

impl Bar {
    pub fn new(
        symbol: impl Into<String>,
        open_time: DateTime<Utc>,
        close_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            open_time,
            open,
            high,
            low,
            close,
            volume: 0.0,
            buy_volume: 0.0,
            quote_volume: 0.0,
            close_time,
            is_final: true,
        }
    }

    pub fn with_volumes(mut self, volume: f64, buy_volume: f64, quote_volume: f64) -> Self {
        self.volume = volume;
        self.buy_volume = buy_volume;
        self.quote_volume = quote_volume;
        self
    }

    /// Takers bought more than half of the base volume
    pub fn buy_dominant(&self) -> bool {
        self.buy_volume > self.volume / 2.0
    }

    pub fn forming(mut self) -> Self {
        self.is_final = false;
        self
    }

    /// Check the record is internally consistent
    ///
    /// Called at the feed boundary so downstream code can trust every field.
    pub fn validate(self) -> Result<Self> {
        let reject = |reason: &str| {
            Err(BotError::MalformedBar {
                symbol: self.symbol.clone(),
                reason: reason.to_string(),
            })
        };

        if self.symbol.is_empty() {
            return reject("empty symbol");
        }
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return reject("non-positive or non-finite price");
        }
        let volumes = [self.volume, self.buy_volume, self.quote_volume];
        if volumes.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return reject("negative or non-finite volume");
        }
        if self.high < self.low {
            return reject("high below low");
        }
        if self.open > self.high || self.open < self.low {
            return reject("open outside high/low range");
        }
        if self.close > self.high || self.close < self.low {
            return reject("close outside high/low range");
        }
        if self.close_time < self.open_time {
            return reject("close time before open time");
        }

        Ok(self)
    }
}

/// Direction of a position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Which side of the book drove a volume spike
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// Taker buys dominate
    Pump,
    Dump,
}

impl Pressure {
    pub fn of(bar: &Bar) -> Self {
        if bar.buy_dominant() {
            Pressure::Pump
        } else {
            Pressure::Dump
        }
    }
}

impl fmt::Display for Pressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pressure::Pump => write!(f, "PUMP"),
            Pressure::Dump => write!(f, "DUMP"),
        }
    }
}

/// A recorded local extremum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Level {
    pub price: f64,
    pub time: DateTime<Utc>,
}

/// Rolling extremum tracking state for one instrument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtremumState {
    /// Recent bars, oldest first. Rebuilt from the live feed after a restart.
    #[serde(skip)]
    pub window: VecDeque<Bar>,
    pub local_max: Option<Level>,
    pub local_min: Option<Level>,
    pub max_break_time: Option<DateTime<Utc>>,
    pub min_break_time: Option<DateTime<Utc>>,
    pub last_recompute: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bars_since_recompute: usize,
}

/// Per-instrument signal state machine
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalState {
    #[default]
    NoSignal,
    BreakoutPending,
    ReversalConfirmed,
    EntrySignaled,
}

/// Open position on an instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TimeStop,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "take profit"),
            ExitReason::StopLoss => write!(f, "stop loss"),
            ExitReason::TimeStop => write!(f, "time stop"),
        }
    }
}

/// Result of closing a position
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
    pub reason: ExitReason,
    /// Running total after this trade, fees included
    pub cumulative_pnl_pct: f64,
}

/// Everything the bot knows about one instrument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentState {
    pub symbol: String,
    /// Average quote volume per live bar
    #[serde(default)]
    pub avg_volume: Option<f64>,
    #[serde(default)]
    pub extremum: ExtremumState,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub signal: SignalState,
    #[serde(default)]
    pub last_entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_spike_alert: Option<DateTime<Utc>>,
}

impl InstrumentState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    pub fn has_open_position(&self) -> bool {
        self.position.is_some()
    }
}
