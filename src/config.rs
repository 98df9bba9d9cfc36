use chrono::Duration;
use serde::Deserialize;
use std::path::Path;

use crate::error::BotError;
use crate::Result;

/// Tunables for extremum tracking, signal detection and exits
///
/// Durations are whole seconds so they read naturally in TOML and env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// How far back the extremum window reaches
    pub window_horizon_secs: u64,
    /// Recompute levels at least this often
    pub recompute_interval_secs: u64,
    /// ...or once this many bars arrived since the last recompute
    pub recompute_bars: usize,
    /// Newest bars left out of the level scan so a breakout bar is not its own level
    pub exclude_recent_bars: usize,
    /// Minimum relative move, in percent, before a level is replaced
    pub hysteresis_pct: f64,
    /// A break older than this is dropped once price is back inside the range
    pub confirmation_window_secs: u64,
    /// Both breaks must be younger than this to count as a reversal
    pub reversal_lookback_secs: u64,
    /// Live bar quote volume must exceed average x this
    pub volume_multiplier: f64,
    /// Minimum gap between two entries on the same instrument
    pub reentry_cooldown_secs: u64,
    pub take_profit_pct: f64,
    /// Positive number, exit fires at pnl <= -stop_loss_pct
    pub stop_loss_pct: f64,
    pub max_hold_secs: u64,
    pub first_check_delay_secs: u64,
    pub retry_interval_secs: u64,
    /// Round-trip cost deducted from every closed trade, in percent
    pub fee_pct: f64,
    /// Also evaluate exits on every live bar close
    pub exit_on_bar_close: bool,
    /// Alert on bars whose quote volume exceeds average x `spike_multiplier`
    pub spike_alerts: bool,
    pub spike_multiplier: f64,
    /// Minimum gap between two spike alerts on the same instrument
    pub spike_cooldown_secs: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            window_horizon_secs: 3600,
            recompute_interval_secs: 120,
            recompute_bars: 5,
            exclude_recent_bars: 6,
            hysteresis_pct: 0.2,
            confirmation_window_secs: 900,
            reversal_lookback_secs: 3600,
            volume_multiplier: 3.0,
            reentry_cooldown_secs: 1200,
            take_profit_pct: 2.0,
            stop_loss_pct: 1.0,
            max_hold_secs: 3600,
            first_check_delay_secs: 60,
            retry_interval_secs: 30,
            fee_pct: 0.1,
            exit_on_bar_close: false,
            spike_alerts: false,
            spike_multiplier: 5.0,
            spike_cooldown_secs: 3600,
        }
    }
}

impl StrategyConfig {
    pub fn window_horizon(&self) -> Duration {
        secs(self.window_horizon_secs)
    }

    pub fn recompute_interval(&self) -> Duration {
        secs(self.recompute_interval_secs)
    }

    pub fn confirmation_window(&self) -> Duration {
        secs(self.confirmation_window_secs)
    }

    pub fn reversal_lookback(&self) -> Duration {
        secs(self.reversal_lookback_secs)
    }

    pub fn reentry_cooldown(&self) -> Duration {
        secs(self.reentry_cooldown_secs)
    }

    pub fn max_hold(&self) -> Duration {
        secs(self.max_hold_secs)
    }

    pub fn spike_cooldown(&self) -> Duration {
        secs(self.spike_cooldown_secs)
    }

    pub fn first_check_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.first_check_delay_secs)
    }

    pub fn retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.hysteresis_pct < 0.0 {
            return Err(BotError::Config("hysteresis_pct must be >= 0".into()));
        }
        if self.take_profit_pct <= 0.0 || self.stop_loss_pct <= 0.0 {
            return Err(BotError::Config(
                "take_profit_pct and stop_loss_pct must be positive".into(),
            ));
        }
        if self.volume_multiplier <= 0.0 {
            return Err(BotError::Config("volume_multiplier must be positive".into()));
        }
        if self.retry_interval_secs == 0 {
            return Err(BotError::Config("retry_interval_secs must be non-zero".into()));
        }
        if self.recompute_bars == 0 {
            return Err(BotError::Config("recompute_bars must be non-zero".into()));
        }
        if self.spike_alerts && self.spike_multiplier <= 0.0 {
            return Err(BotError::Config("spike_multiplier must be positive".into()));
        }
        Ok(())
    }
}

/// Trailing volume statistics
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Granularity of historical bars used for the average
    pub interval: String,
    /// Number of historical bars to average over
    pub periods: u32,
    pub refresh_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: "1h".to_string(),
            periods: 24,
            refresh_secs: 7200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub requests_per_minute: u32,
    /// Drop still-forming bars at the feed boundary
    pub final_bars_only: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://fapi.binance.com".to_string(),
            ws_base_url: "wss://fstream.binance.com".to_string(),
            requests_per_minute: 300,
            final_bars_only: true,
        }
    }
}

/// Universe discovery filters and endpoints
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub spot_base_url: String,
    pub cmc_base_url: String,
    /// Set through `BOT__DISCOVERY__CMC_API_KEY`
    pub cmc_api_key: Option<String>,
    /// Market cap ranks strictly between these bounds are kept
    pub min_rank: u32,
    pub max_rank: u32,
    /// USD price must exceed this
    pub min_price: f64,
    /// Drop a coin whose biggest weekly volume is this many times its first week
    pub spike_ratio: f64,
    pub history_weeks: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            spot_base_url: "https://api.binance.com".to_string(),
            cmc_base_url: "https://pro-api.coinmarketcap.com".to_string(),
            cmc_api_key: None,
            min_rank: 50,
            max_rank: 1000,
            min_price: 0.0001,
            spike_ratio: 50.0,
            history_weeks: 500,
        }
    }
}

impl std::fmt::Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("spot_base_url", &self.spot_base_url)
            .field("cmc_base_url", &self.cmc_base_url)
            .field("cmc_api_key", &self.cmc_api_key.as_ref().map(|_| "<redacted>"))
            .field("min_rank", &self.min_rank)
            .field("max_rank", &self.max_rank)
            .field("min_price", &self.min_price)
            .field("spike_ratio", &self.spike_ratio)
            .field("history_weeks", &self.history_weeks)
            .finish()
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_rank >= self.max_rank {
            return Err(BotError::Config("discovery.min_rank must be below max_rank".into()));
        }
        if self.spike_ratio <= 0.0 {
            return Err(BotError::Config("discovery.spike_ratio must be positive".into()));
        }
        if self.history_weeks == 0 {
            return Err(BotError::Config("discovery.history_weeks must be non-zero".into()));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<&str> {
        match self.cmc_api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(BotError::Config(
                "discovery.cmc_api_key not set (BOT__DISCOVERY__CMC_API_KEY)".into(),
            )),
        }
    }
}

/// Application settings: defaults, then the config file, then `BOT__*` env vars
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Symbols to trade, e.g. `BTCUSDT`
    pub universe: Vec<String>,
    /// Live bar interval
    pub bar_interval: String,
    pub state_dir: String,
    pub strategy: StrategyConfig,
    pub stats: StatsConfig,
    pub exchange: ExchangeConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            universe: Vec::new(),
            bar_interval: "1m".to_string(),
            state_dir: "state".to_string(),
            strategy: StrategyConfig::default(),
            stats: StatsConfig::default(),
            exchange: ExchangeConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Settings {
    /// Read and validate settings for a trading run
    pub fn load(path: &Path) -> Result<Self> {
        let settings = Self::read(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings without checking them; an empty universe is allowed
    pub fn read(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("BOT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("universe")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.universe.is_empty() {
            return Err(BotError::Config("universe is empty".into()));
        }
        let bar_secs = interval_secs(&self.bar_interval)?;
        let stats_secs = interval_secs(&self.stats.interval)?;
        if stats_secs < bar_secs {
            return Err(BotError::Config(format!(
                "stats interval {} is shorter than bar interval {}",
                self.stats.interval, self.bar_interval
            )));
        }
        if self.stats.periods == 0 {
            return Err(BotError::Config("stats.periods must be non-zero".into()));
        }
        self.strategy.validate()
    }

    /// How many live bars fit into one historical stats bar
    pub fn volume_normalization(&self) -> Result<f64> {
        let bar_secs = interval_secs(&self.bar_interval)?;
        let stats_secs = interval_secs(&self.stats.interval)?;
        Ok(stats_secs as f64 / bar_secs as f64)
    }
}

/// Alert channel credentials, read from the environment
#[derive(Clone)]
pub struct Credentials {
    pub telegram_token: String,
    pub telegram_chat_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("telegram_token", &"<redacted>")
            .field("telegram_chat_id", &self.telegram_chat_id)
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            telegram_token: required_env("TELEGRAM_TOKEN")?,
            telegram_chat_id: required_env("TELEGRAM_CHAT_ID")?,
        })
    }
}

fn required_env(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BotError::Config(format!("{} not found in environment", key))),
    }
}

/// Parse a Binance-style interval (`1m`, `15m`, `4h`, `1d`, `1w`) into seconds
pub fn interval_secs(interval: &str) -> Result<u64> {
    let invalid = || BotError::Config(format!("invalid interval: {}", interval));

    let (split, unit) = interval.char_indices().last().ok_or_else(invalid)?;
    let unit_secs: u64 = match unit {
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return Err(invalid()),
    };
    let count: u64 = interval[..split].parse().map_err(|_| invalid())?;
    if count == 0 {
        return Err(invalid());
    }
    count.checked_mul(unit_secs).ok_or_else(invalid)
}

fn secs(s: u64) -> Duration {
    Duration::seconds(s as i64)
}
