use thiserror::Error;

/// Errors surfaced by the bot, grouped by how the caller recovers from them
#[derive(Debug, Error)]
pub enum BotError {
    /// Feed, historical query or price lookup failure. Skip and retry next cycle.
    #[error("market data error: {0}")]
    Data(String),

    /// State store failure. In-memory state stays authoritative.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Alert delivery failure. Logged and dropped.
    #[error("notification error: {0}")]
    Notification(String),

    /// Missing credentials or invalid settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bar rejected at the feed boundary
    #[error("malformed bar for {symbol}: {reason}")]
    MalformedBar { symbol: String, reason: String },

    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("position already open for {0}")]
    PositionAlreadyOpen(String),
}

impl BotError {
    /// Only configuration errors are allowed to stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::Config(_))
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::Data(e.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Config(e.to_string())
    }
}
