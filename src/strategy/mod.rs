// Signal generation: volume statistics, extremum tracking, entry rules
pub mod extremum;
pub mod signals;
pub mod stats;

pub use extremum::{ExtremumTracker, ExtremumUpdate};
pub use signals::SignalDetector;
pub use stats::{RefreshSummary, RollingStatsTracker};
