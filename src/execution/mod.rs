// Instrument state, exit scheduling and position lifecycle
pub mod position_manager;
pub mod repository;
pub mod scheduler;

pub use position_manager::{pnl_pct, CheckOutcome, TradeLifecycleManager};
pub use repository::InstrumentRepository;
pub use scheduler::ExitScheduler;
