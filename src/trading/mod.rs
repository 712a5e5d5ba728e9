pub mod detector;
pub mod distributor;
pub mod instructions;
pub mod monitor;
pub mod orchestrator;
pub mod position;
pub mod pumpfun;
pub mod quote;
pub mod relay;
pub mod retry;
pub mod sniper;
pub mod sweeper;

pub use detector::TokenDetector;
pub use monitor::{MonitorState, PositionMonitor};
pub use orchestrator::TradeOrchestrator;
pub use position::{Position, PositionBook};
pub use quote::{Instrument, QuoteSource};
pub use relay::RelaySubmitter;
pub use sniper::Sniper;
