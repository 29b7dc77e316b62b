pub mod config;
pub mod generator;
pub mod message;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod report;
pub mod sender;
pub mod stats;
pub mod transport;
pub mod ws;

pub use config::*;
pub use generator::*;
pub use message::*;
pub use orchestrator::*;
pub use pool::*;
pub use queue::*;
pub use report::*;
pub use sender::*;
pub use stats::*;
pub use transport::*;
pub use ws::*;
