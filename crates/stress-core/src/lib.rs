pub mod client;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod orchestrator;
pub mod payload;
pub mod sender;

pub use client::*;
pub use config::*;
pub use errors::*;
pub use metrics::*;
pub use orchestrator::*;
pub use payload::*;
pub use sender::*;
