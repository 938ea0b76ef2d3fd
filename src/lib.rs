pub mod args;
pub mod chart;
pub mod checksum;
pub mod error;
pub mod hop;
pub mod log_sink;
pub mod packet;
pub mod reply;
pub mod report;
pub mod resolve;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use args::{Args, ProbeProtocol};
pub use error::TraceError;
pub use hop::{HopRecord, TraceResult};
pub use packet::{ProbeIdentifier, ProbeTarget};
pub use session::{trace, ProbeSession, SessionConfig, SessionObserver};

// Re-export external dependencies commonly used across modules
pub use anyhow::Result;
pub use std::net::IpAddr;
pub use std::time::Duration;
