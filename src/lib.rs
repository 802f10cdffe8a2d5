//! Upstream Session Pool - keep-alive pooling for outbound proxy connections
//!
//! Finished upstream connections are parked in a [`SessionPool`], indexed by
//! destination address and by hostname, and handed to the next compatible
//! request instead of opening a new connection.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod upstream;
pub mod utils;

// Re-export commonly used items
pub use config::settings::{ClientSlavePolicy, PoolConfig, SharingMatch, SharingPool};
pub use error::{Error, Result};
pub use logging::{init_logger, init_logger_with_env, init_logger_with_level, log_debug, log_error, log_info, log_pool_stats, log_trace, log_warning};
pub use models::{PoolCounters, PoolStats, SessionSnapshot};
pub use upstream::{
    DestroyCause, KeepAlive, Lookup, Release, Requester, Session, SessionId, SessionPool, SessionState,
    TrackingGroup, Transport,
};
