//! Configuration for the session pool

pub mod settings;

pub use settings::{ClientSlavePolicy, PoolConfig, SharingMatch, SharingPool};
