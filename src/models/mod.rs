use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::upstream::keys::SessionId;
use crate::upstream::state::SessionState;

// Point-in-time view of one session, for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub endpoint: SocketAddr,
    pub hostname: Option<String>, // fingerprint, hex
    pub state: SessionState,
    pub owner: Option<u64>,
    pub transact_count: u32,
    pub private: bool,
    pub to_parent_proxy: bool,
    pub protocol: Option<String>,
    pub age_ms: u64,
    pub idle_ms: Option<u64>,
}

// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounters {
    // Sessions handed back out by acquire or claim
    pub reused: u64,
    pub pooled: u64,
    // Releases that did not pool the session
    pub rejected: u64,
    pub evicted: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub taken_at: DateTime<Utc>,
    pub idle: usize,
    pub idle_shared: usize,
    pub idle_client_slave: usize,
    pub indexed_by_addr: usize,
    pub indexed_by_hostname: usize,
    pub idle_parent_proxy: usize,
    pub counters: PoolCounters,
}

impl PoolStats {
    // Fraction of lookups that found a reusable session
    pub fn reuse_ratio(&self) -> f64 {
        let lookups = self.counters.reused + self.counters.misses;
        if lookups == 0 {
            0.0
        } else {
            self.counters.reused as f64 / lookups as f64
        }
    }
}
