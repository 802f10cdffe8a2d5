//! Outbound connection tracking
//!
//! The caller increments a tracking group before attaching it to a session.
//! The session releases it exactly once, when it is torn down.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{trace, warn};

/// A counter of live outbound connections to one destination class
pub trait TrackingGroup: Send + Sync {
    /// Record that one tracked connection has gone away.
    fn release(&self);

    /// Label used in logs
    fn key(&self) -> &str;
}

/// Atomic connection counter
#[derive(Debug)]
pub struct ConnectionGroup {
    key: String,
    count: AtomicUsize,
}

impl ConnectionGroup {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            count: AtomicUsize::new(0),
        }
    }

    /// Count a new connection. Returns the count including it.
    pub fn increment(&self) -> usize {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl TrackingGroup for ConnectionGroup {
    fn release(&self) {
        let result = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(previous) => trace!("Connection group {} released ({} -> {})", self.key, previous, previous - 1),
            Err(_) => warn!("Connection group {} released below zero", self.key),
        }
    }

    fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ConnectionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} connections)", self.key, self.count())
    }
}
