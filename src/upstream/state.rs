//! Session lifecycle state machine
//!
//! ```text
//!   Init --activate--> Active --release(slave)--> KeepAliveClientSlave
//!                        ^  \---release(shared)-> KeepAliveShared
//!                        |                              |
//!                        +----------reclaim-------------+
//! ```
//!
//! Every state can be destroyed, but not for every cause: an idle timeout
//! only applies to an idle session, a non-reusable response only to an
//! active one. Transport errors and shutdown apply everywhere.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, not yet handed to a requester
    Init,
    /// Serving a transaction for exactly one requester
    Active,
    /// Idle, still claimed by the requester that released it
    KeepAliveClientSlave,
    /// Idle and reusable by any compatible requester
    KeepAliveShared,
}

impl SessionState {
    pub fn is_keep_alive(self) -> bool {
        matches!(self, Self::KeepAliveClientSlave | Self::KeepAliveShared)
    }

    /// Apply an event. `Ok(None)` means the session is destroyed.
    pub fn apply(self, event: SessionEvent) -> Result<Option<SessionState>> {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self, event) {
            (Init, Activate) => Some(Active),
            (Active, Release(KeepAlive::ClientSlave)) => Some(KeepAliveClientSlave),
            (Active, Release(KeepAlive::Shared)) => Some(KeepAliveShared),
            (KeepAliveClientSlave | KeepAliveShared, Reclaim) => Some(Active),
            (state, Destroy(cause)) if cause.allowed_from(state) => None,
            (from, event) => return Err(Error::InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Active => "active",
            Self::KeepAliveClientSlave => "keep-alive (client slave)",
            Self::KeepAliveShared => "keep-alive (shared)",
        };
        f.write_str(name)
    }
}

/// Flavor of keep-alive chosen by the releasing requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAlive {
    /// The releasing requester keeps an implicit claim
    ClientSlave,
    /// Any compatible requester may reclaim it
    Shared,
}

impl KeepAlive {
    pub fn state(self) -> SessionState {
        match self {
            Self::ClientSlave => SessionState::KeepAliveClientSlave,
            Self::Shared => SessionState::KeepAliveShared,
        }
    }
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyCause {
    TransportError,
    /// The transaction ended and the connection cannot be kept alive
    NotReusable,
    KeepAliveExpired,
    /// Removed from the pool by maintenance or a policy limit
    Evicted,
    /// Found stale by a health check
    Unhealthy,
    Shutdown,
    /// Owner dropped the session without destroying it
    Dropped,
}

impl DestroyCause {
    fn allowed_from(self, state: SessionState) -> bool {
        match self {
            Self::TransportError | Self::Shutdown | Self::Dropped => true,
            Self::NotReusable => state == SessionState::Active,
            Self::KeepAliveExpired | Self::Evicted | Self::Unhealthy => state.is_keep_alive(),
        }
    }
}

impl fmt::Display for DestroyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransportError => "transport error",
            Self::NotReusable => "not reusable",
            Self::KeepAliveExpired => "keep-alive expired",
            Self::Evicted => "evicted",
            Self::Unhealthy => "unhealthy",
            Self::Shutdown => "shutdown",
            Self::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

/// Lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Activate,
    Release(KeepAlive),
    Reclaim,
    Destroy(DestroyCause),
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activate => f.write_str("activate"),
            Self::Release(KeepAlive::ClientSlave) => f.write_str("release (client slave)"),
            Self::Release(KeepAlive::Shared) => f.write_str("release (shared)"),
            Self::Reclaim => f.write_str("reclaim"),
            Self::Destroy(cause) => write!(f, "destroy ({})", cause),
        }
    }
}
