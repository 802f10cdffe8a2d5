//! Error handling module for the session pool

use crate::upstream::keys::SessionId;
use crate::upstream::state::{SessionEvent, SessionState};
use thiserror::Error;

/// Custom error type for the session pool
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Illegal session transition: {event} while {from}")]
    InvalidTransition {
        from: SessionState,
        event: SessionEvent,
    },

    #[error("Session {id} is already linked in the {index} index")]
    AlreadyIndexed { id: SessionId, index: &'static str },

    #[error("Session {0} already has a connection tracking group")]
    TrackingAlreadyEnabled(SessionId),

    #[error("Session {0} transport can only be rebound before activation")]
    TransportRebind(SessionId),
}

/// Result type for the session pool
pub type Result<T> = std::result::Result<T, Error>;
