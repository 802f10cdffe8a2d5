//! Upstream session pooling
//!
//! Outbound connections are wrapped in [`Session`]s, parked in a
//! [`SessionPool`] between transactions and reclaimed by later requesters
//! going to the same destination.

pub mod conn_track;
pub mod connection_pool;
pub mod index;
pub mod keys;
pub mod session;
pub mod state;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use conn_track::{ConnectionGroup, TrackingGroup};
pub use connection_pool::{IndexMembership, Lookup, RejectReason, Release, SessionPool};
pub use keys::{AddrKey, HostnameFingerprint, OwnerId, SessionId};
pub use session::{ReadBinding, Requester, Session, WriteBinding};
pub use state::{DestroyCause, KeepAlive, SessionEvent, SessionState};
pub use transport::{CloseReason, Transport};
