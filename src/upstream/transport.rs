//! Transport collaborator interface
//!
//! The pool never performs I/O itself. It stores a transport handle inside
//! each session, asks it about health and identity, and hands it to the
//! teardown path when the session is destroyed.

use crate::upstream::state::DestroyCause;
use std::io;
use std::net::{Shutdown, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};

/// An established outbound connection (plain TCP or TLS)
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Address and port of the origin or parent proxy
    fn remote_endpoint(&self) -> SocketAddr;

    /// Whether the connection is still healthy enough to keep alive
    fn is_reusable(&self) -> bool;

    /// Shut down one or both directions without releasing the handle.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Release the connection. Called exactly once, from session teardown.
    fn close(&mut self, reason: CloseReason);

    /// Negotiated protocol tag such as `"http/1.1"` or `"h2"`, if known
    fn protocol(&self) -> Option<&str> {
        None
    }
}

/// Reason passed to [`Transport::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close
    Normal,
    /// Reset the connection; data in flight may be lost
    Abort,
    /// Close after an OS-level error
    Errno(i32),
}

impl From<DestroyCause> for CloseReason {
    fn from(cause: DestroyCause) -> Self {
        match cause {
            DestroyCause::TransportError | DestroyCause::Unhealthy => CloseReason::Abort,
            _ => CloseReason::Normal,
        }
    }
}

impl From<&io::Error> for CloseReason {
    fn from(err: &io::Error) -> Self {
        err.raw_os_error().map_or(CloseReason::Abort, CloseReason::Errno)
    }
}
