//! In-memory transport for unit tests

use crate::upstream::transport::{CloseReason, Transport};
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

#[derive(Debug, Default)]
struct ProbeState {
    unhealthy: bool,
    close_calls: usize,
    close_reason: Option<CloseReason>,
    shutdowns: Vec<Shutdown>,
}

/// Observes and steers a [`MockTransport`] after it has moved into a session
#[derive(Debug, Clone, Default)]
pub struct Probe(Arc<Mutex<ProbeState>>);

impl Probe {
    pub fn set_reusable(&self, reusable: bool) {
        self.0.lock().unhealthy = !reusable;
    }

    pub fn close_calls(&self) -> usize {
        self.0.lock().close_calls
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.0.lock().close_reason
    }

    pub fn shutdowns(&self) -> Vec<Shutdown> {
        self.0.lock().shutdowns.clone()
    }
}

pub struct MockTransport {
    remote: SocketAddr,
    stream: DuplexStream,
    probe: Probe,
}

impl MockTransport {
    /// Transport whose peer has already gone away
    pub fn new(remote: &str) -> Self {
        Self::pair(remote).0
    }

    /// Transport plus the peer end of its stream
    pub fn pair(remote: &str) -> (Self, DuplexStream) {
        let (stream, peer) = duplex(64 * 1024);
        let transport = Self {
            remote: remote.parse().expect("valid socket address"),
            stream,
            probe: Probe::default(),
        };
        (transport, peer)
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }
}

impl Transport for MockTransport {
    fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    fn is_reusable(&self) -> bool {
        let state = self.probe.0.lock();
        !state.unhealthy && state.close_calls == 0
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.probe.0.lock().shutdowns.push(how);
        Ok(())
    }

    fn close(&mut self, reason: CloseReason) {
        let mut state = self.probe.0.lock();
        state.close_calls += 1;
        state.close_reason = Some(reason);
    }

    fn protocol(&self) -> Option<&str> {
        Some("http/1.1")
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
