//! A single pooled upstream connection and its reuse metadata

use crate::config::settings::{PoolConfig, SharingMatch, SharingPool};
use crate::error::{Error, Result};
use crate::models::SessionSnapshot;
use crate::upstream::conn_track::TrackingGroup;
use crate::upstream::keys::{AddrKey, HostnameFingerprint, OwnerId, SessionId};
use crate::upstream::state::{DestroyCause, KeepAlive, SessionEvent, SessionState};
use crate::upstream::transport::{CloseReason, Transport};
use crate::utils::duration_to_ms;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, trace};

/// Bytes reserved in the read buffer before each fill
const READ_CHUNK: usize = 4096;

/// Sharing settings a requester brings to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub owner: OwnerId,
    pub sharing_match: SharingMatch,
    pub sharing_pool: SharingPool,
    pub to_parent_proxy: bool,
}

impl Requester {
    pub fn new(owner: impl Into<OwnerId>) -> Self {
        Self {
            owner: owner.into(),
            sharing_match: SharingMatch::Both,
            sharing_pool: SharingPool::Global,
            to_parent_proxy: false,
        }
    }

    /// Requester using the configured default sharing policy
    pub fn from_config(owner: impl Into<OwnerId>, config: &PoolConfig) -> Self {
        Self {
            sharing_match: config.sharing_match,
            sharing_pool: config.sharing_pool,
            ..Self::new(owner)
        }
    }

    pub fn with_match(mut self, sharing_match: SharingMatch) -> Self {
        self.sharing_match = sharing_match;
        self
    }

    pub fn with_pool(mut self, sharing_pool: SharingPool) -> Self {
        self.sharing_pool = sharing_pool;
        self
    }

    pub fn via_parent_proxy(mut self) -> Self {
        self.to_parent_proxy = true;
        self
    }
}

/// One outbound connection plus the state the pool needs to reuse it
///
/// A session is owned by exactly one party at a time: the requester while it
/// is active, or the pool while it is idle. It is torn down exactly once,
/// either through [`Session::destroy`] or when dropped.
pub struct Session<T: Transport> {
    id: SessionId,
    transport: T,
    endpoint: SocketAddr,
    hostname: Option<HostnameFingerprint>,
    state: SessionState,

    // Copied from the first requester; fixed for the session's lifetime.
    sharing_match: SharingMatch,
    sharing_pool: SharingPool,
    owner: Option<OwnerId>,
    to_parent_proxy: bool,

    // Set once authentication headers have been sent on this connection.
    private: bool,

    transact_count: u32,
    tracking: Option<Arc<dyn TrackingGroup>>,

    // Survives keep-alive so a reclaimed session keeps its buffer.
    read_buffer: BytesMut,

    created_at: Instant,
    idle_since: Option<Instant>,
    torn_down: bool,
}

impl<T: Transport> Session<T> {
    /// Wrap a freshly established connection.
    pub fn create(transport: T) -> Self {
        let id = SessionId::next();
        let endpoint = transport.remote_endpoint();
        debug!("Created upstream session {} to {}", id, endpoint);

        Self {
            id,
            transport,
            endpoint,
            hostname: None,
            state: SessionState::Init,
            sharing_match: SharingMatch::Both,
            sharing_pool: SharingPool::Global,
            owner: None,
            to_parent_proxy: false,
            private: false,
            transact_count: 0,
            tracking: None,
            read_buffer: BytesMut::new(),
            created_at: Instant::now(),
            idle_since: None,
            torn_down: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn endpoint(&self) -> AddrKey {
        self.endpoint.into()
    }

    pub fn hostname(&self) -> Option<HostnameFingerprint> {
        self.hostname
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sharing_match(&self) -> SharingMatch {
        self.sharing_match
    }

    pub fn sharing_pool(&self) -> SharingPool {
        self.sharing_pool
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn transact_count(&self) -> u32 {
        self.transact_count
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn is_to_parent_proxy(&self) -> bool {
        self.to_parent_proxy
    }

    pub fn has_tracking_group(&self) -> bool {
        self.tracking.is_some()
    }

    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    /// Unread bytes left in the session buffer
    pub fn buffered_len(&self) -> usize {
        self.read_buffer.len()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.transport.protocol()
    }

    /// Transport health check
    pub fn is_reusable(&self) -> bool {
        self.transport.is_reusable()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fingerprint the destination hostname. Only the first call has effect.
    ///
    /// Returns true if this call set the fingerprint.
    pub fn attach_hostname(&mut self, hostname: &str) -> bool {
        if self.hostname.is_some() {
            return false;
        }
        let fingerprint = HostnameFingerprint::of(hostname);
        trace!("Session {} hostname {} -> {}", self.id, hostname, fingerprint);
        self.hostname = Some(fingerprint);
        true
    }

    /// Attach an already-incremented tracking group.
    ///
    /// The group is released once when the session is torn down.
    pub fn enable_connection_tracking(&mut self, group: Arc<dyn TrackingGroup>) -> Result<()> {
        if self.tracking.is_some() {
            return Err(Error::TrackingAlreadyEnabled(self.id));
        }
        debug!("Session {} tracked by connection group {}", self.id, group.key());
        self.tracking = Some(group);
        Ok(())
    }

    /// Flag the session as carrying authentication state. It will not be pooled.
    pub fn mark_private(&mut self) {
        if !self.private {
            debug!("Session {} marked private", self.id);
            self.private = true;
        }
    }

    /// Replace the transport before the session is first handed out.
    ///
    /// Returns the previous transport. After activation a new session must
    /// be created instead; the rejected transport is closed.
    pub fn set_transport(&mut self, mut transport: T) -> Result<T> {
        if self.state != SessionState::Init {
            transport.close(CloseReason::Normal);
            return Err(Error::TransportRebind(self.id));
        }
        self.endpoint = transport.remote_endpoint();
        Ok(std::mem::replace(&mut self.transport, transport))
    }

    /// Hand a new session to its first requester and copy its sharing policy.
    pub fn activate(&mut self, requester: &Requester) -> Result<()> {
        self.transition(SessionEvent::Activate)?;
        self.sharing_match = requester.sharing_match;
        self.sharing_pool = requester.sharing_pool;
        self.owner = Some(requester.owner);
        self.to_parent_proxy = requester.to_parent_proxy;
        self.transact_count += 1;
        Ok(())
    }

    pub(crate) fn park(&mut self, keep_alive: KeepAlive) -> Result<()> {
        self.transition(SessionEvent::Release(keep_alive))?;
        self.idle_since = Some(Instant::now());
        Ok(())
    }

    pub(crate) fn reclaim(&mut self) -> Result<()> {
        self.transition(SessionEvent::Reclaim)?;
        self.idle_since = None;
        self.transact_count += 1;
        Ok(())
    }

    // Only called with activate, release and reclaim; destroy events go
    // through `destroy`, so `None` here means a caller passed one anyway.
    fn transition(&mut self, event: SessionEvent) -> Result<()> {
        debug_assert!(!matches!(event, SessionEvent::Destroy(_)));
        match self.state.apply(event)? {
            Some(next) => {
                trace!("Session {} {} -> {}", self.id, self.state, next);
                self.state = next;
                Ok(())
            }
            None => Err(Error::InvalidTransition { from: self.state, event }),
        }
    }

    /// Bind the session buffer to a reader.
    pub fn begin_read(&mut self) -> ReadBinding<'_, T> {
        ReadBinding {
            transport: &mut self.transport,
            buffer: &mut self.read_buffer,
        }
    }

    /// Bind the transport to a writer.
    pub fn begin_write(&mut self) -> WriteBinding<'_, T> {
        WriteBinding {
            transport: &mut self.transport,
        }
    }

    /// Shut down the transport in one or both directions.
    ///
    /// The session stays alive; the owner still has to destroy it.
    pub fn close(&mut self, how: Shutdown) -> io::Result<()> {
        debug!("Session {} shutdown {:?}", self.id, how);
        self.transport.shutdown(how)
    }

    /// Tear the session down: close the transport and release its tracking group.
    pub fn destroy(mut self, cause: DestroyCause) {
        if let Err(err) = self.state.apply(SessionEvent::Destroy(cause)) {
            error!("Session {} destroyed out of order: {}", self.id, err);
            debug_assert!(false, "{}", err);
        }
        self.teardown(cause, cause.into());
    }

    /// Tear the session down after a transport error.
    pub fn abort(mut self, err: &io::Error) {
        debug!("Session {} aborted: {}", self.id, err);
        self.teardown(DestroyCause::TransportError, err.into());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            endpoint: self.endpoint,
            hostname: self.hostname.map(|fp| fp.to_string()),
            state: self.state,
            owner: self.owner.map(|owner| owner.0),
            transact_count: self.transact_count,
            private: self.private,
            to_parent_proxy: self.to_parent_proxy,
            protocol: self.protocol().map(str::to_string),
            age_ms: duration_to_ms(self.created_at.elapsed()),
            idle_ms: self.idle_since.map(|since| duration_to_ms(since.elapsed())),
        }
    }

    fn teardown(&mut self, cause: DestroyCause, reason: CloseReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.transport.close(reason);
        if let Some(group) = self.tracking.take() {
            group.release();
        }
        debug!(
            "Destroyed upstream session {} to {} ({}, {} transactions)",
            self.id, self.endpoint, cause, self.transact_count
        );
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.teardown(DestroyCause::Dropped, CloseReason::Normal);
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("transact_count", &self.transact_count)
            .field("private", &self.private)
            .finish()
    }
}

/// Read side of a session, bound to its persistent buffer
pub struct ReadBinding<'a, T: Transport> {
    transport: &'a mut T,
    buffer: &'a mut BytesMut,
}

impl<T: Transport> ReadBinding<'_, T> {
    /// Read more bytes into the buffer. Returns 0 at end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buffer.reserve(READ_CHUNK);
        self.transport.read_buf(&mut *self.buffer).await
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer[..]
    }

    /// Take the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buffer.len());
        self.buffer.split_to(n).freeze()
    }
}

/// Write side of a session
pub struct WriteBinding<'a, T: Transport> {
    transport: &'a mut T,
}

impl<T: Transport> WriteBinding<'_, T> {
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.transport.write_all(data).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.transport.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::conn_track::ConnectionGroup;
    use crate::upstream::testing::{MockTransport, Probe};

    fn session(addr: &str) -> (Session<MockTransport>, Probe) {
        let transport = MockTransport::new(addr);
        let probe = transport.probe();
        (Session::create(transport), probe)
    }

    #[test]
    fn test_create_starts_in_init() {
        let (session, _) = session("10.0.0.1:80");
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.remote_addr(), "10.0.0.1:80".parse().unwrap());
        assert_eq!(session.hostname(), None);
        assert!(!session.has_tracking_group());
        assert_eq!(session.transact_count(), 0);
    }

    #[test]
    fn test_attach_hostname_only_once() {
        let (mut session, _) = session("10.0.0.1:80");
        assert!(session.attach_hostname("a.example"));
        assert!(!session.attach_hostname("b.example"));
        assert_eq!(session.hostname(), Some(HostnameFingerprint::of("a.example")));
    }

    #[test]
    fn test_activate_copies_requester_policy() {
        let (mut session, _) = session("10.0.0.1:80");
        let requester = Requester::new(7)
            .with_match(SharingMatch::Ip)
            .with_pool(SharingPool::Owner)
            .via_parent_proxy();
        session.activate(&requester).unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.sharing_match(), SharingMatch::Ip);
        assert_eq!(session.sharing_pool(), SharingPool::Owner);
        assert_eq!(session.owner(), Some(OwnerId(7)));
        assert!(session.is_to_parent_proxy());
        assert_eq!(session.transact_count(), 1);
        assert!(session.activate(&requester).is_err());
    }

    #[test]
    fn test_requester_from_config_takes_defaults() {
        let config = PoolConfig {
            sharing_match: SharingMatch::Host,
            sharing_pool: SharingPool::Owner,
            ..PoolConfig::default()
        };
        let requester = Requester::from_config(4, &config);
        assert_eq!(requester.owner, OwnerId(4));
        assert_eq!(requester.sharing_match, SharingMatch::Host);
        assert_eq!(requester.sharing_pool, SharingPool::Owner);
        assert!(!requester.to_parent_proxy);

        let (mut session, _) = session("10.0.0.1:80");
        session.activate(&requester).unwrap();
        assert_eq!(session.sharing_match(), SharingMatch::Host);
        assert_eq!(session.sharing_pool(), SharingPool::Owner);
    }

    #[test]
    fn test_tracking_group_released_once_on_destroy() {
        let group = Arc::new(ConnectionGroup::new("origin"));
        group.increment();
        let (mut session, probe) = session("10.0.0.1:80");
        session.enable_connection_tracking(group.clone()).unwrap();
        assert!(matches!(
            session.enable_connection_tracking(group.clone()),
            Err(Error::TrackingAlreadyEnabled(_))
        ));

        session.destroy(DestroyCause::TransportError);
        assert_eq!(group.count(), 0);
        assert_eq!(probe.close_reason(), Some(CloseReason::Abort));
        assert_eq!(probe.close_calls(), 1);
    }

    #[test]
    fn test_drop_releases_tracking_group() {
        let group = Arc::new(ConnectionGroup::new("origin"));
        group.increment();
        let (mut session, probe) = session("10.0.0.1:80");
        session.enable_connection_tracking(group.clone()).unwrap();
        drop(session);
        assert_eq!(group.count(), 0);
        assert_eq!(probe.close_calls(), 1);
    }

    #[test]
    fn test_destroy_without_group_is_fine() {
        let (session, probe) = session("10.0.0.1:80");
        session.destroy(DestroyCause::Shutdown);
        assert_eq!(probe.close_reason(), Some(CloseReason::Normal));
    }

    #[test]
    fn test_abort_reports_errno() {
        let (session, probe) = session("10.0.0.1:80");
        session.abort(&io::Error::from_raw_os_error(104));
        assert_eq!(probe.close_reason(), Some(CloseReason::Errno(104)));
    }

    #[test]
    fn test_set_transport_only_before_activation() {
        let (mut session, _) = session("10.0.0.1:80");
        let old = session.set_transport(MockTransport::new("10.0.0.2:80")).unwrap();
        assert_eq!(old.remote_endpoint(), "10.0.0.1:80".parse().unwrap());
        assert_eq!(session.remote_addr(), "10.0.0.2:80".parse().unwrap());

        session.activate(&Requester::new(1)).unwrap();
        let rejected = MockTransport::new("10.0.0.3:80");
        let probe = rejected.probe();
        assert!(matches!(
            session.set_transport(rejected),
            Err(Error::TransportRebind(_))
        ));
        assert_eq!(probe.close_calls(), 1);
    }

    #[test]
    fn test_close_shuts_down_without_destroying() {
        let (mut session, probe) = session("10.0.0.1:80");
        session.close(Shutdown::Write).unwrap();
        assert_eq!(probe.shutdowns(), vec![Shutdown::Write]);
        assert_eq!(probe.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_read_binding_can_be_rebound() {
        let (transport, mut peer) = MockTransport::pair("10.0.0.1:80");
        let mut session = Session::create(transport);

        peer.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        {
            let mut reader = session.begin_read();
            let n = reader.fill().await.unwrap();
            assert_eq!(n, 17);
            assert_eq!(&reader.consume(8)[..], b"HTTP/1.1");
        }
        assert_eq!(session.buffered_len(), 9);

        let mut reader = session.begin_read();
        assert_eq!(reader.buffered(), b" 200 OK\r\n");
        reader.consume(usize::MAX);
        assert!(reader.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_write_binding_reaches_peer() {
        let (transport, mut peer) = MockTransport::pair("10.0.0.1:80");
        let mut session = Session::create(transport);

        let mut writer = session.begin_write();
        writer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        writer.flush().await.unwrap();

        let mut received = vec![0u8; 18];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_snapshot_reflects_session() {
        let (mut session, _) = session("10.0.0.1:80");
        session.attach_hostname("a.example");
        session.activate(&Requester::new(3)).unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.id, session.id());
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.owner, Some(3));
        assert_eq!(snapshot.protocol.as_deref(), Some("http/1.1"));
        assert!(snapshot.idle_ms.is_none());
    }
}
