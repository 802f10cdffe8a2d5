//! Connection pool for upstream sessions
//!
//! Idle sessions live in an arena keyed by [`SessionId`] and are linked into
//! two indices: by destination address and by hostname fingerprint. The arena
//! and both indices sit behind one lock, so a lookup and the claim that
//! follows it are a single critical section and an idle session can only be
//! handed to one requester.

use crate::config::settings::{ClientSlavePolicy, PoolConfig, SharingMatch, SharingPool};
use crate::models::{PoolCounters, PoolStats, SessionSnapshot};
use crate::upstream::index::{AddrIndex, HostnameIndex};
use crate::upstream::keys::{AddrKey, HostnameFingerprint, SessionId};
use crate::upstream::session::{Requester, Session};
use crate::upstream::state::{DestroyCause, KeepAlive, SessionState};
use crate::upstream::transport::Transport;
use crate::utils::{now, older_than};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a requester is looking for
#[derive(Debug, Clone, Copy)]
pub struct Lookup {
    pub endpoint: AddrKey,
    pub hostname: Option<HostnameFingerprint>,
    pub requester: Requester,
    /// Never return this session, e.g. the one the requester just released
    pub exclude: Option<SessionId>,
}

impl Lookup {
    pub fn new(remote: SocketAddr, hostname: &str, requester: Requester) -> Self {
        Self {
            endpoint: remote.into(),
            hostname: Some(HostnameFingerprint::of(hostname)),
            requester,
            exclude: None,
        }
    }

    /// Lookup without a hostname; only address matching can succeed
    pub fn by_addr(remote: SocketAddr, requester: Requester) -> Self {
        Self {
            endpoint: remote.into(),
            hostname: None,
            requester,
            exclude: None,
        }
    }

    pub fn excluding(mut self, id: SessionId) -> Self {
        self.exclude = Some(id);
        self
    }
}

/// Why a released session was not pooled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Pooling is turned off
    Disabled,
    /// Released while not active
    InvalidState,
    /// Carries authentication state
    Private,
    /// Its sharing match is `none`
    SharingDisabled,
    /// The transport reports it cannot be kept alive
    Unhealthy,
    /// Unread bytes are buffered; they would be read as the next response
    BufferedData,
    /// Host matching without a hostname could never find it
    MissingHostname,
    /// The endpoint already has the maximum number of idle sessions
    EndpointFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Disabled => "pooling disabled",
            Self::InvalidState => "session not active",
            Self::Private => "private session",
            Self::SharingDisabled => "sharing disabled",
            Self::Unhealthy => "transport not reusable",
            Self::BufferedData => "unread data buffered",
            Self::MissingHostname => "no hostname for host matching",
            Self::EndpointFull => "endpoint idle limit reached",
        };
        f.write_str(reason)
    }
}

/// Outcome of [`SessionPool::release`]
#[derive(Debug)]
pub enum Release<T: Transport> {
    /// The pool now owns the session
    Pooled(SessionId),
    /// The caller keeps the session and must destroy it
    Rejected(Session<T>, RejectReason),
}

impl<T: Transport> Release<T> {
    pub fn is_pooled(&self) -> bool {
        matches!(self, Release::Pooled(_))
    }
}

/// Index membership of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexMembership {
    pub by_addr: bool,
    pub by_hostname: bool,
}

struct PoolInner<T: Transport> {
    sessions: HashMap<SessionId, Session<T>>,
    by_addr: AddrIndex,
    by_hostname: HostnameIndex,
    counters: PoolCounters,
}

impl<T: Transport> PoolInner<T> {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_addr: AddrIndex::new(),
            by_hostname: HostnameIndex::new(),
            counters: PoolCounters::default(),
        }
    }

    /// Link a parked session into the indices and hand it to the arena.
    fn adopt(&mut self, session: Session<T>) -> std::result::Result<SessionId, Session<T>> {
        let id = session.id();
        if self.sessions.contains_key(&id) {
            error!("Session {} is already pooled", id);
            debug_assert!(false, "session {} pooled twice", id);
            return Err(session);
        }
        if let Err(err) = self.by_addr.insert(id, session.endpoint()) {
            error!("{}", err);
            return Err(session);
        }
        if let Some(fingerprint) = session.hostname() {
            if let Err(err) = self.by_hostname.insert(id, fingerprint) {
                error!("{}", err);
                self.by_addr.remove(id);
                return Err(session);
            }
        }
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Unlink a session from both indices and take it out of the arena.
    fn take(&mut self, id: SessionId) -> Option<Session<T>> {
        self.by_addr.remove(id);
        self.by_hostname.remove(id);
        self.sessions.remove(&id)
    }

    fn first_candidate(&self, lookup: &Lookup) -> Option<SessionId> {
        match lookup.requester.sharing_match {
            SharingMatch::None => None,
            SharingMatch::Host => lookup
                .hostname
                .and_then(|fingerprint| self.by_hostname.find_first(&fingerprint)),
            SharingMatch::Ip | SharingMatch::Both => self.by_addr.find_first(&lookup.endpoint),
        }
    }

    fn next_candidate(&self, previous: SessionId, lookup: &Lookup) -> Option<SessionId> {
        match lookup.requester.sharing_match {
            SharingMatch::None => None,
            SharingMatch::Host => lookup
                .hostname
                .and_then(|fingerprint| self.by_hostname.find_next(previous, &fingerprint)),
            SharingMatch::Ip | SharingMatch::Both => self.by_addr.find_next(previous, &lookup.endpoint),
        }
    }
}

/// Shared pool of idle upstream sessions
pub struct SessionPool<T: Transport> {
    config: PoolConfig,
    inner: Mutex<PoolInner<T>>,
}

impl<T: Transport> SessionPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        info!(
            "🔌 Upstream session pool ready (match: {}, slave policy: {:?}, keep-alive: {}s)",
            config.sharing_match, config.client_slave_policy, config.keep_alive_timeout_secs
        );
        Self {
            config,
            inner: Mutex::new(PoolInner::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Find an idle session for `lookup` and claim it.
    ///
    /// The returned session is active and owned by the caller. Candidates that
    /// fail the health check are removed and destroyed along the way.
    pub fn acquire(&self, lookup: &Lookup) -> Option<Session<T>> {
        let mut stale = Vec::new();
        let claimed = {
            let mut inner = self.inner.lock();
            let mut claimed = None;
            let mut cursor = inner.first_candidate(lookup);

            while let Some(id) = cursor {
                cursor = inner.next_candidate(id, lookup);
                let Some(session) = inner.sessions.get(&id) else {
                    continue;
                };
                if !self.matches(session, lookup) {
                    continue;
                }
                if self.config.check_health_on_acquire && !session.is_reusable() {
                    if let Some(session) = inner.take(id) {
                        stale.push(session);
                    }
                    continue;
                }
                claimed = inner.take(id);
                break;
            }

            match claimed.as_mut().map(|session| session.reclaim()) {
                Some(Ok(())) => inner.counters.reused += 1,
                Some(Err(err)) => {
                    error!("Claimed session could not be reactivated: {}", err);
                    stale.extend(claimed.take());
                }
                None => inner.counters.misses += 1,
            }
            inner.counters.evicted += stale.len() as u64;
            claimed
        };

        for session in stale {
            warn!("Dropping stale upstream session {} to {}", session.id(), session.remote_addr());
            session.destroy(DestroyCause::Unhealthy);
        }

        match &claimed {
            Some(session) => debug!(
                "Reusing upstream session {} to {} for {} (transaction {})",
                session.id(),
                session.remote_addr(),
                lookup.requester.owner,
                session.transact_count()
            ),
            None => debug!("No reusable upstream session for {}", lookup.endpoint),
        }
        claimed
    }

    /// Claim a specific idle session, typically a client-slave session by
    /// the requester that parked it.
    ///
    /// The owner may always claim its own client-slave session, even under
    /// `ClientSlavePolicy::Never`. Other requesters may claim one only under
    /// `ClientSlavePolicy::Any`, the same reach `acquire` gives them.
    pub fn claim(&self, id: SessionId, requester: &Requester) -> Option<Session<T>> {
        let mut stale = None;
        let claimed = {
            let mut inner = self.inner.lock();
            let allowed = inner.sessions.get(&id).is_some_and(|session| {
                let owned = session.owner() == Some(requester.owner);
                let scoped = session.sharing_pool() == SharingPool::Owner
                    || requester.sharing_pool == SharingPool::Owner;
                match session.state() {
                    SessionState::KeepAliveClientSlave => {
                        owned || (!scoped && self.config.client_slave_policy == ClientSlavePolicy::Any)
                    }
                    _ => owned || !scoped,
                }
            });
            if !allowed {
                return None;
            }

            let mut session = inner.take(id)?;
            if self.config.check_health_on_acquire && !session.is_reusable() {
                inner.counters.evicted += 1;
                stale = Some(session);
                None
            } else {
                match session.reclaim() {
                    Ok(()) => {
                        inner.counters.reused += 1;
                        Some(session)
                    }
                    Err(err) => {
                        error!("Claimed session could not be reactivated: {}", err);
                        stale = Some(session);
                        None
                    }
                }
            }
        };

        if let Some(session) = stale {
            warn!("Dropping stale upstream session {} on claim", session.id());
            session.destroy(DestroyCause::Unhealthy);
        }
        claimed
    }

    /// Hand an active session back after its transaction.
    ///
    /// The session is pooled only if it is reusable and its policy allows
    /// sharing; otherwise it comes back as [`Release::Rejected`].
    pub fn release(&self, mut session: Session<T>, keep_alive: KeepAlive) -> Release<T> {
        if let Some(reason) = self.release_gate(&session) {
            return self.reject(session, reason);
        }

        let mut inner = self.inner.lock();
        if self.config.max_idle_per_endpoint > 0
            && inner.by_addr.count(&session.endpoint()) >= self.config.max_idle_per_endpoint
        {
            drop(inner);
            return self.reject(session, RejectReason::EndpointFull);
        }

        if let Err(err) = session.park(keep_alive) {
            drop(inner);
            error!("{}", err);
            return self.reject(session, RejectReason::InvalidState);
        }

        match inner.adopt(session) {
            Ok(id) => {
                inner.counters.pooled += 1;
                debug!("Pooled upstream session {} ({:?})", id, keep_alive);
                Release::Pooled(id)
            }
            Err(session) => {
                drop(inner);
                self.reject(session, RejectReason::InvalidState)
            }
        }
    }

    fn release_gate(&self, session: &Session<T>) -> Option<RejectReason> {
        if !self.config.enabled {
            Some(RejectReason::Disabled)
        } else if session.state() != SessionState::Active {
            Some(RejectReason::InvalidState)
        } else if session.is_private() {
            Some(RejectReason::Private)
        } else if session.sharing_match() == SharingMatch::None {
            Some(RejectReason::SharingDisabled)
        } else if !session.is_reusable() {
            Some(RejectReason::Unhealthy)
        } else if session.buffered_len() > 0 {
            Some(RejectReason::BufferedData)
        } else if session.sharing_match() == SharingMatch::Host && session.hostname().is_none() {
            Some(RejectReason::MissingHostname)
        } else {
            None
        }
    }

    fn reject(&self, session: Session<T>, reason: RejectReason) -> Release<T> {
        match reason {
            RejectReason::InvalidState | RejectReason::Unhealthy => {
                warn!("Not pooling upstream session {}: {}", session.id(), reason)
            }
            _ => debug!("Not pooling upstream session {}: {}", session.id(), reason),
        }
        self.inner.lock().counters.rejected += 1;
        Release::Rejected(session, reason)
    }

    /// Whether an idle session satisfies a lookup's match, scope and slave policy.
    fn matches(&self, session: &Session<T>, lookup: &Lookup) -> bool {
        let requester = &lookup.requester;

        if lookup.exclude == Some(session.id()) {
            return false;
        }

        let identity = match requester.sharing_match {
            SharingMatch::None => false,
            SharingMatch::Ip => session.endpoint() == lookup.endpoint,
            SharingMatch::Host => {
                lookup.hostname.is_some()
                    && session.hostname() == lookup.hostname
                    && session.endpoint().port() == lookup.endpoint.port()
            }
            SharingMatch::Both => {
                session.endpoint() == lookup.endpoint && session.hostname() == lookup.hostname
            }
        };
        if !identity {
            return false;
        }

        let owned = session.owner() == Some(requester.owner);
        let scoped = session.sharing_pool() == SharingPool::Owner
            || requester.sharing_pool == SharingPool::Owner;
        if scoped && !owned {
            return false;
        }

        match session.state() {
            SessionState::KeepAliveShared => true,
            SessionState::KeepAliveClientSlave => match self.config.client_slave_policy {
                ClientSlavePolicy::Never => false,
                ClientSlavePolicy::OwnerOnly => owned,
                ClientSlavePolicy::Any => true,
            },
            SessionState::Init | SessionState::Active => false,
        }
    }

    /// Every idle session indexed under the lookup's key, before any policy
    /// filtering, in index order.
    pub fn candidates(&self, lookup: &Lookup) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock();
        let mut found = Vec::new();
        let mut cursor = inner.first_candidate(lookup);
        while let Some(id) = cursor {
            if let Some(session) = inner.sessions.get(&id) {
                found.push(session.snapshot());
            }
            cursor = inner.next_candidate(id, lookup);
        }
        found
    }

    /// Remove an idle session and destroy it.
    pub fn evict(&self, id: SessionId, cause: DestroyCause) -> bool {
        let taken = {
            let mut inner = self.inner.lock();
            let taken = inner.take(id);
            if taken.is_some() {
                inner.counters.evicted += 1;
            }
            taken
        };
        match taken {
            Some(session) => {
                debug!("Evicting upstream session {} ({})", id, cause);
                session.destroy(cause);
                true
            }
            None => false,
        }
    }

    /// Destroy sessions idle for at least `max_idle`. Returns how many.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let current = Instant::now();
        self.evict_where(DestroyCause::KeepAliveExpired, |session| {
            session
                .idle_since()
                .is_some_and(|since| older_than(since, current, max_idle))
        })
    }

    /// Destroy sessions idle past the configured keep-alive timeout.
    pub fn evict_expired(&self) -> usize {
        self.evict_idle(self.config.keep_alive_timeout())
    }

    /// Destroy idle sessions whose transport is no longer reusable.
    pub fn evict_unhealthy(&self) -> usize {
        self.evict_where(DestroyCause::Unhealthy, |session| !session.is_reusable())
    }

    /// Destroy every idle session, for shutdown.
    pub fn purge(&self) -> usize {
        let drained: Vec<Session<T>> = {
            let mut inner = self.inner.lock();
            inner.by_addr.clear();
            inner.by_hostname.clear();
            let drained: Vec<_> = inner.sessions.drain().map(|(_, session)| session).collect();
            inner.counters.evicted += drained.len() as u64;
            drained
        };
        let count = drained.len();
        for session in drained {
            session.destroy(DestroyCause::Shutdown);
        }
        if count > 0 {
            info!("Purged {} idle upstream sessions", count);
        }
        count
    }

    fn evict_where<F>(&self, cause: DestroyCause, predicate: F) -> usize
    where
        F: Fn(&Session<T>) -> bool,
    {
        let victims: Vec<Session<T>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<SessionId> = inner
                .sessions
                .iter()
                .filter(|(_, session)| predicate(session))
                .map(|(id, _)| *id)
                .collect();
            let victims: Vec<_> = ids.into_iter().filter_map(|id| inner.take(id)).collect();
            inner.counters.evicted += victims.len() as u64;
            victims
        };
        let count = victims.len();
        for session in victims {
            session.destroy(cause);
        }
        if count > 0 {
            debug!("Evicted {} upstream sessions ({})", count, cause);
        }
        count
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.lock().sessions.contains_key(&id)
    }

    pub fn index_membership(&self, id: SessionId) -> IndexMembership {
        let inner = self.inner.lock();
        IndexMembership {
            by_addr: inner.by_addr.contains(id),
            by_hostname: inner.by_hostname.contains(id),
        }
    }

    /// Number of idle sessions
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock();
        let mut sessions: Vec<_> = inner.sessions.values().map(Session::snapshot).collect();
        sessions.sort_by_key(|snapshot| snapshot.id);
        sessions
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let count_state = |state| inner.sessions.values().filter(|s| s.state() == state).count();
        PoolStats {
            taken_at: now(),
            idle: inner.sessions.len(),
            idle_shared: count_state(SessionState::KeepAliveShared),
            idle_client_slave: count_state(SessionState::KeepAliveClientSlave),
            indexed_by_addr: inner.by_addr.len(),
            indexed_by_hostname: inner.by_hostname.len(),
            idle_parent_proxy: inner.sessions.values().filter(|s| s.is_to_parent_proxy()).count(),
            counters: inner.counters.clone(),
        }
    }
}
