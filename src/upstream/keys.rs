//! Identity keys for pooled upstream sessions
//!
//! Sessions are looked up by destination endpoint ([`AddrKey`]) or by a
//! fixed-width fingerprint of the destination hostname ([`HostnameFingerprint`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh3::xxh3_128;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonically increasing session identifier, also the arena handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies the worker context that owns a session under owner-scoped sharing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl From<u64> for OwnerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Destination endpoint key: address and port, compared exactly
///
/// IPv6 flow info and scope id are not part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddrKey {
    ip: IpAddr,
    port: u16,
}

impl AddrKey {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for AddrKey {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for AddrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

/// 128-bit fingerprint of a destination hostname
///
/// Equality is bitwise. Two hostnames that collide are treated as the same
/// host; at this width that is accepted as negligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostnameFingerprint(u128);

impl HostnameFingerprint {
    /// Fingerprint a hostname. ASCII case is folded before hashing.
    pub fn of(hostname: &str) -> Self {
        if hostname.bytes().any(|b| b.is_ascii_uppercase()) {
            Self(xxh3_128(hostname.to_ascii_lowercase().as_bytes()))
        } else {
            Self(xxh3_128(hostname.as_bytes()))
        }
    }

    /// Fold the two halves into a bucket hash.
    pub fn fold(&self) -> u64 {
        (self.0 as u64) ^ ((self.0 >> 64) as u64)
    }
}

impl Hash for HostnameFingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fold());
    }
}

impl fmt::Display for HostnameFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Pass-through hasher for keys that are already well-mixed hashes
#[derive(Debug, Default, Clone, Copy)]
pub struct FoldHasher(u64);

impl Hasher for FoldHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(b);
        }
    }

    fn write_u64(&mut self, n: u64) {
        self.0 ^= n;
    }
}

pub type FingerprintBuildHasher = BuildHasherDefault<FoldHasher>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::BuildHasher;

    #[test]
    fn test_session_ids_increase() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(b > a);
    }

    #[test]
    fn test_addr_key_ignores_ipv6_scope() {
        let ip: std::net::Ipv6Addr = "fe80::1".parse().unwrap();
        let a = SocketAddr::V6(std::net::SocketAddrV6::new(ip, 443, 0, 2));
        let b = SocketAddr::V6(std::net::SocketAddrV6::new(ip, 443, 0, 0));
        assert_eq!(AddrKey::from(a), AddrKey::from(b));
        assert_ne!(AddrKey::from(b), AddrKey::new(IpAddr::V6(ip), 80));
    }

    #[test]
    fn test_fingerprint_folds_case() {
        assert_eq!(HostnameFingerprint::of("A.Example"), HostnameFingerprint::of("a.example"));
        assert_ne!(HostnameFingerprint::of("a.example"), HostnameFingerprint::of("b.example"));
    }

    #[test]
    fn test_fingerprint_hash_is_fold() {
        let fp = HostnameFingerprint::of("origin.example");
        let hasher = FingerprintBuildHasher::default();
        assert_eq!(hasher.hash_one(fp), fp.fold());
    }
}
