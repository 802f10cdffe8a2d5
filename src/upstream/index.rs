//! Keyed indices over idle sessions
//!
//! A [`KeyedIndex`] maps a key to an insertion-ordered chain of session
//! handles. The chain links live in a side table keyed by handle, so removal
//! is O(1) without scanning the bucket and without pointers between sessions.
//! The pool keeps two of them: [`AddrIndex`] and [`HostnameIndex`].

use crate::error::{Error, Result};
use crate::upstream::keys::{AddrKey, FingerprintBuildHasher, HostnameFingerprint, SessionId};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use tracing::trace;

/// Describes how one index keys its sessions
pub trait Linkage {
    type Key: Copy + Eq + Hash + fmt::Display;
    type BuildHasher: BuildHasher + Default;

    /// Index name used in logs and errors
    const NAME: &'static str;
}

/// Sessions keyed by destination address and port
pub struct AddrLinkage;

impl Linkage for AddrLinkage {
    type Key = AddrKey;
    type BuildHasher = RandomState;
    const NAME: &'static str = "address";
}

/// Sessions keyed by hostname fingerprint; the bucket hash is the fingerprint fold
pub struct HostnameLinkage;

impl Linkage for HostnameLinkage {
    type Key = HostnameFingerprint;
    type BuildHasher = FingerprintBuildHasher;
    const NAME: &'static str = "hostname";
}

pub type AddrIndex = KeyedIndex<AddrLinkage>;
pub type HostnameIndex = KeyedIndex<HostnameLinkage>;

#[derive(Debug, Clone, Copy)]
struct Link<K> {
    key: K,
    prev: Option<SessionId>,
    next: Option<SessionId>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    head: SessionId,
    tail: SessionId,
    len: usize,
}

/// Hash-linked-list index of session handles
pub struct KeyedIndex<L: Linkage> {
    buckets: HashMap<L::Key, Bucket, L::BuildHasher>,
    links: HashMap<SessionId, Link<L::Key>>,
    _linkage: PhantomData<L>,
}

impl<L: Linkage> Default for KeyedIndex<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Linkage> KeyedIndex<L> {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::default(),
            links: HashMap::new(),
            _linkage: PhantomData,
        }
    }

    /// Append a session to the end of its key's chain.
    ///
    /// Inserting a session that is already linked is a contract violation.
    pub fn insert(&mut self, id: SessionId, key: L::Key) -> Result<()> {
        if self.links.contains_key(&id) {
            debug_assert!(false, "session {} already linked in {} index", id, L::NAME);
            return Err(Error::AlreadyIndexed { id, index: L::NAME });
        }

        let prev = match self.buckets.get_mut(&key) {
            Some(bucket) => {
                let old_tail = bucket.tail;
                bucket.tail = id;
                bucket.len += 1;
                if let Some(link) = self.links.get_mut(&old_tail) {
                    link.next = Some(id);
                }
                Some(old_tail)
            }
            None => {
                self.buckets.insert(key, Bucket { head: id, tail: id, len: 1 });
                None
            }
        };

        self.links.insert(id, Link { key, prev, next: None });
        trace!("Linked session {} into {} index under {}", id, L::NAME, key);
        Ok(())
    }

    /// Unlink a session. Returns false if it was not linked.
    pub fn remove(&mut self, id: SessionId) -> bool {
        let Some(link) = self.links.remove(&id) else {
            return false;
        };

        if let Some(prev) = link.prev {
            if let Some(prev_link) = self.links.get_mut(&prev) {
                prev_link.next = link.next;
            }
        }
        if let Some(next) = link.next {
            if let Some(next_link) = self.links.get_mut(&next) {
                next_link.prev = link.prev;
            }
        }

        let emptied = match self.buckets.get_mut(&link.key) {
            Some(bucket) => {
                bucket.len -= 1;
                if bucket.head == id {
                    if let Some(next) = link.next {
                        bucket.head = next;
                    }
                }
                if bucket.tail == id {
                    if let Some(prev) = link.prev {
                        bucket.tail = prev;
                    }
                }
                bucket.len == 0
            }
            None => false,
        };
        if emptied {
            self.buckets.remove(&link.key);
        }

        trace!("Unlinked session {} from {} index under {}", id, L::NAME, link.key);
        true
    }

    /// First session linked under `key`, oldest first.
    pub fn find_first(&self, key: &L::Key) -> Option<SessionId> {
        self.buckets.get(key).map(|bucket| bucket.head)
    }

    /// Session linked after `previous` under the same key.
    ///
    /// Returns `None` when `previous` is the last match, is not linked, or is
    /// linked under a different key.
    pub fn find_next(&self, previous: SessionId, key: &L::Key) -> Option<SessionId> {
        self.links
            .get(&previous)
            .filter(|link| link.key == *key)
            .and_then(|link| link.next)
    }

    /// Iterate every session linked under `key` in insertion order.
    pub fn iter_key<'a>(&'a self, key: &L::Key) -> impl Iterator<Item = SessionId> + 'a {
        let key = *key;
        let mut cursor = self.find_first(&key);
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = self.find_next(current, &key);
            Some(current)
        })
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn key_of(&self, id: SessionId) -> Option<L::Key> {
        self.links.get(&id).map(|link| link.key)
    }

    /// Number of sessions linked under `key`.
    pub fn count(&self, key: &L::Key) -> usize {
        self.buckets.get(key).map_or(0, |bucket| bucket.len)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.links.clear();
    }
}
