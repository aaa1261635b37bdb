//! Registry of live consumer sessions.
//!
//! `SessionRegistry` stores non-owning weak references to consumer sessions
//! keyed by [`ProxyId`], so pushes from the peer can be routed to a session
//! without keeping it alive. Dead entries are pruned lazily at lookup time.

use std::{
    fmt,
    sync::{
        Weak,
        atomic::{AtomicU16, Ordering},
    },
};

use dashmap::DashMap;

use crate::session::{ConsumerSession, ConsumerSessionInner};

/// Identifier of a session or proxy queue on its conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(i16);

impl From<i16> for ProxyId {
    fn from(value: i16) -> Self { Self(value) }
}

impl ProxyId {
    #[must_use]
    pub const fn new(id: i16) -> Self { Self(id) }

    /// Value written on the wire.
    #[must_use]
    pub const fn as_i16(self) -> i16 { self.0 }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ProxyId({})", self.0) }
}

/// Hands out proxy ids in `1..=i16::MAX`, wrapping past the top.
#[derive(Debug)]
pub(crate) struct ProxyIdAllocator(AtomicU16);

impl Default for ProxyIdAllocator {
    fn default() -> Self { Self(AtomicU16::new(1)) }
}

impl ProxyIdAllocator {
    /// Next id for which `in_use` is false, or `None` once every id is taken.
    pub(crate) fn next_unused(&self, in_use: impl Fn(ProxyId) -> bool) -> Option<ProxyId> {
        (0..0x7FFF).map(|_| self.next()).find(|id| !in_use(*id))
    }

    pub(crate) fn next(&self) -> ProxyId {
        let raw = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                Some(if id >= 0x7FFF { 1 } else { id + 1 })
            })
            .unwrap_or(1);
        ProxyId(i16::try_from(raw).unwrap_or(1))
    }
}

/// Concurrent registry of consumer sessions keyed by [`ProxyId`].
#[derive(Default)]
pub struct SessionRegistry(DashMap<ProxyId, Weak<ConsumerSessionInner>>);

impl SessionRegistry {
    /// Retrieve the session registered under `id` if it is still alive.
    pub fn get(&self, id: &ProxyId) -> Option<ConsumerSession> {
        let guard = self.0.get(id);
        let session = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if session.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        session.map(ConsumerSession::from_arc)
    }

    /// Returns true while a live session is registered under `id`.
    #[must_use]
    pub fn contains_live(&self, id: &ProxyId) -> bool {
        self.0.get(id).is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Register a newly created session.
    pub fn insert(&self, id: ProxyId, session: &ConsumerSession) {
        self.0.insert(id, session.downgrade());
    }

    /// Remove a session, typically once it has closed.
    pub fn remove(&self, id: &ProxyId) { self.0.remove(id); }

    /// Number of registered entries, live or not.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Prune stale weak references, then collect the remaining live sessions.
    ///
    /// This holds per-bucket write locks while iterating.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<ConsumerSession> {
        let mut sessions = Vec::with_capacity(self.0.len());
        self.0.retain(|_, weak| {
            if let Some(inner) = weak.upgrade() {
                sessions.push(ConsumerSession::from_arc(inner));
                true
            } else {
                false
            }
        });
        sessions
    }

    /// Remove every entry and return the sessions that were still alive.
    #[must_use]
    pub fn drain(&self) -> Vec<ConsumerSession> {
        let sessions = self.active_sessions();
        self.0.clear();
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_skips_zero_when_wrapping() {
        let allocator = ProxyIdAllocator(AtomicU16::new(0x7FFF));
        assert_eq!(allocator.next(), ProxyId::new(0x7FFF));
        assert_eq!(allocator.next(), ProxyId::new(1));
        assert_eq!(allocator.next(), ProxyId::new(2));
    }

    #[test]
    fn allocator_skips_ids_in_use_after_wrapping() {
        let allocator = ProxyIdAllocator(AtomicU16::new(0x7FFF));
        let taken = [ProxyId::new(0x7FFF), ProxyId::new(1)];
        assert_eq!(allocator.next_unused(|id| taken.contains(&id)), Some(ProxyId::new(2)));
    }

    #[test]
    fn allocator_reports_exhaustion() {
        let allocator = ProxyIdAllocator::default();
        assert_eq!(allocator.next_unused(|_| true), None);
    }

    #[test]
    fn empty_registry_yields_nothing() {
        let registry = SessionRegistry::default();
        assert!(registry.get(&ProxyId::new(4)).is_none());
        assert!(registry.drain().is_empty());
        assert!(registry.is_empty());
    }
}
