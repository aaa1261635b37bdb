//! Metric helpers for `wireproxy`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! every helper is a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open connections.
pub const CONNECTIONS_OPEN: &str = "wireproxy_connections_open";
/// Name of the gauge tracking open sessions, labelled by `kind`.
pub const SESSIONS_OPEN: &str = "wireproxy_sessions_open";
/// Name of the counter tracking request/reply exchanges, labelled by
/// `outcome`.
pub const EXCHANGES_TOTAL: &str = "wireproxy_exchanges_total";
/// Name of the counter tracking chunks of large messages sent.
pub const CHUNKS_SENT_TOTAL: &str = "wireproxy_chunks_sent_total";
/// Name of the counter tracking clone cache activity, labelled by `result`.
pub const CLONE_CACHE_TOTAL: &str = "wireproxy_clone_cache_total";

/// Kind of session counted in [`SESSIONS_OPEN`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Consumer,
    Producer,
    Browser,
    Bifurcated,
}

impl SessionKind {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            SessionKind::Consumer => "consumer",
            SessionKind::Producer => "producer",
            SessionKind::Browser => "browser",
            SessionKind::Bifurcated => "bifurcated",
        }
    }
}

/// How an exchange with the peer ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// A reply arrived, whatever its completion code.
    Replied,
    /// The transport failed before a reply arrived.
    Failed,
}

impl ExchangeOutcome {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            ExchangeOutcome::Replied => "replied",
            ExchangeOutcome::Failed => "failed",
        }
    }
}

/// What happened to a clone connection in the parent's cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneCacheResult {
    /// `clone_connection` reused a cached clone.
    Hit,
    /// `clone_connection` had to create a new clone.
    Miss,
    /// A reset clone was cached by its parent.
    Cached,
    /// A cached clone was destroyed with its parent.
    Destroyed,
}

impl CloneCacheResult {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            CloneCacheResult::Hit => "hit",
            CloneCacheResult::Miss => "miss",
            CloneCacheResult::Cached => "cached",
            CloneCacheResult::Destroyed => "destroyed",
        }
    }
}

/// Increment the open connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_OPEN).increment(1.0);
}

/// Decrement the open connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_OPEN).decrement(1.0);
}

/// Increment the open sessions gauge for `kind`.
pub fn inc_sessions(kind: SessionKind) {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_OPEN, "kind" => kind.as_str()).increment(1.0);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Decrement the open sessions gauge for `kind`.
pub fn dec_sessions(kind: SessionKind) {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_OPEN, "kind" => kind.as_str()).decrement(1.0);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Record an exchange with the peer.
pub fn inc_exchanges(outcome: ExchangeOutcome) {
    #[cfg(feature = "metrics")]
    counter!(EXCHANGES_TOTAL, "outcome" => outcome.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Record one chunk of a large message.
pub fn inc_chunks_sent() {
    #[cfg(feature = "metrics")]
    counter!(CHUNKS_SENT_TOTAL).increment(1);
}

/// Record clone cache activity.
pub fn clone_cache(result: CloneCacheResult) {
    #[cfg(feature = "metrics")]
    counter!(CLONE_CACHE_TOTAL, "result" => result.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = result;
}
