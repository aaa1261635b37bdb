//! Open connection counting and RAII guard.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide count of open connections.
static OPEN_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Counts a connection as open from creation until drop.
///
/// A connection holds one while open and drops it during teardown; a reset
/// clone taken from the cache gets a fresh one.
#[derive(Debug)]
pub(super) struct ActiveConnection;

impl ActiveConnection {
    pub(super) fn new() -> Self {
        OPEN_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_connections();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        OPEN_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_connections();
    }
}

/// Return the number of connections currently open in this process.
#[must_use]
pub fn open_connection_count() -> u64 { OPEN_CONNECTIONS.load(Ordering::Relaxed) }
