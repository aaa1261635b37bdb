//! The table of in-flight XA branches.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use super::{XaFlags, XaResource, Xid};
use crate::error::XaError;

/// Bookkeeping for one branch between `start` and its terminal outcome.
pub(crate) struct Branch {
    pub(super) owner: XaResource,
    pub(super) transaction_id: i32,
    pub(super) server_created: bool,
    pub(super) joined: usize,
    pub(super) primary_ended: bool,
    pub(super) end_processed: bool,
    pub(super) end_owed: bool,
    pub(super) end_flags: XaFlags,
    pub(super) prepared: bool,
}

impl Branch {
    pub(super) fn new(owner: XaResource, transaction_id: i32, server_created: bool) -> Self {
        Self {
            owner,
            transaction_id,
            server_created,
            joined: 0,
            primary_ended: false,
            end_processed: false,
            end_owed: false,
            end_flags: XaFlags::NO_FLAGS,
            prepared: false,
        }
    }
}

/// Maps each [`Xid`] to the resource that owns its branch.
///
/// Completion calls consult the table to find the owner, so a transaction
/// manager may complete a branch through any resource sharing the table.
/// The lock is held only for single lookups and updates, never across a
/// flow.
#[derive(Default)]
pub struct XidTable {
    branches: Mutex<HashMap<Xid, Branch>>,
}

impl fmt::Debug for XidTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XidTable").field("branches", &self.len()).finish()
    }
}

impl XidTable {
    /// A table private to the caller.
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// The process-wide table connections use unless given another.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<XidTable>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(XidTable::new))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Xid, Branch>> {
        self.branches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of branches awaiting a terminal outcome.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    #[must_use]
    pub fn contains(&self, xid: &Xid) -> bool { self.lock().contains_key(xid) }

    /// The resource currently owning `xid`.
    #[must_use]
    pub fn owner(&self, xid: &Xid) -> Option<XaResource> {
        self.lock().get(xid).map(|branch| branch.owner.clone())
    }

    pub(super) fn register(&self, xid: Xid, branch: Branch) -> Result<(), XaError> {
        let mut branches = self.lock();
        if branches.contains_key(&xid) {
            return Err(XaError::DuplicateXid);
        }
        branches.insert(xid, branch);
        Ok(())
    }

    pub(super) fn with_branch<R>(&self, xid: &Xid, f: impl FnOnce(&mut Branch) -> R) -> Option<R> {
        self.lock().get_mut(xid).map(f)
    }

    pub(super) fn remove(&self, xid: &Xid) -> bool { self.lock().remove(xid).is_some() }
}
