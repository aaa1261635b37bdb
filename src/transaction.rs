//! Units of work that sends, receives and deletes can be enlisted in.
//!
//! A [`LocalTransaction`] is an uncoordinated transaction on one
//! connection. An [`XaResource`] takes part in a global transaction driven
//! by an external transaction manager; branches are tracked in an
//! [`XidTable`] shared by every resource that may complete them.
//!
//! When the peer requires optimized transactions, no flow creates the
//! server-side transaction up front. The first transacted request of a unit
//! of work carries a create flag instead, and XA `end` is deferred and
//! piggybacked on the next flow for the branch.

use std::sync::{Mutex, PoisonError};

mod local;
mod wire;
mod xa;
mod xid;
mod xid_table;

pub use local::LocalTransaction;
pub(crate) use wire::{ensure_valid, put_transaction};
pub use xa::XaResource;
pub use xid::{XaFlags, XaVote, Xid};
pub use xid_table::XidTable;

use crate::conversation::Priority;

/// A transaction passed to a transacted operation.
#[derive(Clone, Debug)]
pub enum Transaction {
    Local(LocalTransaction),
    Xa(XaResource),
}

impl From<LocalTransaction> for Transaction {
    fn from(transaction: LocalTransaction) -> Self { Self::Local(transaction) }
}

impl From<XaResource> for Transaction {
    fn from(resource: XaResource) -> Self { Self::Xa(resource) }
}

impl Transaction {
    /// Returns true while work can still be enlisted.
    ///
    /// A local transaction stops being valid once committed or rolled back;
    /// an XA resource is valid while enlisted in a branch.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Local(transaction) => transaction.is_valid(),
            Self::Xa(resource) => resource.is_enlisted(),
        }
    }

    /// Record the link priority of a send that went without a reply, so the
    /// completion flow does not overtake it.
    pub(crate) fn update_lowest_message_priority(&self, priority: Priority) {
        match self {
            Self::Local(transaction) => transaction.lowest_priority().record(priority),
            Self::Xa(resource) => resource.lowest_priority().record(priority),
        }
    }
}

/// Lowest link priority used by fire-and-forget sends in a unit of work.
#[derive(Debug, Default)]
pub(crate) struct LowestPriority(Mutex<Option<Priority>>);

impl LowestPriority {
    pub(crate) fn record(&self, priority: Priority) {
        let mut lowest = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *lowest = Some(lowest.map_or(priority, |current| current.min(priority)));
    }

    /// Priority for a completion flow: never above medium, and never above
    /// a recorded send.
    pub(crate) fn completion_priority(&self) -> Priority {
        let lowest = *self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lowest.map_or(Priority::Medium, |lowest| lowest.min(Priority::Medium))
    }
}

#[cfg(test)]
mod tests;
