//! Client-side queues for messages the peer pushes to consumer sessions.
//!
//! Every conversation owns one [`ProxyQueueGroup`]. A consumer session that
//! reads ahead, or that has a callback registered, gets a [`ProxyQueue`] in
//! that group keyed by the session's [`ProxyId`](crate::registry::ProxyId).
//! Read-ahead queues buffer pushed messages for synchronous receives;
//! asynchronous queues run a delivery task that hands batches to the
//! session's callback while honouring the active-message limit.

mod delivery;
mod group;
mod queue;

pub(crate) use delivery::panic_message;
pub use group::ProxyQueueGroup;
pub use queue::{DeliveryLimits, ProxyQueue, QueueKind};
