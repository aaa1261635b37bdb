//! Protocol levels at which optional request fields and features appear.
//!
//! A field introduced at level `n` is only ever written when the peer
//! negotiated a level of at least `n`.

/// Start flows expect a reply.
pub const START_REPLY: u16 = 3;
/// Optimized transactions, ignore-initial-indoubts and XA recovery.
pub const OPTIMIZED_TRANSACTIONS: u16 = 5;
/// `unlockSet` carries the increment-lock-count byte (except at level 9).
pub const UNLOCK_INCREMENT: u16 = 7;
/// Chunked messages, connection reset, stoppable consumers, producer flags,
/// gathering consumers, message-control properties and destination listeners.
pub const CHUNKING: u16 = 9;
/// Consumer-set monitors.
pub const CONSUMER_SET_MONITOR: u16 = 14;
/// Shared (multi-consumer) subscriptions.
pub const SHARED_SUBSCRIPTIONS: u16 = 20;
