//! The transport seam.
//!
//! A [`Conversation`] is one logical conversation over a shared physical
//! link. It correlates request/reply exchanges, carries fire-and-forget
//! sends, clones sibling conversations over the same link and delivers
//! unsolicited pushes to a [`ReceiveListener`]. Socket handling, framing and
//! link-level retries live behind this trait.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::TransportError,
    protocol::{HandshakeProperties, Segment},
};

/// A reply correlated with an exchanged request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub segment: Segment,
    pub payload: Bytes,
}

impl Reply {
    #[must_use]
    pub fn new(segment: Segment, payload: impl Into<Bytes>) -> Self {
        Self {
            segment,
            payload: payload.into(),
        }
    }
}

/// Scheduling priority of a transmission on the shared link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Link priority used to carry a message of the given message priority.
    #[must_use]
    pub const fn for_message(priority: u8) -> Self {
        match priority {
            0..=3 => Self::Low,
            4..=6 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// Receives pushes the peer sends without a matching request.
#[async_trait]
pub trait ReceiveListener: Send + Sync + 'static {
    /// Handle one pushed transmission.
    async fn data_received(&self, segment: Segment, payload: Bytes);
}

/// One logical conversation with the messaging engine.
#[async_trait]
pub trait Conversation: Send + Sync + fmt::Debug + 'static {
    /// Identifier of this conversation on its link.
    fn id(&self) -> u32;

    /// Properties negotiated when the link was established.
    fn handshake(&self) -> HandshakeProperties;

    /// Route future pushes on this conversation to `listener`.
    fn set_receive_listener(&self, listener: Arc<dyn ReceiveListener>);

    /// Send `request` and wait for the correlated reply.
    async fn exchange(
        &self,
        segment: Segment,
        priority: Priority,
        request: Bytes,
    ) -> Result<Reply, TransportError>;

    /// Send `request` without waiting for a reply.
    async fn send(
        &self,
        segment: Segment,
        priority: Priority,
        request: Bytes,
    ) -> Result<(), TransportError>;

    /// Open a sibling conversation over the same physical link.
    async fn clone_conversation(
        &self,
        listener: Arc<dyn ReceiveListener>,
    ) -> Result<Arc<dyn Conversation>, TransportError>;

    /// Close the conversation, flushing outstanding transmissions.
    async fn close(&self) -> Result<(), TransportError>;

    /// Close the conversation without waiting for outstanding work.
    async fn fast_close(&self);
}
