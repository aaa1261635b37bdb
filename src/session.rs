//! Sessions created by a [`Connection`](crate::connection::Connection).
//!
//! Consumer sessions carry the full start/stop/callback state machine.
//! Producer, browser and bifurcated consumer sessions are thin proxies that
//! flow each call to the peer.

mod bifurcated;
mod browser;
mod common;
mod consumer;
mod producer;

pub use bifurcated::BifurcatedConsumerSession;
pub use browser::BrowserSession;
pub(crate) use common::SessionCore;
pub use consumer::{CallbackRegistration, ConsumerCallback, ConsumerSession, SessionState};
pub(crate) use consumer::{ConsumerParts, ConsumerSessionInner};
pub use producer::ProducerSession;
