//! Utilities for exercising `wireproxy` connections without an engine.
//!
//! [`MockPeer`] plays the messaging engine: it records every request,
//! answers from scripted replies and can push transmissions back through a
//! conversation's receive listener. [`replies`] builds the bodies an engine
//! would send. [`callbacks`] records what consumer callbacks and
//! connection listeners are told.
//!
//! ```rust
//! use wireproxy::connection::Connection;
//! use wireproxy_testing::MockPeer;
//!
//! # async fn demo() -> wireproxy::Result<()> {
//! let peer = MockPeer::at_level(9);
//! let connection = Connection::builder(peer.conversation()).connect().await?;
//! assert!(!connection.is_closed());
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod logging;
pub mod peer;
pub mod replies;

pub use callbacks::{InCallback, RecordingCallback, RecordingListener, eventually, within};
pub use logging::{LoggerHandle, logger};
pub use peer::{MockConversation, MockPeer, Recorded};
