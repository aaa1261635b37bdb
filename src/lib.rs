#![doc(html_root_url = "https://docs.rs/wireproxy/latest")]
//! Public API for the `wireproxy` library.
//!
//! This crate is the client-side proxy layer of a remote messaging engine.
//! A [`Connection`] stands in for a connection on the engine and hands out
//! sessions and transactions; every operation is encoded as a request on a
//! [`Conversation`](conversation::Conversation) supplied by the transport,
//! and every reply is checked against the operation's exception cascade.

pub mod chunk;
pub mod codec;
pub mod completion;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod message;
pub mod metrics;
pub mod ordering;
pub mod protocol;
pub mod proxy_queue;
pub mod registry;
pub mod session;
pub mod transaction;

pub use config::ProxyConfig;
pub use connection::{Connection, ConnectionBuilder, ConnectionListener};
/// Result type alias re-exported for convenience.
pub use error::{ProxyError, Result};
pub use message::{DestinationAddress, Message, Reliability};
pub use session::{BifurcatedConsumerSession, BrowserSession, ConsumerSession, ProducerSession};
pub use transaction::{LocalTransaction, Transaction, XaResource};
