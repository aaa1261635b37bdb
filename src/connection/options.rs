//! Optional arguments of connection operations.
//!
//! Every options type has a [`Default`] matching the engine's defaults, so
//! callers only name what they change:
//!
//! ```
//! use wireproxy::{connection::ConsumerOptions, message::Reliability};
//!
//! let options = ConsumerOptions {
//!     read_ahead: true,
//!     reliability: Some(Reliability::ReliablePersistent),
//!     ..ConsumerOptions::default()
//! };
//! assert!(!options.bifurcatable);
//! ```

use std::collections::HashMap;

use crate::{
    message::{DestinationType, Reliability, SelectionCriteria},
    ordering::OrderingContext,
};

/// Options for creating a consumer session.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub destination_type: Option<DestinationType>,
    pub criteria: Option<SelectionCriteria>,
    /// Only messages of this reliability are delivered.
    pub reliability: Option<Reliability>,
    /// Let the peer push messages ahead of synchronous receives.
    pub read_ahead: bool,
    pub no_local: bool,
    /// Reliability at and below which messages are not recovered.
    pub unrecoverable_reliability: Reliability,
    /// Allow bifurcated sessions to operate on this consumer's messages.
    pub bifurcatable: bool,
    pub ignore_initial_indoubts: bool,
    pub allow_gathering: bool,
    pub alternate_user: Option<String>,
    pub message_control_properties: Option<HashMap<String, String>>,
    /// Name of a shared subscription the consumer attaches to.
    pub subscription_name: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            destination_type: None,
            criteria: None,
            reliability: None,
            read_ahead: false,
            no_local: false,
            unrecoverable_reliability: Reliability::BestEffortNonPersistent,
            bifurcatable: false,
            ignore_initial_indoubts: true,
            allow_gathering: false,
            alternate_user: None,
            message_control_properties: None,
            subscription_name: None,
        }
    }
}

/// Options for creating a producer session.
#[derive(Clone, Debug, Default)]
pub struct ProducerOptions {
    pub destination_type: Option<DestinationType>,
    /// Context the session holds a use of until it closes.
    pub ordering: Option<OrderingContext>,
    pub discriminator: Option<String>,
    pub alternate_user: Option<String>,
    pub bind_to_queue_point: bool,
    pub prefer_local: bool,
}

/// Options for creating a browser session.
#[derive(Clone, Debug, Default)]
pub struct BrowserOptions {
    pub destination_type: Option<DestinationType>,
    pub criteria: Option<SelectionCriteria>,
    pub alternate_user: Option<String>,
    pub allow_gathering: bool,
}

/// Options for creating, or consuming from, a durable subscription.
#[derive(Clone, Debug, Default)]
pub struct DurableSubscriptionOptions {
    /// Engine that hosts the subscription.
    pub durable_home: Option<String>,
    pub criteria: Option<SelectionCriteria>,
    pub no_local: bool,
    /// Allow more than one consumer to attach at once.
    pub shared: bool,
    pub durable_user: Option<String>,
}

/// Options for sending through the connection.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub destination_type: Option<DestinationType>,
    pub ordering: Option<OrderingContext>,
    pub alternate_user: Option<String>,
}

/// Options for receiving through the connection.
#[derive(Clone, Debug)]
pub struct ReceiveOptions {
    pub destination_type: Option<DestinationType>,
    pub criteria: Option<SelectionCriteria>,
    pub reliability: Option<Reliability>,
    pub unrecoverable_reliability: Reliability,
    pub alternate_user: Option<String>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            destination_type: None,
            criteria: None,
            reliability: None,
            unrecoverable_reliability: Reliability::BestEffortNonPersistent,
            alternate_user: None,
        }
    }
}
