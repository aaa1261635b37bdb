//! Value types exchanged with the messaging engine.
//!
//! [`Message`] is opaque to the proxy layer apart from its priority and
//! reliability. Destinations, selection criteria and message handles are the
//! addressing vocabulary written into requests.

use std::collections::HashMap;

use bincode::{Decode, Encode};

use crate::error::{ProxyError, Result};

/// Quality of service of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub enum Reliability {
    None,
    BestEffortNonPersistent,
    ExpressNonPersistent,
    ReliableNonPersistent,
    ReliablePersistent,
    AssuredPersistent,
}

impl Reliability {
    /// Short written on the wire.
    #[must_use]
    pub const fn to_wire(self) -> i16 {
        match self {
            Self::None => 0,
            Self::BestEffortNonPersistent => 1,
            Self::ExpressNonPersistent => 2,
            Self::ReliableNonPersistent => 3,
            Self::ReliablePersistent => 4,
            Self::AssuredPersistent => 5,
        }
    }

    /// Parse a wire short.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Error`] for an unknown value.
    pub fn from_wire(value: i16) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::BestEffortNonPersistent,
            2 => Self::ExpressNonPersistent,
            3 => Self::ReliableNonPersistent,
            4 => Self::ReliablePersistent,
            5 => Self::AssuredPersistent,
            other => return Err(ProxyError::Error(format!("unknown reliability {other}"))),
        })
    }

    /// Returns true for the two lowest tiers, which never need a send reply
    /// on their own account.
    #[must_use]
    pub const fn is_low_assurance(self) -> bool {
        matches!(self, Self::BestEffortNonPersistent | Self::ExpressNonPersistent)
    }
}

/// Kind of destination addressed by a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DestinationType {
    Queue,
    TopicSpace,
    Port,
    Service,
}

impl DestinationType {
    /// Short written on the wire.
    #[must_use]
    pub const fn to_wire(self) -> i16 {
        match self {
            Self::Queue => 0,
            Self::TopicSpace => 1,
            Self::Port => 2,
            Self::Service => 3,
        }
    }

    /// Parse a wire short; the "no destination type" sentinel yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Error`] for an unknown value.
    pub fn from_wire(value: i16) -> Result<Option<Self>> {
        Ok(match value {
            crate::protocol::NO_DESTINATION_TYPE => None,
            0 => Some(Self::Queue),
            1 => Some(Self::TopicSpace),
            2 => Some(Self::Port),
            3 => Some(Self::Service),
            other => return Err(ProxyError::Error(format!("unknown destination type {other}"))),
        })
    }
}

/// Address of a destination on the bus.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DestinationAddress {
    pub name: String,
    pub bus: Option<String>,
    pub engine_uuid: Option<String>,
    pub local_only: bool,
    pub temporary: bool,
}

impl DestinationAddress {
    /// Address a destination by name on the local bus.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Syntax of a selector string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectorDomain {
    #[default]
    Sims,
    Jms,
    XPath,
}

impl SelectorDomain {
    pub(crate) const fn to_wire(self) -> i16 {
        match self {
            Self::Sims => 0,
            Self::Jms => 1,
            Self::XPath => 2,
        }
    }
}

/// Discriminator and selector restricting what a consumer receives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub discriminator: Option<String>,
    pub selector: Option<String>,
    pub domain: SelectorDomain,
}

/// Locks a delivered message until it is deleted or unlocked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct MessageHandle {
    pub engine_id: u64,
    pub value: u64,
}

impl MessageHandle {
    #[must_use]
    pub const fn new(engine_id: u64, value: u64) -> Self { Self { engine_id, value } }
}

/// A message as seen by the proxy layer.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Message {
    pub handle: Option<MessageHandle>,
    pub priority: u8,
    pub reliability: Reliability,
    pub body: Vec<u8>,
}

impl Message {
    /// Build a message with default priority and no handle.
    #[must_use]
    pub fn new(reliability: Reliability, body: impl Into<Vec<u8>>) -> Self {
        Self {
            handle: None,
            priority: 4,
            reliability,
            body: body.into(),
        }
    }

    /// Attach the handle assigned by the engine.
    #[must_use]
    pub fn with_handle(mut self, handle: MessageHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

/// How a temporary destination distributes messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    One,
    All,
}

impl Distribution {
    pub(crate) const fn to_wire(self) -> i16 {
        match self {
            Self::One => 0,
            Self::All => 1,
        }
    }
}

/// How long a synchronous receive may wait.
///
/// On the wire `-1` means wait indefinitely, `0` means do not wait and a
/// positive value is a bound in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveTimeout {
    NoWait,
    Indefinite,
    Millis(u64),
}

impl ReceiveTimeout {
    /// Interpret a caller-supplied millisecond value.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IncorrectCall`] for values below `-1`.
    pub fn from_millis(timeout: i64) -> Result<Self> {
        match timeout {
            -1 => Ok(Self::Indefinite),
            0 => Ok(Self::NoWait),
            t if t > 0 => Ok(Self::Millis(t.unsigned_abs())),
            t => Err(ProxyError::incorrect_call(format!("invalid receive timeout {t}"))),
        }
    }

    /// Value written on the wire.
    #[must_use]
    pub fn to_wire(self) -> i64 {
        match self {
            Self::NoWait => 0,
            Self::Indefinite => -1,
            Self::Millis(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
        }
    }

    /// Local wait bound; `None` waits forever.
    #[must_use]
    pub fn duration(self) -> Option<std::time::Duration> {
        match self {
            Self::NoWait => Some(std::time::Duration::ZERO),
            Self::Indefinite => None,
            Self::Millis(ms) => Some(std::time::Duration::from_millis(ms)),
        }
    }
}

/// Attributes of a destination as reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationConfiguration {
    pub default_priority: i32,
    pub max_failed_deliveries: i32,
    pub default_reliability: Option<Reliability>,
    pub max_reliability: Option<Reliability>,
    pub destination_type: Option<DestinationType>,
    pub flags: i16,
    pub uuid: String,
    pub description: String,
    pub exception_destination: Option<String>,
    pub name: String,
    pub context: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(-1, ReceiveTimeout::Indefinite, -1)]
    #[case(0, ReceiveTimeout::NoWait, 0)]
    #[case(250, ReceiveTimeout::Millis(250), 250)]
    fn receive_timeouts_encode(#[case] input: i64, #[case] parsed: ReceiveTimeout, #[case] wire: i64) {
        let timeout = ReceiveTimeout::from_millis(input).expect("valid timeout");
        assert_eq!(timeout, parsed);
        assert_eq!(timeout.to_wire(), wire);
    }

    #[test]
    fn timeouts_below_minus_one_are_rejected() {
        let err = ReceiveTimeout::from_millis(-2).expect_err("must reject");
        assert!(err.is_usage_error());
    }

    #[test]
    fn reliability_round_trips_through_wire_values() {
        for value in 0..=5 {
            let reliability = Reliability::from_wire(value).expect("known value");
            assert_eq!(reliability.to_wire(), value);
        }
        assert!(Reliability::from_wire(9).is_err());
    }

    #[test]
    fn missing_destination_type_is_none() {
        assert_eq!(DestinationType::from_wire(-1).expect("sentinel"), None);
        assert_eq!(
            DestinationType::from_wire(1).expect("topic space"),
            Some(DestinationType::TopicSpace)
        );
    }
}
