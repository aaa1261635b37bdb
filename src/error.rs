//! Canonical error and result types for the crate.
//!
//! [`ProxyError`] is the single error surface of every connection, session
//! and transaction operation. Errors decoded from a peer's completion code
//! carry the peer's formatted message; errors raised locally carry a message
//! describing the misuse.

use thiserror::Error;

use crate::{chunk::ChunkError, codec::CodecError, config::ConfigError};

/// Top-level error type exposed by `wireproxy`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The caller violated an API or state-machine contract.
    #[error("incorrect call: {0}")]
    IncorrectCall(String),
    /// The operation needs a newer protocol level than the peer negotiated.
    #[error("operation requires protocol level {required}, peer negotiated {negotiated}")]
    ProtocolLevel { required: u16, negotiated: u16 },
    /// The session has been closed.
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),
    /// The session was closed by the peer.
    #[error("session dropped: {0}")]
    SessionDropped(String),
    /// The connection has been closed.
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),
    /// The conversation was dropped underneath the connection.
    #[error("connection dropped: {0}")]
    ConnectionDropped(String),
    /// The link to the peer failed while a request was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The peer reported a resource failure.
    #[error("resource failure: {0}")]
    Resource(String),
    /// A peer-side limit was reached.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    /// The user may not perform the operation.
    #[error("not authorised: {0}")]
    NotAuthorised(String),
    /// The supplied credentials were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The peer configuration does not allow the operation.
    #[error("not possible in current configuration: {0}")]
    NotPossibleInCurrentConfiguration(String),
    /// A temporary destination prefix was rejected.
    #[error("invalid destination prefix: {0}")]
    InvalidDestinationPrefix(String),
    /// A discriminator could not be parsed by the peer.
    #[error("discriminator syntax: {0}")]
    DiscriminatorSyntax(String),
    /// A selector could not be parsed by the peer.
    #[error("selector syntax: {0}")]
    SelectorSyntax(String),
    /// The peer needs more data than the request carried.
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    /// A durable subscription with the requested name already exists.
    #[error("durable subscription already exists: {0}")]
    DurableSubscriptionAlreadyExists(String),
    /// The durable subscription exists with different attributes.
    #[error("durable subscription mismatch: {0}")]
    DurableSubscriptionMismatch(String),
    /// The durable subscription does not exist.
    #[error("durable subscription not found: {0}")]
    DurableSubscriptionNotFound(String),
    /// The destination is locked by another consumer.
    #[error("destination locked: {0}")]
    DestinationLocked(String),
    /// The temporary destination does not exist.
    #[error("temporary destination not found: {0}")]
    TemporaryDestinationNotFound(String),
    /// The peer rejected the message itself.
    #[error("message rejected: {0}")]
    Message(String),
    /// The unit of work was rolled back.
    #[error("rollback: {0}")]
    Rollback(String),
    /// The peer does not support the request.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// An administrative command failed on the peer.
    #[error("command invocation failed: {0}")]
    CommandInvocationFailed(String),
    /// One of the message handles was not locked.
    #[error("message not locked: {0}")]
    MessageNotLocked(String),
    /// Unexpected internal failure, including unrecognised completion codes.
    #[error("internal error: {0}")]
    Error(String),
    /// An XA operation failed.
    #[error(transparent)]
    Xa(#[from] XaError),
    /// The wire codec could not read or write a field.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    /// Message slices arrived out of order.
    #[error("chunked message out of order: {0}")]
    Chunk(#[from] ChunkError),
    /// The supplied configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ProxyError {
    /// Build an [`IncorrectCall`](Self::IncorrectCall) error.
    pub(crate) fn incorrect_call(message: impl Into<String>) -> Self {
        Self::IncorrectCall(message.into())
    }

    /// Returns true for errors caused by the caller rather than the peer.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::IncorrectCall(_) | Self::ProtocolLevel { .. } | Self::Config(_)
        )
    }

    /// Returns true when the error means the peer can no longer be reached.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable(_) | Self::ConnectionDropped(_) | Self::ConnectionLost(_)
        )
    }
}

/// Failures reported by a [`Conversation`](crate::conversation::Conversation).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The conversation was closed locally or by the peer.
    #[error("conversation closed")]
    Closed,
    /// The underlying link dropped; no reply will arrive.
    #[error("conversation dropped: {0}")]
    Dropped(String),
    /// The link failed while the request was in flight.
    #[error("conversation lost: {0}")]
    Lost(String),
}

impl From<TransportError> for ProxyError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Closed => Self::ConnectionUnavailable(error.to_string()),
            TransportError::Dropped(_) => Self::ConnectionDropped(error.to_string()),
            TransportError::Lost(_) => Self::ConnectionLost(error.to_string()),
        }
    }
}

/// Standard XA error and outcome codes.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum XaError {
    /// `XA_RBROLLBACK`: the branch was rolled back.
    #[error("XA_RBROLLBACK: transaction branch rolled back")]
    RollbackOccurred,
    /// `XA_HEURRB`: the branch was heuristically rolled back.
    #[error("XA_HEURRB: transaction branch heuristically rolled back")]
    HeuristicRollback,
    /// `XA_HEURCOM`: the branch was heuristically committed.
    #[error("XA_HEURCOM: transaction branch heuristically committed")]
    HeuristicCommit,
    /// `XA_HEURMIX`: the branch was partly committed and partly rolled back.
    #[error("XA_HEURMIX: transaction branch heuristically mixed")]
    HeuristicMixed,
    /// `XAER_RMERR`: resource manager error.
    #[error("XAER_RMERR: resource manager error")]
    ResourceManagerError,
    /// `XAER_NOTA`: the Xid is not known.
    #[error("XAER_NOTA: unknown xid")]
    UnknownXid,
    /// `XAER_INVAL`: invalid arguments.
    #[error("XAER_INVAL: invalid arguments")]
    InvalidArguments,
    /// `XAER_PROTO`: the call violated the XA state protocol.
    #[error("XAER_PROTO: protocol violation")]
    Protocol,
    /// `XAER_RMFAIL`: the resource manager is unavailable; retry later.
    #[error("XAER_RMFAIL: resource manager failure")]
    ResourceManagerFailure,
    /// `XAER_DUPID`: the Xid already exists.
    #[error("XAER_DUPID: duplicate xid")]
    DuplicateXid,
    /// Any other code returned by the peer.
    #[error("XA error code {0}")]
    Other(i32),
}

impl XaError {
    /// Numeric code as defined by the XA specification.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::RollbackOccurred => 100,
            Self::HeuristicRollback => 6,
            Self::HeuristicCommit => 7,
            Self::HeuristicMixed => 5,
            Self::ResourceManagerError => -3,
            Self::UnknownXid => -4,
            Self::InvalidArguments => -5,
            Self::Protocol => -6,
            Self::ResourceManagerFailure => -7,
            Self::DuplicateXid => -8,
            Self::Other(code) => code,
        }
    }

    /// Map a numeric XA code onto the enum.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            100 => Self::RollbackOccurred,
            6 => Self::HeuristicRollback,
            7 => Self::HeuristicCommit,
            5 => Self::HeuristicMixed,
            -3 => Self::ResourceManagerError,
            -4 => Self::UnknownXid,
            -5 => Self::InvalidArguments,
            -6 => Self::Protocol,
            -7 => Self::ResourceManagerFailure,
            -8 => Self::DuplicateXid,
            other => Self::Other(other),
        }
    }

    /// Returns true for the `XA_RB*` range (100 to 107).
    #[must_use]
    pub const fn is_rollback(self) -> bool { matches!(self.code(), 100..=107) }

    /// Returns true for heuristic outcomes.
    #[must_use]
    pub const fn is_heuristic(self) -> bool {
        matches!(
            self,
            Self::HeuristicRollback | Self::HeuristicCommit | Self::HeuristicMixed
        )
    }
}

/// Canonical result alias used by `wireproxy` public APIs.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(XaError::RollbackOccurred)]
    #[case(XaError::HeuristicRollback)]
    #[case(XaError::Protocol)]
    #[case(XaError::ResourceManagerFailure)]
    #[case(XaError::DuplicateXid)]
    #[case(XaError::Other(42))]
    fn xa_codes_map_back(#[case] error: XaError) {
        assert_eq!(XaError::from_code(error.code()), error);
    }

    #[test]
    fn rollback_range_is_recognised() {
        assert!(XaError::from_code(104).is_rollback());
        assert!(!XaError::ResourceManagerFailure.is_rollback());
    }

    #[rstest]
    #[case(TransportError::Closed, "connection unavailable")]
    #[case(TransportError::Dropped("gone".into()), "connection dropped")]
    #[case(TransportError::Lost("reset".into()), "connection lost")]
    fn transport_errors_become_connection_failures(
        #[case] error: TransportError,
        #[case] prefix: &str,
    ) {
        let error = ProxyError::from(error);
        assert!(error.is_connection_failure());
        assert!(error.to_string().starts_with(prefix), "{error}");
    }

    #[test]
    fn usage_errors_are_classified() {
        assert!(ProxyError::incorrect_call("started").is_usage_error());
        assert!(
            ProxyError::ProtocolLevel {
                required: 9,
                negotiated: 5
            }
            .is_usage_error()
        );
        assert!(!ProxyError::Resource("disk".into()).is_usage_error());
    }
}
