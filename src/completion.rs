//! Completion codes and the ordered exception cascade.
//!
//! A reply either arrives on the expected reply segment (success) or on the
//! exception segment carrying a numeric completion code and the peer's
//! message. Each operation probes the code against its own list of
//! exception kinds, in a fixed order, and the first match wins. A code that
//! matches nothing in the list becomes [`ProxyError::Error`].

use log::debug;

use crate::{
    codec::{CodecError, ReplyBuffer},
    error::{ProxyError, Result},
    protocol::Segment,
};

/// Completion code of a successful reply.
pub const NO_EXCEPTION: i16 = 0;

/// Exception kinds a completion code can denote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    IncorrectCall,
    InvalidDestinationPrefix,
    DiscriminatorSyntax,
    SelectorSyntax,
    InsufficientData,
    Authentication,
    NotPossibleInCurrentConfiguration,
    NotAuthorised,
    SessionUnavailable,
    SessionDropped,
    DurableSubscriptionAlreadyExists,
    DurableSubscriptionMismatch,
    DurableSubscriptionNotFound,
    ConnectionUnavailable,
    ConnectionDropped,
    DestinationLocked,
    TemporaryDestinationNotFound,
    Message,
    Resource,
    LimitExceeded,
    ConnectionLost,
    Rollback,
    NotSupported,
    Error,
    CommandInvocationFailed,
    MessageNotLocked,
    Xa,
}

impl ExceptionKind {
    /// Completion code carried on the wire for this kind.
    #[must_use]
    pub const fn code(self) -> i16 {
        match self {
            Self::IncorrectCall => 0x02,
            Self::InvalidDestinationPrefix => 0x03,
            Self::DiscriminatorSyntax => 0x04,
            Self::SelectorSyntax => 0x05,
            Self::InsufficientData => 0x06,
            Self::Authentication => 0x07,
            Self::NotPossibleInCurrentConfiguration => 0x08,
            Self::NotAuthorised => 0x09,
            Self::SessionUnavailable => 0x0A,
            Self::SessionDropped => 0x0B,
            Self::DurableSubscriptionAlreadyExists => 0x0C,
            Self::DurableSubscriptionMismatch => 0x0D,
            Self::DurableSubscriptionNotFound => 0x0E,
            Self::ConnectionUnavailable => 0x0F,
            Self::ConnectionDropped => 0x10,
            Self::DestinationLocked => 0x13,
            Self::TemporaryDestinationNotFound => 0x14,
            Self::Message => 0x15,
            Self::Resource => 0x16,
            Self::LimitExceeded => 0x17,
            Self::ConnectionLost => 0x18,
            Self::Rollback => 0x19,
            Self::NotSupported => 0x1A,
            Self::Error => 0x1D,
            Self::CommandInvocationFailed => 0x1E,
            Self::MessageNotLocked => 0x1F,
            Self::Xa => 0x101,
        }
    }

    /// Build the error this kind stands for.
    #[must_use]
    pub fn into_error(self, message: String) -> ProxyError {
        match self {
            Self::IncorrectCall => ProxyError::IncorrectCall(message),
            Self::InvalidDestinationPrefix => ProxyError::InvalidDestinationPrefix(message),
            Self::DiscriminatorSyntax => ProxyError::DiscriminatorSyntax(message),
            Self::SelectorSyntax => ProxyError::SelectorSyntax(message),
            Self::InsufficientData => ProxyError::InsufficientData(message),
            Self::Authentication => ProxyError::Authentication(message),
            Self::NotPossibleInCurrentConfiguration => {
                ProxyError::NotPossibleInCurrentConfiguration(message)
            }
            Self::NotAuthorised => ProxyError::NotAuthorised(message),
            Self::SessionUnavailable => ProxyError::SessionUnavailable(message),
            Self::SessionDropped => ProxyError::SessionDropped(message),
            Self::DurableSubscriptionAlreadyExists => {
                ProxyError::DurableSubscriptionAlreadyExists(message)
            }
            Self::DurableSubscriptionMismatch => ProxyError::DurableSubscriptionMismatch(message),
            Self::DurableSubscriptionNotFound => ProxyError::DurableSubscriptionNotFound(message),
            Self::ConnectionUnavailable => ProxyError::ConnectionUnavailable(message),
            Self::ConnectionDropped => ProxyError::ConnectionDropped(message),
            Self::DestinationLocked => ProxyError::DestinationLocked(message),
            Self::TemporaryDestinationNotFound => ProxyError::TemporaryDestinationNotFound(message),
            Self::Message => ProxyError::Message(message),
            Self::Resource => ProxyError::Resource(message),
            Self::LimitExceeded => ProxyError::LimitExceeded(message),
            Self::ConnectionLost => ProxyError::ConnectionLost(message),
            Self::Rollback => ProxyError::Rollback(message),
            Self::NotSupported => ProxyError::NotSupported(message),
            Self::Error | Self::Xa => ProxyError::Error(message),
            Self::CommandInvocationFailed => ProxyError::CommandInvocationFailed(message),
            Self::MessageNotLocked => ProxyError::MessageNotLocked(message),
        }
    }
}

/// Ordered probe lists, one per operation.
#[allow(clippy::enum_glob_use, reason = "cascades read as plain lists of kinds")]
pub mod cascade {
    use super::ExceptionKind::{self, *};

    pub const CREATE_BROWSER: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        SelectorSyntax,
        DiscriminatorSyntax,
        TemporaryDestinationNotFound,
        NotPossibleInCurrentConfiguration,
        Error,
    ];

    pub const CREATE_PRODUCER: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        NotPossibleInCurrentConfiguration,
        TemporaryDestinationNotFound,
        IncorrectCall,
        DiscriminatorSyntax,
        Error,
    ];

    pub const CREATE_CONSUMER: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        DestinationLocked,
        TemporaryDestinationNotFound,
        NotPossibleInCurrentConfiguration,
        SelectorSyntax,
        DiscriminatorSyntax,
        Error,
    ];

    pub const CREATE_BIFURCATED: &[ExceptionKind] = &[
        SessionUnavailable,
        SessionDropped,
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        Error,
    ];

    pub const CREATE_DURABLE: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        NotPossibleInCurrentConfiguration,
        DurableSubscriptionAlreadyExists,
        SelectorSyntax,
        DiscriminatorSyntax,
        Error,
    ];

    pub const CONSUME_DURABLE: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        DurableSubscriptionNotFound,
        DurableSubscriptionMismatch,
        DestinationLocked,
        Error,
    ];

    pub const DELETE_DURABLE: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        NotAuthorised,
        IncorrectCall,
        DurableSubscriptionNotFound,
        DestinationLocked,
        Error,
    ];

    pub const DESTINATION_CONFIGURATION: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        NotAuthorised,
        IncorrectCall,
        TemporaryDestinationNotFound,
        NotPossibleInCurrentConfiguration,
        Error,
    ];

    pub const CREATE_TEMPORARY: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        InvalidDestinationPrefix,
        Error,
    ];

    pub const DELETE_TEMPORARY: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        NotAuthorised,
        DestinationLocked,
        TemporaryDestinationNotFound,
        Error,
    ];

    pub const CLONE: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        Error,
    ];

    /// Unique ids, XA open and other simple connection-scoped flows.
    pub const CONNECTION_SIMPLE: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        Error,
    ];

    pub const CONNECT: &[ExceptionKind] = &[
        Authentication,
        NotAuthorised,
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        Error,
    ];

    pub const CLOSE: &[ExceptionKind] = &[
        Resource,
        ConnectionLost,
        ConnectionUnavailable,
        ConnectionDropped,
        Error,
    ];

    pub const SEND: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        TemporaryDestinationNotFound,
        NotPossibleInCurrentConfiguration,
        Error,
    ];

    pub const RECEIVE: &[ExceptionKind] = &[
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        DestinationLocked,
        TemporaryDestinationNotFound,
        NotPossibleInCurrentConfiguration,
        Error,
    ];

    pub const SESSION_RECEIVE: &[ExceptionKind] = &[
        SessionUnavailable,
        SessionDropped,
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        NotAuthorised,
        IncorrectCall,
        Error,
    ];

    /// Start, stop and unlock-all on a session.
    pub const SESSION_CONTROL: &[ExceptionKind] = &[
        SessionUnavailable,
        SessionDropped,
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        Error,
    ];

    pub const SESSION_CLOSE: &[ExceptionKind] = &[ConnectionDropped, Resource, ConnectionLost, Error];

    pub const UNLOCK_SET: &[ExceptionKind] = &[
        SessionUnavailable,
        SessionDropped,
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        IncorrectCall,
        MessageNotLocked,
        Error,
    ];

    pub const DELETE_SET: &[ExceptionKind] = &[
        SessionUnavailable,
        SessionDropped,
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        LimitExceeded,
        IncorrectCall,
        MessageNotLocked,
        Error,
    ];

    pub const TRANSACTION: &[ExceptionKind] = &[
        IncorrectCall,
        Rollback,
        ConnectionUnavailable,
        ConnectionDropped,
        Resource,
        ConnectionLost,
        Error,
    ];
}

impl ReplyBuffer {
    /// Read the completion code without consuming the exception body.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedSegment`] when the reply arrived on
    /// neither `expected` nor the exception segment.
    pub fn completion_code(&self, expected: Segment) -> std::result::Result<i16, CodecError> {
        if self.segment() == expected {
            return Ok(NO_EXCEPTION);
        }
        if self.segment() != Segment::EXCEPTION {
            return Err(CodecError::UnexpectedSegment {
                expected,
                found: self.segment(),
            });
        }
        let mut peek = self.clone();
        let _count = peek.get_u16()?;
        peek.get_i16()
    }

    /// Consume an exception body and return its code and message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the body is malformed.
    pub fn read_exception(&mut self) -> std::result::Result<(i16, String), CodecError> {
        let _count = self.get_u16()?;
        let code = self.get_i16()?;
        let message = self.get_string()?;
        Ok((code, message))
    }

    /// Fail with the first kind in `cascade` whose code the reply carries.
    ///
    /// Succeeds when the reply arrived on `expected`.
    ///
    /// # Errors
    ///
    /// Returns the matching [`ProxyError`], [`ProxyError::Error`] for a code
    /// outside `cascade`, or [`ProxyError::Codec`] for a malformed reply.
    pub fn check_completion(&mut self, expected: Segment, cascade: &[ExceptionKind]) -> Result<()> {
        let code = self.completion_code(expected)?;
        if code == NO_EXCEPTION {
            return Ok(());
        }
        let (code, message) = self.read_exception()?;
        debug!("reply for {expected} carried completion code {code:#x}");
        Err(resolve(code, message, cascade))
    }
}

/// Map `code` through `cascade`, falling back to a generic error.
#[must_use]
pub fn resolve(code: i16, message: String, cascade: &[ExceptionKind]) -> ProxyError {
    cascade
        .iter()
        .find(|kind| kind.code() == code)
        .map_or_else(
            || ProxyError::Error(format!("completion code {code:#x}: {message}")),
            |kind| kind.into_error(message.clone()),
        )
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ExceptionKind::DestinationLocked.code(), "destination locked")]
    #[case(ExceptionKind::ConnectionLost.code(), "connection lost")]
    #[case(ExceptionKind::DurableSubscriptionNotFound.code(), "internal error")]
    fn consumer_cascade_maps_codes(#[case] code: i16, #[case] prefix: &str) {
        let err = resolve(code, "peer says no".into(), cascade::CREATE_CONSUMER);
        assert!(err.to_string().starts_with(prefix), "{err}");
    }

    #[test]
    fn first_matching_kind_wins() {
        let cascade = [ExceptionKind::Resource, ExceptionKind::Resource];
        let err = resolve(ExceptionKind::Resource.code(), "full".into(), &cascade);
        assert!(matches!(err, ProxyError::Resource(message) if message == "full"));
    }

    #[test]
    fn unknown_code_falls_through_to_default() {
        let err = resolve(0x7777, "odd".into(), cascade::CLOSE);
        assert!(matches!(err, ProxyError::Error(message) if message.contains("0x7777")));
    }
}
