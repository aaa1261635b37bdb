//! Consumer session states and the deferred callback-context state machine.

use super::CallbackRegistration;

/// Lifecycle state of a consumer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Started,
    Stopping,
    /// A start arrived while a stop was in progress; the session restarts
    /// once the stop completes.
    StoppingThenStarted,
    Closing,
    Closed,
}

impl SessionState {
    /// Returns true once a close has begun.
    #[must_use]
    pub const fn is_closed(self) -> bool { matches!(self, Self::Closing | Self::Closed) }
}

/// What a callback asked for while it ran.
///
/// Calls made from inside a callback only move this state; the recorded
/// actions are replayed once the callback returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum CallbackThreadState {
    #[default]
    StartedRegistered,
    StartedDeregistered,
    StoppedRegistered,
    StoppedDeregistered,
    Closed,
}

impl CallbackThreadState {
    pub(crate) const fn started(self) -> Self {
        match self {
            Self::StoppedRegistered => Self::StartedRegistered,
            Self::StoppedDeregistered => Self::StartedDeregistered,
            other => other,
        }
    }

    pub(crate) const fn stopped(self) -> Self {
        match self {
            Self::StartedRegistered => Self::StoppedRegistered,
            Self::StartedDeregistered => Self::StoppedDeregistered,
            other => other,
        }
    }

    pub(crate) const fn registered(self) -> Self {
        match self {
            Self::StoppedDeregistered => Self::StoppedRegistered,
            other => other,
        }
    }

    pub(crate) const fn deregistered(self) -> Self {
        match self {
            Self::StoppedRegistered => Self::StoppedDeregistered,
            other => other,
        }
    }

    pub(crate) const fn is_started(self) -> bool {
        matches!(self, Self::StartedRegistered | Self::StartedDeregistered)
    }
}

/// Callback-context state plus any registration stored by the callback.
#[derive(Clone, Default)]
pub(crate) struct CallbackIntent {
    pub(crate) state: CallbackThreadState,
    pub(crate) registration: Option<CallbackRegistration>,
}
