use serde::{Deserialize, Serialize};

/// All possible states of a command instance.
///
/// `Done`, `Cancelled` and `Expired` are terminal: once reached, no further
/// transition is allowed.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandState {
    /// Accepted and waiting for a handler.
    #[default]
    Queued,
    /// A handler is executing the command.
    InProgress,
    /// Execution is suspended.
    Paused,
    /// Execution failed; the command may still be retried or cancelled.
    Error,
    /// Execution finished successfully.
    Done,
    /// The command was cancelled before completion.
    Cancelled,
    /// The command expired before a handler picked it up.
    Expired,
}

impl core::fmt::Debug for CommandState {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

impl core::fmt::Display for CommandState {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

impl CommandState {
    /// Returns the state name as spelled on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "inProgress",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Returns whether the state is a sink.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Expired)
    }

    /// Returns whether a transition into `next` is allowed.
    ///
    /// Transitions are monotone terminal-forward: anything may move towards
    /// a terminal state, terminal states allow nothing.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        !self.is_terminal() && !matches!(next, Self::Queued)
    }
}

/// Where a command instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandOrigin {
    /// Issued by a nearby client over the local API.
    Local,
    /// Delivered by the cloud service.
    Cloud,
}
