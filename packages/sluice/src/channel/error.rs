// channel error types.

use thiserror::Error;


// ==== base error types ====


/// Error for trying to use a channel which has been cancelled
///
/// A channel is cancelled explicitly through [`Channel::cancel`](crate::Channel::cancel) or
/// [`Continuation::cancel`](crate::Continuation::cancel), implicitly when the last handle on
/// either side is dropped, or when a consumer is dropped while parked waiting for a value.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("channel cancelled")]
pub struct CancelledError;

/// Error for attempting to receive with no or limited blocking, and the operation not completing
/// immediately or by the specified deadline
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("operation would block")]
pub struct WouldBlockError;


// ==== compound error types ====


/// Error for trying to send into a channel which has already terminated
///
/// Sending is only rejected this way once the channel has been finished, failed, or cancelled.
/// Sends rejected by a full buffer are not errors, see
/// [`YieldResult::Dropped`](crate::YieldResult::Dropped).
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("cannot send into terminated channel: {cause}")]
pub struct SendError<T> {
    /// The message that could not be sent
    pub msg: T,
    /// The reason the message could not be sent
    pub cause: CancelledError,
}

/// Terminal error for receiving from a channel
///
/// Graceful termination is not an error: it is represented by `Ok(None)`.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum NextError<E> {
    /// The channel was cancelled without a caller-supplied error
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    /// The producer failed the channel, or cancelled it with an error
    #[error("channel failed: {0}")]
    Failed(E),
}

impl<E> NextError<E> {
    /// Whether this is [`NextError::Cancelled`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NextError::Cancelled(_))
    }

    /// The producer-supplied error, if any
    pub fn into_failure(self) -> Option<E> {
        match self {
            NextError::Cancelled(_) => None,
            NextError::Failed(error) => Some(error),
        }
    }
}

/// Error for receiving from a channel with no or limited blocking
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TryNextError<E> {
    /// The channel has entered a terminal error state
    #[error("{0}")]
    Terminal(NextError<E>),
    /// The operation could not be resolved immediately or by the specified deadline
    #[error(transparent)]
    WouldBlock(#[from] WouldBlockError),
}

impl<E> From<NextError<E>> for TryNextError<E> {
    fn from(inner: NextError<E>) -> Self {
        TryNextError::Terminal(inner)
    }
}
