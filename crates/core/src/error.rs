//! Receive error model.

use std::time::Duration;

use thiserror::Error;

use crate::id::PartitionId;

/// Result type used across the receive path.
pub type ReceiveResult<T> = Result<T, ReceiveError>;

/// An opaque fault reported by the transport underneath a partition link.
///
/// The receive path never retries these; retry policy belongs to whoever owns
/// the transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport fault: {message}")]
pub struct TransportError {
    message: String,
    partition: Option<PartitionId>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partition: None,
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn partition(&self) -> Option<&PartitionId> {
        self.partition.as_ref()
    }
}

/// Receive-level error.
///
/// An empty batch is never an error: it is the result of a timeout with nothing
/// new to deliver. Everything in here is a genuine failure of the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    /// The starting position is malformed (local, not retryable).
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// A consumer group or partition identifier was invalid.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A call argument (batch size, configuration value) was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The partition link did not finish opening within the open timeout.
    #[error("receiver for partition {partition} not ready after {waited:?}")]
    NotReady {
        partition: PartitionId,
        waited: Duration,
    },

    /// The partition link was closed by the transport.
    #[error("link for partition {partition} was closed")]
    LinkClosed { partition: PartitionId },

    /// The receiver itself was closed.
    #[error("receiver is closed")]
    Closed,

    /// Lower-layer fault, surfaced as-is.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReceiveError {
    pub fn invalid_position(msg: impl Into<String>) -> Self {
        Self::InvalidPosition(msg.into())
    }

    pub fn invalid_identifier(msg: impl Into<String>) -> Self {
        Self::InvalidIdentifier(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(TransportError::new(msg))
    }

    /// Whether the same call may succeed later without any change by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    /// Whether the receiver must be reopened (or replaced) before it can be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LinkClosed { .. } | Self::Closed)
    }
}
