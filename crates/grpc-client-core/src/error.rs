//! Error taxonomy for the call engine.
//!
//! Four families of failures reach callers: usage errors (invalid call
//! sequences, reported synchronously), protocol errors carrying a non-OK
//! status, cancellation outcomes, and transport failures that were mapped to
//! a status. Internal orchestration never leaks panics or raw transport
//! errors past the terminal-resolution routine.

use thiserror::Error;

use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::TransportError;

/// Errors surfaced by call, reader, and writer operations.
#[derive(Debug, Error)]
pub enum CallError {
    /// The call finished with a non-OK gRPC status.
    #[error("call failed with status {status}")]
    Rpc {
        /// The terminal status of the call.
        status: Status,
        /// Trailers received with the terminal status.
        trailers: Metadata,
    },

    /// The call was cancelled cooperatively (caller signal, deadline, or
    /// disposal) and the channel is configured for cooperative reporting.
    #[error("call cancelled: {status}")]
    Cancelled {
        /// The status the cancellation resolved to.
        status: Status,
    },

    /// Operation attempted on a disposed call.
    #[error("call has been disposed")]
    Disposed,

    /// A read was started while a previous read was still outstanding.
    #[error("a read is already in progress")]
    ReadInProgress,

    /// A write was started while a previous write was still outstanding.
    #[error("a write is already in progress")]
    WriteInProgress,

    /// A write was attempted after the request stream was completed.
    #[error("request stream has already been completed")]
    WriteAfterComplete,

    /// The request stream was completed twice.
    #[error("request stream was already completed")]
    AlreadyCompleted,

    /// A start operation was invoked more than once on the same attempt.
    #[error("call attempt has already been started")]
    AlreadyStarted,

    /// The terminal status was requested before it was resolved.
    #[error("status is not available until the call has finished")]
    StatusNotResolved,

    /// Trailers were requested before the response finished.
    #[error("trailers are not available until the call has finished")]
    TrailersNotAvailable,

    /// The single-response future was consumed twice.
    #[error("response has already been taken")]
    ResponseAlreadyTaken,

    /// A call was started on a channel that has been shut down.
    #[error("channel has been shut down")]
    ChannelShutdown,

    /// An operation was invoked that the method's streaming shape does not
    /// support.
    #[error("operation is not supported by a {kind} call")]
    ShapeMismatch {
        /// The method's streaming shape.
        kind: &'static str,
    },

    /// The byte stream ended inside a frame header or payload.
    #[error("message truncated: expected {expected} bytes, got {got}")]
    MessageTruncated {
        /// Bytes the frame declared.
        expected: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// A frame declared a length above the configured receive limit.
    #[error("message of {size} bytes exceeds maximum of {max_size}")]
    MessageTooLarge {
        /// Declared payload length.
        size: usize,
        /// Configured maximum.
        max_size: usize,
    },

    /// The frame header was malformed.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// The pluggable serializer failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transport failed before a status could be obtained from the server.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    /// Returns the gRPC status carried by this error, if it has one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            CallError::Rpc { status, .. } => Some(status),
            CallError::Cancelled { status } => Some(status),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CallError>;
