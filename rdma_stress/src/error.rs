//! Error types for the stress harness.
//!
//! Provider primitives speak `std::io::Error`; everything above the provider
//! boundary reports a [`StressError`]. Callers usually assert on
//! [`StressError::code`] rather than matching variants.

use std::io;

use thiserror::Error;

use crate::event::AsyncEventType;

/// Status family of a [`StressError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    InvalidArgument,
    Internal,
    Unavailable,
    NotFound,
    FailedPrecondition,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            StatusCode::Internal => write!(f, "INTERNAL"),
            StatusCode::Unavailable => write!(f, "UNAVAILABLE"),
            StatusCode::NotFound => write!(f, "NOT_FOUND"),
            StatusCode::FailedPrecondition => write!(f, "FAILED_PRECONDITION"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StressError {
    /// Out-of-bounds QP ids, unsupported QP types.
    #[error("{0}")]
    InvalidArgument(String),

    /// The zero-timeout poll on the async event fd failed.
    #[error("poll failed with errno {errno} on async event fd.")]
    PollFailed { errno: i32 },

    /// Poll reported readiness but no event could be read.
    #[error("Async event doesn't exist.")]
    EventUnavailable,

    /// A hardware-reported asynchronous event was drained and acknowledged.
    #[error("Verbs async event received event type: {} ({})", .event_type.code(), .event_type)]
    AsyncEvent { event_type: AsyncEventType },

    /// One leg of the RC handshake was rejected by the provider.
    #[error("RC handshake from QP 0x{local_qpn:x} to QP 0x{remote_qpn:x} failed: {source}")]
    Handshake {
        local_qpn: u32,
        remote_qpn: u32,
        #[source]
        source: io::Error,
    },

    #[error("no RDMA device available: {0}")]
    NoDevice(#[source] io::Error),

    #[error("{op} failed: {source}")]
    Provider {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StressError {
    pub(crate) fn provider(op: &'static str, source: io::Error) -> Self {
        StressError::Provider { op, source }
    }

    /// Status family used by callers to assert on outcomes.
    pub fn code(&self) -> StatusCode {
        match self {
            StressError::InvalidArgument(_) | StressError::Config(_) => {
                StatusCode::InvalidArgument
            }
            StressError::PollFailed { .. }
            | StressError::AsyncEvent { .. }
            | StressError::Handshake { .. }
            | StressError::Provider { .. } => StatusCode::Internal,
            StressError::EventUnavailable => StatusCode::Unavailable,
            StressError::NoDevice(_) => StatusCode::NotFound,
            StressError::FailedPrecondition(_) => StatusCode::FailedPrecondition,
        }
    }

    /// The event type carried by a drained async event, if any.
    pub fn async_event_type(&self) -> Option<AsyncEventType> {
        match self {
            StressError::AsyncEvent { event_type } => Some(*event_type),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            StressError::InvalidArgument("x".into()).code(),
            StatusCode::InvalidArgument
        );
        assert_eq!(StressError::PollFailed { errno: 4 }.code(), StatusCode::Internal);
        assert_eq!(StressError::EventUnavailable.code(), StatusCode::Unavailable);
        assert_eq!(
            StressError::NoDevice(io::Error::from(io::ErrorKind::NotFound)).code(),
            StatusCode::NotFound
        );
    }

    #[test]
    fn test_messages_match_harness_wording() {
        assert_eq!(
            StressError::PollFailed { errno: 9 }.to_string(),
            "poll failed with errno 9 on async event fd."
        );
        assert_eq!(
            StressError::EventUnavailable.to_string(),
            "Async event doesn't exist."
        );
        let err = StressError::AsyncEvent {
            event_type: AsyncEventType::QpFatal,
        };
        assert_eq!(
            err.to_string(),
            "Verbs async event received event type: 1 (IBV_EVENT_QP_FATAL)"
        );
        assert_eq!(err.async_event_type(), Some(AsyncEventType::QpFatal));
    }

    #[test]
    fn test_status_code_display() {
        assert_eq!(StatusCode::Unavailable.to_string(), "UNAVAILABLE");
        assert_eq!(StatusCode::FailedPrecondition.to_string(), "FAILED_PRECONDITION");
    }
}
