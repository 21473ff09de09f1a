//! Customized unified outcome type for every consensus handler.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use crate::palf::{ConfigVersion, LogInfo, PalfId, ProposalId};

/// Discriminated outcome of a failed PALF operation. A successful operation is
/// simply `Ok(..)`; every negative outcome maps to exactly one variant.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PalfError {
    /// Malformed partition ID or message; never retryable as-is.
    InvalidArgument(String),

    /// Registry has no live handle for the partition (unknown, still
    /// initializing, or being torn down).
    PartitionNotFound(PalfId),

    /// Message's proposal ID is behind the locally recorded term.
    StaleTerm { local: ProposalId, msg: ProposalId },

    /// Incoming entry does not continue the local log tail; a fetch has been
    /// issued to close the gap.
    LogContinuityGap { expected: LogInfo, received: LogInfo },

    /// Accepted mode proposal ID does not match the installed mode meta.
    ModeMismatch { local: ProposalId, msg: ProposalId },

    /// Config meta older than the locally accepted one.
    StaleConfig {
        local: ConfigVersion,
        msg: ConfigVersion,
    },

    /// Leader-only operation invoked on a non-leader.
    NotLeader,

    /// Operation is illegal in the current state.
    StateNotMatch(String),

    /// Local disk or memory headroom checks failed.
    ResourceExhausted(String),

    /// Unexpected invariant violation; indicates a consensus bug.
    Internal(String),
}

impl PalfError {
    /// Creates an internal error carrying the given message.
    pub fn msg(msg: impl ToString) -> Self {
        PalfError::Internal(msg.to_string())
    }

    /// Creates an invalid argument error carrying the given message.
    pub fn invalid(msg: impl ToString) -> Self {
        PalfError::InvalidArgument(msg.to_string())
    }

    /// Whether the caller may sensibly retry the same request later (after
    /// backoff, re-discovery of the leader, or a catch-up fetch).
    pub fn is_retryable(&self) -> bool {
        match self {
            PalfError::PartitionNotFound(_)
            | PalfError::StaleTerm { .. }
            | PalfError::LogContinuityGap { .. }
            | PalfError::ModeMismatch { .. }
            | PalfError::NotLeader
            | PalfError::ResourceExhausted(_) => true,
            PalfError::InvalidArgument(_)
            | PalfError::StaleConfig { .. }
            | PalfError::StateNotMatch(_)
            | PalfError::Internal(_) => false,
        }
    }
}

impl fmt::Display for PalfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PalfError::InvalidArgument(s) => {
                write!(f, "invalid argument: {}", s)
            }
            PalfError::PartitionNotFound(id) => {
                write!(f, "palf {} not found", id)
            }
            PalfError::StaleTerm { local, msg } => {
                write!(f, "stale proposal_id {} < local {}", msg, local)
            }
            PalfError::LogContinuityGap { expected, received } => write!(
                f,
                "log gap: local tail {:?}, received prev {:?}",
                expected, received
            ),
            PalfError::ModeMismatch { local, msg } => {
                write!(f, "mode pid mismatch: local {} msg {}", local, msg)
            }
            PalfError::StaleConfig { local, msg } => {
                write!(f, "stale config {:?} < local {:?}", msg, local)
            }
            PalfError::NotLeader => write!(f, "not leader"),
            PalfError::StateNotMatch(s) => write!(f, "state not match: {}", s),
            PalfError::ResourceExhausted(s) => {
                write!(f, "resource exhausted: {}", s)
            }
            PalfError::Internal(s) => write!(f, "{}", s), // no quotes
        }
    }
}

impl error::Error for PalfError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `PalfError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for PalfError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                PalfError::Internal(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `PalfError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for PalfError {
            fn from(e: $error) -> PalfError {
                PalfError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);

impl_from_error_generic!(std::sync::PoisonError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = PalfError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        let e = PalfError::StaleTerm { local: 5, msg: 4 };
        assert_eq!(format!("{}", e), "stale proposal_id 4 < local 5");
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = PalfError::from(io_error);
        assert!(matches!(e, PalfError::Internal(s) if s.contains("oh no!")));
    }

    #[test]
    fn retryable_classes() {
        assert!(PalfError::PartitionNotFound(1).is_retryable());
        assert!(PalfError::StaleTerm { local: 2, msg: 1 }.is_retryable());
        assert!(!PalfError::invalid("bad").is_retryable());
        assert!(!PalfError::msg("bug").is_retryable());
    }
}
