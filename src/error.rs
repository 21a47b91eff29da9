//! Error taxonomy
//!
//! - [`PatternError`]: a topic pattern that does not follow the filter
//!   grammar. Reported synchronously, never retried.
//! - [`TransportError`]: anything surfaced by the underlying connection.
//! - [`StateError`]: a broken internal invariant of the multiplexer. These are
//!   bugs, so they are raised as panics instead of being returned.

use thiserror::Error;

/// A topic pattern rejected by [`validate`](crate::topic::validate) or
/// [`compile`](crate::topic::compile).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
  #[error("topic pattern must not be empty")]
  Empty,
  #[error("multi-level wildcard `#` must be the last segment of `{pattern}`")]
  MultiLevelNotLast { pattern: String },
  #[error("segment {index} of `{pattern}` mixes a wildcard with other characters")]
  MixedWildcard { pattern: String, index: usize },
}

/// Failure reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  #[error("connection refused: {0}")]
  ConnectionRefused(String),
  #[error("not connected")]
  NotConnected,
  #[error("invalid url `{0}`")]
  InvalidUrl(String),
  #[error("protocol violation: {0}")]
  Protocol(String),
  #[error("{0}")]
  Other(String),
}

/// Internal invariant violation of the subscription state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
  #[error("released `{pattern}` while it held no references")]
  ReleaseWithoutReference { pattern: String },
  #[error("wire acknowledgement for `{pattern}` arrived while {state:?}")]
  UnexpectedAck { pattern: String, state: crate::multiplexer::WireState },
  #[error("wire acknowledgement for unknown pattern `{pattern}`")]
  UnknownPattern { pattern: String },
}

impl StateError {
  #[track_caller]
  pub(crate) fn raise(self) -> ! { panic!("subscription state invariant violated: {self}") }
}

/// Umbrella error for callers that do not care which layer failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error(transparent)]
  Pattern(#[from] PatternError),
  #[error(transparent)]
  Transport(#[from] TransportError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
  use super::*;

  #[rxmqtt_macro::test]
  fn umbrella_conversion() {
    let err: Error = PatternError::Empty.into();
    assert_eq!(err, Error::Pattern(PatternError::Empty));
    assert_eq!(err.to_string(), "topic pattern must not be empty");

    let err: Error = TransportError::NotConnected.into();
    assert!(matches!(err, Error::Transport(TransportError::NotConnected)));
  }

  #[rxmqtt_macro::test]
  #[should_panic(expected = "subscription state invariant violated")]
  fn state_error_panics() {
    StateError::UnknownPattern { pattern: "a/b".into() }.raise();
  }
}
