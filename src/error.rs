//! Error type shared by the transaction machinery and both cache backends.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the public engine and transaction operations.
///
/// `Locked` is the one exception to "errors always propagate": the engine
/// boundary absorbs it into a silent no-op (see `engine::absorb_locked`),
/// logging it at `tracing::debug!` instead of returning it to the caller.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("key not found")]
  NotFound,

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("incomplete write: expected {declared} bytes, got {written}")]
  IncompleteWrite { declared: u64, written: u64 },

  #[error("operation attempted on a transaction that is not open")]
  AlreadyFinalized,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("attempted to mutate a reliability-locked version")]
  Locked,
}

impl CacheError {
  pub fn invalid_argument(msg: impl Into<String>) -> Self {
    CacheError::InvalidArgument(msg.into())
  }

  pub fn is_locked(&self) -> bool {
    matches!(self, CacheError::Locked)
  }
}
