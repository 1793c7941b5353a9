//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else flows through `color_eyre::Result`.

use thiserror::Error;

/// A fetch that could not produce a response at all.
///
/// An HTTP error status is still a response; only transport-level failures
/// end up here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  #[error("network unavailable: {0}")]
  Unavailable(String),
  #[error("request timed out: {0}")]
  Timeout(String),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Failures of the cache backend itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
  #[error("storage quota exceeded: {used} of {quota} bytes in use, {requested} more requested")]
  QuotaExceeded { quota: u64, used: u64, requested: u64 },
  #[error("storage lock poisoned")]
  LockPoisoned,
}
