use std::sync::Arc;

use thiserror::Error;

use crate::abort::AbortReason;
use crate::queue::QueueState;

/// Boxed error produced by user-supplied handlers and callbacks.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cloneable, shareable form of [`DynError`]; used wherever an error is
/// retained (task refs, event payloads) or observed from several places.
pub type ArcError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A deadline elapsed before the watched operation settled.
#[derive(Debug, Clone, Error)]
#[error("{message} (deadline: {timeout_ms} ms)")]
pub struct TimeoutError {
  pub message: String,
  pub timeout_ms: u64,
}

impl TimeoutError {
  pub fn new(message: impl Into<String>, timeout_ms: u64) -> Self {
    Self {
      message: message.into(),
      timeout_ms,
    }
  }
}

/// An external cancellation token fired before completion or deadline.
#[derive(Debug, Clone, Error)]
#[error("operation aborted: {reason}")]
pub struct AbortError {
  pub reason: AbortReason,
}

/// The loser of a deadline race later settled with a failure that cannot be
/// handed to the typed late-rejection hook (it panicked); wraps a rendering
/// of the raw payload.
#[derive(Debug, Clone, Error)]
#[error("source rejected after losing its deadline race: {value}")]
pub struct LateRejectionError {
  pub value: String,
}

/// A user-supplied handler or callback panicked.
#[derive(Debug, Clone, Error)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

/// Uniform wrapper for every non-success terminal outcome of a queue task.
///
/// Carries the id of the task it belongs to together with the underlying
/// reason (which may itself be a [`TimeoutError`] or [`AbortError`]). Never
/// nests: wrapping a `TaskFailureError` yields the inner one unchanged.
#[derive(Debug, Clone, Error)]
#[error("task {task_id} did not succeed: {reason}")]
pub struct TaskFailureError {
  pub task_id: String,
  pub reason: ArcError,
}

impl TaskFailureError {
  pub(crate) fn new(task_id: impl Into<String>, reason: ArcError) -> Self {
    Self {
      task_id: task_id.into(),
      reason,
    }
  }

  /// Wraps a handler error, unwrapping instead when it already is a
  /// `TaskFailureError`.
  pub(crate) fn from_dyn(task_id: &str, error: DynError) -> Self {
    match error.downcast::<TaskFailureError>() {
      Ok(existing) => *existing,
      Err(other) => Self::new(task_id, Arc::from(other)),
    }
  }
}

/// Outcome channel of [`crate::with_timeout`].
#[derive(Debug, Error)]
pub enum WaitError<E> {
  /// The deadline elapsed first.
  #[error(transparent)]
  Timeout(TimeoutError),
  /// The external cancellation token fired first.
  #[error(transparent)]
  Aborted(AbortError),
  /// The source settled first, with an error of its own.
  #[error("{0}")]
  Source(E),
  /// The source panicked while being raced.
  #[error("source panicked: {0}")]
  Panicked(String),
}

impl<E> WaitError<E> {
  pub fn is_timeout(&self) -> bool {
    matches!(self, WaitError::Timeout(_))
  }

  pub fn is_aborted(&self) -> bool {
    matches!(self, WaitError::Aborted(_))
  }
}

/// Task queue misuse errors. These signal programmer error, not recoverable
/// runtime conditions.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
  #[error("task queue is draining or drained and no longer accepts work")]
  Drained,

  #[error("task queue is full ({limit} tasks queued)")]
  QueueFull { limit: usize },

  #[error("illegal queue state transition: {from:?} -> {to:?}")]
  InvalidTransition { from: QueueState, to: QueueState },
}

/// Resource pool misuse and operational errors.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
  #[error("resource pool is drained and no longer accepts work")]
  Drained,

  #[error("acquire rejected: waiter queue size limit reached ({limit})")]
  AcquireQueueFull { limit: usize },

  #[error("resource creation failed: {0}")]
  CreateFailed(ArcError),

  #[error("resource destruction failed: {0}")]
  DestroyFailed(ArcError),

  #[error("pool callback failed: {0}")]
  CallbackFailed(ArcError),

  #[error("no active lease with id {0}")]
  UnknownLease(u64),

  #[error("resource is not currently leased through this adapter")]
  UnleasedResource,

  #[error("resource is already leased and cannot be concurrent")]
  LeaseNotConcurrent,

  #[error(transparent)]
  Timeout(#[from] TimeoutError),

  #[error(transparent)]
  Aborted(#[from] AbortError),

  #[error("pool invariant violated: {0}")]
  Internal(String),
}

impl From<WaitError<PoolError>> for PoolError {
  fn from(error: WaitError<PoolError>) -> Self {
    match error {
      WaitError::Timeout(e) => PoolError::Timeout(e),
      WaitError::Aborted(e) => PoolError::Aborted(e),
      WaitError::Source(e) => e,
      WaitError::Panicked(p) => PoolError::CallbackFailed(Arc::new(PanicError(p))),
    }
  }
}
