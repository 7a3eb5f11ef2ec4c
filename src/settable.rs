use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::error::ArcError;

/// Error observed by awaiters when a settable future is rejected.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct Rejection(pub ArcError);

/// The settler was dropped before resolving or rejecting.
#[derive(Debug, Clone, Error)]
#[error("settler dropped before settling")]
pub struct SettlerDropped;

/// A multi-awaitable future settled externally through its [`Settler`].
///
/// This is the bridge between event-driven sources (cancellation, timer
/// fire, external completion) and awaitable results. Clones share the
/// settled value, so any number of callers may await the same settlement.
pub struct SettableFuture<T> {
  inner: Shared<BoxFuture<'static, Result<T, Rejection>>>,
}

impl<T> Clone for SettableFuture<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T: Clone + 'static> Future for SettableFuture<T> {
  type Output = Result<T, Rejection>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.inner).poll(cx)
  }
}

impl<T> fmt::Debug for SettableFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SettableFuture").finish_non_exhaustive()
  }
}

/// Writer half of a [`SettableFuture`]. Settling is idempotent: the first
/// `resolve`/`reject` wins and every later call is a reported no-op.
pub struct Settler<T> {
  tx: Mutex<Option<oneshot::Sender<Result<T, Rejection>>>>,
}

impl<T> Settler<T> {
  /// Settles the future with a value. Returns `false` when already settled.
  pub fn resolve(&self, value: T) -> bool {
    self.settle(Ok(value))
  }

  /// Settles the future with an error. Returns `false` when already settled.
  pub fn reject(&self, error: ArcError) -> bool {
    self.settle(Err(Rejection(error)))
  }

  pub fn is_settled(&self) -> bool {
    self.tx.lock().is_none()
  }

  fn settle(&self, outcome: Result<T, Rejection>) -> bool {
    match self.tx.lock().take() {
      Some(tx) => {
        // A dropped future is fine; the settlement is simply unobserved.
        let _ = tx.send(outcome);
        true
      }
      None => false,
    }
  }
}

impl<T> fmt::Debug for Settler<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Settler")
      .field("settled", &self.is_settled())
      .finish()
  }
}

/// Produces a future together with the settler that completes it.
pub fn settable_future<T: Clone + Send + 'static>() -> (SettableFuture<T>, Settler<T>) {
  let (tx, rx) = oneshot::channel::<Result<T, Rejection>>();
  let inner = async move {
    match rx.await {
      Ok(outcome) => outcome,
      Err(_) => Err(Rejection(Arc::new(SettlerDropped))),
    }
  }
  .boxed()
  .shared();
  (
    SettableFuture { inner },
    Settler {
      tx: Mutex::new(Some(tx)),
    },
  )
}
