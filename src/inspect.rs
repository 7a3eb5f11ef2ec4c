use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tracing::error;

use crate::settable::{settable_future, SettableFuture};

/// Synchronously observable settle-state of an inspected future.
#[derive(Debug, Clone)]
pub struct DebugValues<T, E> {
  pub resolved_value: Option<T>,
  pub rejection_error: Option<E>,
}

/// A future whose settlement is observable without awaiting it.
pub struct InspectedFuture<T, E> {
  state: Arc<Mutex<Option<Result<T, E>>>>,
  inner: SettableFuture<Result<T, E>>,
}

impl<T, E> Clone for InspectedFuture<T, E> {
  fn clone(&self) -> Self {
    Self {
      state: self.state.clone(),
      inner: self.inner.clone(),
    }
  }
}

/// Spawns `future` on the current runtime and returns a wrapper whose
/// settle-state can be read synchronously. The wrapper is itself awaitable
/// and cloneable; all clones observe the same settlement.
pub fn with_inspection<F, T, E>(future: F) -> InspectedFuture<T, E>
where
  F: Future<Output = Result<T, E>> + Send + 'static,
  T: Clone + Send + 'static,
  E: Clone + Send + 'static,
{
  let state = Arc::new(Mutex::new(None));
  let (inner, settler) = settable_future::<Result<T, E>>();
  let recorder = state.clone();
  tokio::spawn(async move {
    let outcome = future.await;
    *recorder.lock() = Some(outcome.clone());
    settler.resolve(outcome);
  });
  InspectedFuture { state, inner }
}

impl<T: Clone, E: Clone> InspectedFuture<T, E> {
  pub fn is_done(&self) -> bool {
    self.state.lock().is_some()
  }

  pub fn resolved_value(&self) -> Option<T> {
    match &*self.state.lock() {
      Some(Ok(value)) => Some(value.clone()),
      _ => None,
    }
  }

  pub fn rejection_error(&self) -> Option<E> {
    match &*self.state.lock() {
      Some(Err(error)) => Some(error.clone()),
      _ => None,
    }
  }

  pub fn debug_values(&self) -> DebugValues<T, E> {
    DebugValues {
      resolved_value: self.resolved_value(),
      rejection_error: self.rejection_error(),
    }
  }
}

impl<T: Clone + 'static, E: Clone + 'static> Future for InspectedFuture<T, E> {
  type Output = Result<T, E>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.inner).poll(cx) {
      Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
      Poll::Ready(Err(_)) => {
        // Only reachable when the runtime tore down the recorder task; there
        // is no settlement to forward.
        error!("inspected future lost its driver; it will never settle");
        Poll::Pending
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<T, E> fmt::Debug for InspectedFuture<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InspectedFuture")
      .field("is_done", &self.state.lock().is_some())
      .finish_non_exhaustive()
  }
}
