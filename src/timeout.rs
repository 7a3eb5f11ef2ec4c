use std::future::Future;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, trace, warn};

use crate::abort::{AbortController, AbortReason};
use crate::error::{AbortError, LateRejectionError, TimeoutError, WaitError};

/// Options for [`with_timeout`].
pub struct TimeoutOptions<T, E> {
  /// Deadline for the source. `None` disables the timer entirely.
  pub timeout: Option<Duration>,
  /// Message carried by the [`TimeoutError`] on a timer win.
  pub timeout_message: Option<String>,
  /// Message used when `external_cancel` fires without a recorded reason.
  pub abort_message: Option<String>,
  /// External cancellation raced alongside the timer. A timer win aborts
  /// this controller with the timeout error as reason, so downstream
  /// consumers of the token observe the cancellation.
  pub external_cancel: Option<AbortController>,
  /// Runs exactly once if the source resolves after losing the race.
  pub on_late_resolve: Option<Box<dyn FnOnce(T) + Send + 'static>>,
  /// Runs exactly once if the source rejects after losing the race.
  pub on_late_reject: Option<Box<dyn FnOnce(E) + Send + 'static>>,
}

impl<T, E> Default for TimeoutOptions<T, E> {
  fn default() -> Self {
    Self {
      timeout: None,
      timeout_message: None,
      abort_message: None,
      external_cancel: None,
      on_late_resolve: None,
      on_late_reject: None,
    }
  }
}

impl<T, E> TimeoutOptions<T, E> {
  /// Options with only a deadline set.
  pub fn deadline(timeout: Duration) -> Self {
    Self {
      timeout: Some(timeout),
      ..Self::default()
    }
  }
}

/// Races `source` against an optional deadline and an optional external
/// cancellation token.
///
/// The first to fire wins: a timer win yields [`WaitError::Timeout`] (and
/// aborts `external_cancel`, when provided, with the timeout error as
/// reason), a cancellation win yields [`WaitError::Aborted`], and a source
/// win forwards the source's own result. With no deadline and no token the
/// source is awaited unchanged.
///
/// The source is spawned so it can out-live a lost race. When it later
/// settles, the matching cleanup hook runs exactly once with the late
/// settlement; this is how callers free resources created during an
/// abandoned operation. A late panic has no typed settlement to hand over
/// and is wrapped into a [`LateRejectionError`] for the log.
pub async fn with_timeout<F, T, E>(
  source: F,
  options: TimeoutOptions<T, E>,
) -> Result<T, WaitError<E>>
where
  F: Future<Output = Result<T, E>> + Send + 'static,
  T: Send + 'static,
  E: Send + 'static,
{
  let TimeoutOptions {
    timeout,
    timeout_message,
    abort_message,
    external_cancel,
    on_late_resolve,
    on_late_reject,
  } = options;

  if timeout.is_none() && external_cancel.is_none() {
    // Nothing to race; behave as the source itself.
    return source.await.map_err(WaitError::Source);
  }

  let mut join = tokio::spawn(source);
  let cancel_signal = external_cancel.as_ref().map(|c| c.signal());

  let deadline = async {
    match timeout {
      Some(duration) => tokio::time::sleep(duration).await,
      None => futures::future::pending::<()>().await,
    }
  };
  tokio::pin!(deadline);

  let cancelled = async {
    match &cancel_signal {
      Some(signal) => signal.cancelled().await,
      None => futures::future::pending::<()>().await,
    }
  };
  tokio::pin!(cancelled);

  tokio::select! {
    biased;

    _ = &mut cancelled => {
      let reason = cancel_signal
        .as_ref()
        .and_then(|signal| signal.reason())
        .unwrap_or_else(|| {
          AbortReason::Message(
            abort_message.unwrap_or_else(|| "operation was aborted".to_string()),
          )
        });
      debug!(%reason, "external cancellation won the deadline race");
      reap_late_settlement(join, on_late_resolve, on_late_reject);
      Err(WaitError::Aborted(AbortError { reason }))
    }

    _ = &mut deadline => {
      let timeout_ms = timeout.map(|d| d.as_millis() as u64).unwrap_or(0);
      let error = TimeoutError::new(
        timeout_message.unwrap_or_else(|| "operation timed out".to_string()),
        timeout_ms,
      );
      if let Some(controller) = &external_cancel {
        controller.abort(AbortReason::Timeout(error.clone()));
      }
      debug!(timeout_ms, "deadline elapsed before the source settled");
      reap_late_settlement(join, on_late_resolve, on_late_reject);
      Err(WaitError::Timeout(error))
    }

    joined = &mut join => match joined {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(error)) => Err(WaitError::Source(error)),
      Err(join_error) => Err(WaitError::Panicked(render_join_error(join_error))),
    }
  }
}

/// Watches the abandoned source and routes its eventual settlement to the
/// cleanup hooks.
fn reap_late_settlement<T, E>(
  join: JoinHandle<Result<T, E>>,
  on_late_resolve: Option<Box<dyn FnOnce(T) + Send + 'static>>,
  on_late_reject: Option<Box<dyn FnOnce(E) + Send + 'static>>,
) where
  T: Send + 'static,
  E: Send + 'static,
{
  tokio::spawn(async move {
    match join.await {
      Ok(Ok(value)) => match on_late_resolve {
        Some(hook) => hook(value),
        None => trace!("late resolution discarded"),
      },
      Ok(Err(error)) => match on_late_reject {
        Some(hook) => hook(error),
        None => debug!("late rejection discarded"),
      },
      Err(join_error) if join_error.is_panic() => {
        let wrapped = LateRejectionError {
          value: render_join_error(join_error),
        };
        warn!(error = %wrapped, "source panicked after losing its deadline race");
      }
      Err(_) => {}
    }
  });
}

fn render_join_error(error: JoinError) -> String {
  match error.try_into_panic() {
    Ok(payload) => {
      if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
      } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
      } else {
        "opaque panic payload".to_string()
      }
    }
    Err(error) => error.to_string(),
  }
}

/// Yields to the runtime until work it has already scheduled (including
/// chains of dependent continuations) has had a chance to run. Intended for
/// tests that assert on the observable side of spawned bookkeeping.
pub async fn flush_scheduled_work() {
  for _ in 0..32 {
    tokio::task::yield_now().await;
  }
}
