use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{AbortError, ArcError, TimeoutError};

/// Why an abort fired. The first reason recorded on a controller wins.
#[derive(Debug, Clone)]
pub enum AbortReason {
  /// Free-form caller-supplied reason.
  Message(String),
  /// A deadline elapsed and cancelled the work it was racing.
  Timeout(TimeoutError),
  /// The owning task queue is draining.
  QueueDrained,
  /// The owning resource pool is draining.
  PoolDrained,
  /// An arbitrary error carried as the reason.
  Error(ArcError),
}

impl fmt::Display for AbortReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AbortReason::Message(m) => f.write_str(m),
      AbortReason::Timeout(e) => write!(f, "{e}"),
      AbortReason::QueueDrained => f.write_str("queue drained"),
      AbortReason::PoolDrained => f.write_str("pool drained"),
      AbortReason::Error(e) => write!(f, "{e}"),
    }
  }
}

impl From<&str> for AbortReason {
  fn from(value: &str) -> Self {
    AbortReason::Message(value.to_string())
  }
}

impl From<String> for AbortReason {
  fn from(value: String) -> Self {
    AbortReason::Message(value)
  }
}

impl From<TimeoutError> for AbortReason {
  fn from(value: TimeoutError) -> Self {
    AbortReason::Timeout(value)
  }
}

type AbortListener = Box<dyn FnOnce(&AbortReason) + Send + 'static>;

struct AbortState {
  reason: Option<AbortReason>,
  listeners: Vec<AbortListener>,
}

struct AbortInner {
  token: CancellationToken,
  state: Mutex<AbortState>,
}

/// Writer side of a cancellation pair. Cheap to clone; all clones observe
/// and drive the same underlying token.
#[derive(Clone)]
pub struct AbortController {
  inner: Arc<AbortInner>,
}

/// Read side of a cancellation pair, shared with user handlers.
#[derive(Clone)]
pub struct AbortSignal {
  inner: Arc<AbortInner>,
}

impl AbortController {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(AbortInner {
        token: CancellationToken::new(),
        state: Mutex::new(AbortState {
          reason: None,
          listeners: Vec::new(),
        }),
      }),
    }
  }

  pub fn signal(&self) -> AbortSignal {
    AbortSignal {
      inner: self.inner.clone(),
    }
  }

  /// Requests cancellation. The first call records the reason and fires the
  /// registered listeners synchronously; later calls are no-ops.
  pub fn abort(&self, reason: impl Into<AbortReason>) {
    let reason = reason.into();
    let listeners = {
      let mut state = self.inner.state.lock();
      if state.reason.is_some() {
        trace!("abort requested on an already-aborted controller");
        return;
      }
      state.reason = Some(reason.clone());
      std::mem::take(&mut state.listeners)
    };
    self.inner.token.cancel();
    for listener in listeners {
      listener(&reason);
    }
  }

  pub fn is_aborted(&self) -> bool {
    self.inner.token.is_cancelled()
  }
}

impl Default for AbortController {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for AbortController {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AbortController")
      .field("aborted", &self.is_aborted())
      .finish_non_exhaustive()
  }
}

impl AbortSignal {
  pub fn aborted(&self) -> bool {
    self.inner.token.is_cancelled()
  }

  pub fn reason(&self) -> Option<AbortReason> {
    self.inner.state.lock().reason.clone()
  }

  /// Resolves once the controller aborts; resolves immediately if it
  /// already has.
  pub async fn cancelled(&self) {
    self.inner.token.cancelled().await;
  }

  /// Registers a one-shot listener. Fires immediately (on the calling
  /// thread) if the controller has already aborted.
  pub fn on_abort(&self, listener: impl FnOnce(&AbortReason) + Send + 'static) {
    let mut state = self.inner.state.lock();
    if let Some(reason) = state.reason.clone() {
      drop(state);
      listener(&reason);
    } else {
      state.listeners.push(Box::new(listener));
    }
  }

  /// Errors with the recorded reason when the controller has aborted;
  /// intended for cooperative checks at handler yield points.
  pub fn check_aborted(&self) -> Result<(), AbortError> {
    if self.aborted() {
      Err(AbortError {
        reason: self
          .reason()
          .unwrap_or_else(|| AbortReason::Message("operation was aborted".to_string())),
      })
    } else {
      Ok(())
    }
  }
}

impl fmt::Debug for AbortSignal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AbortSignal")
      .field("aborted", &self.aborted())
      .finish_non_exhaustive()
  }
}
