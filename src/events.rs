use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

/// Identifier handed out by a subscription; used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Minimal publish/subscribe fan-out used for queue-level `error` events and
/// per-task `progress` events. Dispatch is synchronous; a panicking handler
/// is contained and logged without disturbing the other handlers.
pub(crate) struct Listeners<E> {
  handlers: RwLock<Vec<(ListenerId, Arc<dyn Fn(&E) + Send + Sync>)>>,
  next_id: AtomicU64,
}

impl<E> Listeners<E> {
  pub(crate) fn new() -> Self {
    Self {
      handlers: RwLock::new(Vec::new()),
      next_id: AtomicU64::new(0),
    }
  }

  pub(crate) fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
    let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.handlers.write().push((id, Arc::new(handler)));
    id
  }

  /// Removes a handler. Returns `false` when the id is unknown (already
  /// removed or evicted).
  pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
    let mut handlers = self.handlers.write();
    let before = handlers.len();
    handlers.retain(|(registered, _)| *registered != id);
    handlers.len() != before
  }

  pub(crate) fn emit(&self, event: &E) {
    let snapshot: Vec<_> = self
      .handlers
      .read()
      .iter()
      .map(|(_, handler)| handler.clone())
      .collect();
    for handler in snapshot {
      if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        error!("event handler panicked during dispatch");
      }
    }
  }

  pub(crate) fn clear(&self) {
    self.handlers.write().clear();
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.handlers.read().len()
  }
}

impl<E> fmt::Debug for Listeners<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("Listeners")
      .field("handler_count", &count)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn subscribe_emit_unsubscribe() {
    let listeners = Listeners::<u32>::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let seen_clone = seen.clone();
    let id = listeners.subscribe(move |value| {
      seen_clone.fetch_add(*value as usize, Ordering::SeqCst);
    });

    listeners.emit(&2);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    assert!(listeners.unsubscribe(id));
    assert!(!listeners.unsubscribe(id));
    listeners.emit(&5);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn panicking_handler_does_not_poison_dispatch() {
    let listeners = Listeners::<()>::new();
    let seen = Arc::new(AtomicUsize::new(0));

    listeners.subscribe(|_| panic!("handler blew up"));
    let seen_clone = seen.clone();
    listeners.subscribe(move |_| {
      seen_clone.fetch_add(1, Ordering::SeqCst);
    });

    listeners.emit(&());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(listeners.len(), 2);
  }
}
