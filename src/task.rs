use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::abort::{AbortController, AbortReason, AbortSignal};
use crate::error::TaskFailureError;
use crate::events::{ListenerId, Listeners};
use crate::settable::{settable_future, SettableFuture, Settler};

/// Lifecycle states of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
  /// Admitted, waiting for a worker slot.
  Queued,
  /// Handed to the task handler.
  Active,
  /// Cancelled before or during execution.
  Cancelled,
  /// Handler returned a value.
  Succeeded,
  /// Handler failed or timed out.
  Failed,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskState::Cancelled | TaskState::Succeeded | TaskState::Failed
    )
  }
}

/// User-defined progress payload emitted through a task's progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
  pub completed_items: u64,
  pub total_items: u64,
}

pub(crate) struct TaskCell<R> {
  pub(crate) state: TaskState,
  pub(crate) output: Option<R>,
  pub(crate) error: Option<TaskFailureError>,
  pub(crate) completed_at: Option<u64>,
}

/// A task admitted to a [`crate::TaskQueue`]: its state, outcome slots,
/// cancellation token, completion future, and progress channel.
///
/// Shared by reference between the queue and user code; the queue is the
/// only writer.
pub struct TaskRef<I, R> {
  id: String,
  input: I,
  queued_at: u64,
  pub(crate) controller: AbortController,
  pub(crate) progress: Listeners<ProgressUpdate>,
  completed: SettableFuture<()>,
  completed_settler: Settler<()>,
  pub(crate) cell: Mutex<TaskCell<R>>,
}

impl<I, R> TaskRef<I, R> {
  pub(crate) fn new(id: String, input: I, queued_at: u64) -> Arc<Self> {
    let (completed, completed_settler) = settable_future::<()>();
    Arc::new(Self {
      id,
      input,
      queued_at,
      controller: AbortController::new(),
      progress: Listeners::new(),
      completed,
      completed_settler,
      cell: Mutex::new(TaskCell {
        state: TaskState::Queued,
        output: None,
        error: None,
        completed_at: None,
      }),
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn input(&self) -> &I {
    &self.input
  }

  pub fn queued_at(&self) -> u64 {
    self.queued_at
  }

  pub fn completed_at(&self) -> Option<u64> {
    self.cell.lock().completed_at
  }

  pub fn state(&self) -> TaskState {
    self.cell.lock().state
  }

  /// The failure recorded on a cancelled or failed task.
  pub fn error(&self) -> Option<TaskFailureError> {
    self.cell.lock().error.clone()
  }

  /// Cancellation token observable by the task handler.
  pub fn signal(&self) -> AbortSignal {
    self.controller.signal()
  }

  /// Requests cancellation of this task.
  pub fn abort(&self, reason: impl Into<AbortReason>) {
    let reason = reason.into();
    debug!(task_id = %self.id, %reason, "task cancellation requested");
    self.controller.abort(reason);
  }

  /// Future resolving once the task reaches a terminal state. Resolves
  /// exactly once and never rejects.
  pub fn completed(&self) -> SettableFuture<()> {
    self.completed.clone()
  }

  pub fn on_progress(
    &self,
    handler: impl Fn(&ProgressUpdate) + Send + Sync + 'static,
  ) -> ListenerId {
    self.progress.subscribe(handler)
  }

  pub fn off_progress(&self, id: ListenerId) -> bool {
    self.progress.unsubscribe(id)
  }

  pub fn emit_progress(&self, update: ProgressUpdate) {
    self.progress.emit(&update);
  }

  pub(crate) fn settle_completed(&self) {
    self.completed_settler.resolve(());
  }
}

impl<I, R: Clone> TaskRef<I, R> {
  /// The handler's output; set only on a succeeded task.
  pub fn output(&self) -> Option<R> {
    self.cell.lock().output.clone()
  }
}

impl<I, R> fmt::Debug for TaskRef<I, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let cell = self.cell.lock();
    f.debug_struct("TaskRef")
      .field("id", &self.id)
      .field("state", &cell.state)
      .field("queued_at", &self.queued_at)
      .field("completed_at", &cell.completed_at)
      .finish_non_exhaustive()
  }
}
