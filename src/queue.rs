use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::abort::{AbortReason, AbortSignal};
use crate::clock::{Clock, SystemClock};
use crate::error::{AbortError, DynError, PanicError, QueueError, TaskFailureError, WaitError};
use crate::events::{ListenerId, Listeners};
use crate::settable::{settable_future, SettableFuture, Settler};
use crate::task::{TaskRef, TaskState};
use crate::timeout::{with_timeout, TimeoutOptions};

lazy_static::lazy_static! {
  static ref TASK_ID_SEED: u64 = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(0x5eed);
  static ref NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);
}

/// Opaque hex id: a process-wide counter scrambled with a per-process seed.
fn next_task_id() -> String {
  let n = NEXT_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed);
  format!("{:016x}", (n ^ *TASK_ID_SEED).wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

/// Queue lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
  /// Accepting tasks, not scheduling them.
  Paused,
  /// Accepting and scheduling tasks.
  Running,
  /// Shutting down; every known task is being driven to a terminal state.
  Draining,
  /// Terminal; the queue accepts nothing further.
  Drained,
}

/// The type of future a task handler returns.
pub type TaskFuture<R> = Pin<Box<dyn Future<Output = Result<R, DynError>> + Send + 'static>>;

type TaskHandler<I, R> = Arc<dyn Fn(Arc<TaskRef<I, R>>) -> TaskFuture<R> + Send + Sync>;

/// Options accepted by [`TaskQueue::enqueue`].
#[derive(Debug, Default)]
pub struct EnqueueOptions {
  /// External cancellation token; aborting it aborts the task.
  pub signal: Option<AbortSignal>,
}

/// Point-in-time snapshot of the queue state and its task buckets.
pub struct QueueDiagnostics<I, R> {
  pub state: QueueState,
  pub queued: Vec<Arc<TaskRef<I, R>>>,
  pub active: Vec<Arc<TaskRef<I, R>>>,
  pub succeeded: Vec<Arc<TaskRef<I, R>>>,
  pub failed: Vec<Arc<TaskRef<I, R>>>,
  pub cancelled: Vec<Arc<TaskRef<I, R>>>,
}

impl<I, R> Clone for QueueDiagnostics<I, R> {
  fn clone(&self) -> Self {
    Self {
      state: self.state,
      queued: self.queued.clone(),
      active: self.active.clone(),
      succeeded: self.succeeded.clone(),
      failed: self.failed.clone(),
      cancelled: self.cancelled.clone(),
    }
  }
}

struct QueueShared<I, R> {
  state: QueueState,
  queued: VecDeque<Arc<TaskRef<I, R>>>,
  active: Vec<Arc<TaskRef<I, R>>>,
  succeeded: Vec<Arc<TaskRef<I, R>>>,
  failed: Vec<Arc<TaskRef<I, R>>>,
  cancelled: Vec<Arc<TaskRef<I, R>>>,
  /// Terminal tasks in completion order; the retention pass evicts from the
  /// front.
  terminal_order: VecDeque<Arc<TaskRef<I, R>>>,
  completion_waiters: Vec<Settler<()>>,
  drain_done: Option<SettableFuture<()>>,
  drain_settler: Option<Settler<()>>,
}

struct QueueCore<I, R> {
  name: Arc<String>,
  max_concurrent_tasks: usize,
  max_queued_tasks: usize,
  max_completed_task_memory: usize,
  per_task_timeout: Option<Duration>,
  clock: Arc<dyn Clock>,
  handle: TokioHandle,
  on_task: TaskHandler<I, R>,
  error_listeners: Listeners<TaskFailureError>,
  shared: Mutex<QueueShared<I, R>>,
}

/// Bounded-concurrency FIFO task queue with cooperative cancellation,
/// per-task deadlines, and bounded retention of terminal tasks.
///
/// Tasks are admitted with [`enqueue`](TaskQueue::enqueue) and handed to the
/// configured handler in admission order whenever the queue is running and a
/// worker slot is free. Cancellation routes a task to `Cancelled` without
/// emitting the queue's `error` event; every true failure emits it.
pub struct TaskQueue<I, R> {
  core: Arc<QueueCore<I, R>>,
}

impl<I, R> Clone for TaskQueue<I, R> {
  fn clone(&self) -> Self {
    Self {
      core: self.core.clone(),
    }
  }
}

impl<I, R> fmt::Debug for TaskQueue<I, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let shared = self.core.shared.lock();
    f.debug_struct("TaskQueue")
      .field("name", &self.core.name)
      .field("state", &shared.state)
      .field("queued", &shared.queued.len())
      .field("active", &shared.active.len())
      .finish_non_exhaustive()
  }
}

/// Builder for [`TaskQueue`]; the task handler is the one mandatory input.
pub struct TaskQueueBuilder<I, R> {
  name: String,
  max_concurrent_tasks: usize,
  max_queued_tasks: usize,
  max_completed_task_memory: usize,
  per_task_timeout: Option<Duration>,
  clock: Arc<dyn Clock>,
  tokio_handle: Option<TokioHandle>,
  on_task: TaskHandler<I, R>,
}

impl<I, R> TaskQueueBuilder<I, R>
where
  I: Send + Sync + 'static,
  R: Send + 'static,
{
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn max_concurrent_tasks(mut self, limit: usize) -> Self {
    self.max_concurrent_tasks = limit.max(1);
    self
  }

  pub fn max_queued_tasks(mut self, limit: usize) -> Self {
    self.max_queued_tasks = limit;
    self
  }

  /// How many terminal tasks to retain for diagnostics, most recent first.
  pub fn max_completed_task_memory(mut self, limit: usize) -> Self {
    self.max_completed_task_memory = limit;
    self
  }

  pub fn per_task_timeout(mut self, timeout: Duration) -> Self {
    self.per_task_timeout = Some(timeout);
    self
  }

  pub fn without_per_task_timeout(mut self) -> Self {
    self.per_task_timeout = None;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn tokio_handle(mut self, handle: TokioHandle) -> Self {
    self.tokio_handle = Some(handle);
    self
  }

  pub fn build(self) -> TaskQueue<I, R> {
    let handle = self
      .tokio_handle
      .unwrap_or_else(TokioHandle::current);
    TaskQueue {
      core: Arc::new(QueueCore {
        name: Arc::new(self.name),
        max_concurrent_tasks: self.max_concurrent_tasks,
        max_queued_tasks: self.max_queued_tasks,
        max_completed_task_memory: self.max_completed_task_memory,
        per_task_timeout: self.per_task_timeout,
        clock: self.clock,
        handle,
        on_task: self.on_task,
        error_listeners: Listeners::new(),
        shared: Mutex::new(QueueShared {
          state: QueueState::Paused,
          queued: VecDeque::new(),
          active: Vec::new(),
          succeeded: Vec::new(),
          failed: Vec::new(),
          cancelled: Vec::new(),
          terminal_order: VecDeque::new(),
          completion_waiters: Vec::new(),
          drain_done: None,
          drain_settler: None,
        }),
      }),
    }
  }
}

impl<I, R> TaskQueue<I, R>
where
  I: Send + Sync + 'static,
  R: Send + 'static,
{
  /// Starts a builder around the task handler. The queue begins paused.
  pub fn builder<F, Fut>(on_task: F) -> TaskQueueBuilder<I, R>
  where
    F: Fn(Arc<TaskRef<I, R>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, DynError>> + Send + 'static,
  {
    TaskQueueBuilder {
      name: "task-queue".to_string(),
      max_concurrent_tasks: 1,
      max_queued_tasks: usize::MAX,
      max_completed_task_memory: 100,
      per_task_timeout: Some(Duration::from_secs(60)),
      clock: Arc::new(SystemClock),
      tokio_handle: None,
      on_task: Arc::new(move |task| Box::pin(on_task(task)) as TaskFuture<R>),
    }
  }

  pub fn name(&self) -> &str {
    &self.core.name
  }

  pub fn state(&self) -> QueueState {
    self.core.shared.lock().state
  }

  pub fn queued_task_count(&self) -> usize {
    self.core.shared.lock().queued.len()
  }

  pub fn active_task_count(&self) -> usize {
    self.core.shared.lock().active.len()
  }

  /// Admits a task. Fails when the queue is draining/drained or the waiting
  /// buffer is full. If the queue is running with a spare worker slot, the
  /// task is active before this returns.
  pub fn enqueue(
    &self,
    input: I,
    options: EnqueueOptions,
  ) -> Result<Arc<TaskRef<I, R>>, QueueError> {
    let core = &self.core;
    let task = {
      let mut shared = core.shared.lock();
      match shared.state {
        QueueState::Draining | QueueState::Drained => return Err(QueueError::Drained),
        QueueState::Paused | QueueState::Running => {}
      }
      if shared.queued.len() >= core.max_queued_tasks {
        warn!(queue = %core.name, limit = core.max_queued_tasks, "enqueue rejected: queue is full");
        return Err(QueueError::QueueFull {
          limit: core.max_queued_tasks,
        });
      }
      let task = TaskRef::new(next_task_id(), input, core.clock.now_ms());
      shared.queued.push_back(task.clone());
      task
    };
    debug!(queue = %core.name, task_id = %task.id(), "task enqueued");

    // Route the task's own abort into the queue state machine. Weak on both
    // sides: the listener lives inside the task's controller, and an owning
    // capture of either end would cycle.
    {
      let weak_core = Arc::downgrade(core);
      let weak_task = Arc::downgrade(&task);
      task.signal().on_abort(move |reason| {
        if let (Some(core), Some(task)) = (weak_core.upgrade(), weak_task.upgrade()) {
          QueueCore::handle_abort(&core, &task, reason.clone());
        }
      });
    }
    if let Some(signal) = options.signal {
      let weak_task = Arc::downgrade(&task);
      signal.on_abort(move |reason| {
        if let Some(task) = weak_task.upgrade() {
          task.abort(reason.clone());
        }
      });
    }

    QueueCore::try_start_next(core);
    Ok(task)
  }

  /// Paused -> Running. Idempotent on Running.
  pub fn start(&self) -> Result<(), QueueError> {
    let started = {
      let mut shared = self.core.shared.lock();
      match shared.state {
        QueueState::Paused => {
          shared.state = QueueState::Running;
          true
        }
        QueueState::Running => false,
        from @ (QueueState::Draining | QueueState::Drained) => {
          return Err(QueueError::InvalidTransition {
            from,
            to: QueueState::Running,
          })
        }
      }
    };
    if started {
      info!(queue = %self.core.name, "queue started");
      QueueCore::try_start_next(&self.core);
    }
    Ok(())
  }

  /// Running -> Paused. Idempotent on Paused. In-flight tasks keep running;
  /// nothing new is scheduled until [`start`](TaskQueue::start).
  pub fn pause(&self) -> Result<(), QueueError> {
    let mut shared = self.core.shared.lock();
    match shared.state {
      QueueState::Running => {
        shared.state = QueueState::Paused;
        drop(shared);
        info!(queue = %self.core.name, "queue paused");
        Ok(())
      }
      QueueState::Paused => Ok(()),
      from @ (QueueState::Draining | QueueState::Drained) => Err(QueueError::InvalidTransition {
        from,
        to: QueueState::Paused,
      }),
    }
  }

  /// Cancels every queued and active task with a "queue drained" reason,
  /// waits for all of them to settle, then marks the queue drained.
  /// Idempotent: later calls await the same completion.
  pub async fn drain(&self) {
    let (done, run) = {
      let mut shared = self.core.shared.lock();
      if shared.state == QueueState::Drained {
        return;
      }
      match shared.drain_done.clone() {
        Some(done) => (done, false),
        None => {
          let (done, settler) = settable_future::<()>();
          shared.drain_done = Some(done.clone());
          shared.drain_settler = Some(settler);
          shared.state = QueueState::Draining;
          (done, true)
        }
      }
    };
    if run {
      info!(queue = %self.core.name, "queue draining");
      let core = self.core.clone();
      let span = info_span!("queue_drain", queue = %self.core.name);
      self
        .core
        .handle
        .spawn(async move { QueueCore::run_drain(core).await }.instrument(span));
    }
    let _ = done.await;
  }

  /// Resolves once no task is queued or active. Tasks admitted while
  /// waiting are waited for as well.
  pub async fn wait_for_completion(&self) {
    loop {
      let waiter = {
        let mut shared = self.core.shared.lock();
        if shared.queued.is_empty() && shared.active.is_empty() {
          return;
        }
        let (waiter, settler) = settable_future::<()>();
        shared.completion_waiters.push(settler);
        waiter
      };
      let _ = waiter.await;
    }
  }

  pub fn diagnostics(&self) -> QueueDiagnostics<I, R> {
    let shared = self.core.shared.lock();
    QueueDiagnostics {
      state: shared.state,
      queued: shared.queued.iter().cloned().collect(),
      active: shared.active.clone(),
      succeeded: shared.succeeded.clone(),
      failed: shared.failed.clone(),
      cancelled: shared.cancelled.clone(),
    }
  }

  /// Subscribes to task failures. Cancellations are an expected outcome and
  /// do not reach these handlers.
  pub fn on_error(
    &self,
    handler: impl Fn(&TaskFailureError) + Send + Sync + 'static,
  ) -> ListenerId {
    self.core.error_listeners.subscribe(handler)
  }

  pub fn off_error(&self, id: ListenerId) -> bool {
    self.core.error_listeners.unsubscribe(id)
  }
}

impl<I, R> QueueCore<I, R>
where
  I: Send + Sync + 'static,
  R: Send + 'static,
{
  /// Scheduling tick: while running with spare worker slots, activate the
  /// oldest queued task. Invoked after every admission, cancellation, and
  /// completion.
  fn try_start_next(core: &Arc<Self>) {
    loop {
      let task = {
        let mut shared = core.shared.lock();
        if shared.state != QueueState::Running {
          return;
        }
        if shared.active.len() >= core.max_concurrent_tasks {
          return;
        }
        let Some(task) = shared.queued.pop_front() else {
          return;
        };
        task.cell.lock().state = TaskState::Active;
        shared.active.push(task.clone());
        task
      };
      trace!(queue = %core.name, task_id = %task.id(), "task activated");
      Self::spawn_runner(core, task);
    }
  }

  fn spawn_runner(core: &Arc<Self>, task: Arc<TaskRef<I, R>>) {
    let core = core.clone();
    let span = info_span!("queue_task", queue = %core.name, task_id = %task.id());
    core.handle.clone().spawn(
      async move {
        let source = (core.on_task)(task.clone());
        let outcome = with_timeout(
          source,
          TimeoutOptions {
            timeout: core.per_task_timeout,
            timeout_message: Some(format!("task {} exceeded its deadline", task.id())),
            external_cancel: Some(task.controller.clone()),
            ..TimeoutOptions::default()
          },
        )
        .await;
        Self::finish_task(&core, &task, outcome);
      }
      .instrument(span),
    );
  }

  /// Terminal routing for an active task. Runs the retention pass, wakes
  /// completion waiters, and re-enters the scheduler.
  fn finish_task(
    core: &Arc<Self>,
    task: &Arc<TaskRef<I, R>>,
    outcome: Result<R, WaitError<DynError>>,
  ) {
    let failure_event = {
      let mut shared = core.shared.lock();
      let mut cell = task.cell.lock();
      if cell.state.is_terminal() {
        // Settled behind an earlier cancellation; the outcome is discarded.
        trace!(queue = %core.name, task_id = %task.id(), "late task settlement discarded");
        None
      } else {
        let now = core.clock.now_ms();
        let (next_state, failure) = match outcome {
          Ok(output) => {
            cell.output = Some(output);
            (TaskState::Succeeded, None)
          }
          Err(WaitError::Aborted(abort)) => {
            let failure = TaskFailureError::new(task.id(), Arc::new(abort));
            cell.error = Some(failure);
            (TaskState::Cancelled, None)
          }
          Err(WaitError::Timeout(timeout)) => {
            let failure = TaskFailureError::new(task.id(), Arc::new(timeout));
            cell.error = Some(failure.clone());
            (TaskState::Failed, Some(failure))
          }
          Err(WaitError::Source(error)) => {
            if task.signal().aborted() {
              // Cancellation caused the rejection; it must not overwrite
              // the cancellation outcome.
              let reason = task
                .signal()
                .reason()
                .unwrap_or_else(|| AbortReason::Message("task aborted".to_string()));
              let failure = TaskFailureError::new(task.id(), Arc::new(AbortError { reason }));
              cell.error = Some(failure);
              (TaskState::Cancelled, None)
            } else {
              let failure = TaskFailureError::from_dyn(task.id(), error);
              cell.error = Some(failure.clone());
              (TaskState::Failed, Some(failure))
            }
          }
          Err(WaitError::Panicked(payload)) => {
            let failure = TaskFailureError::new(task.id(), Arc::new(PanicError(payload)));
            cell.error = Some(failure.clone());
            (TaskState::Failed, Some(failure))
          }
        };
        cell.state = next_state;
        cell.completed_at = Some(now);
        drop(cell);

        shared.active.retain(|t| !Arc::ptr_eq(t, task));
        match next_state {
          TaskState::Succeeded => shared.succeeded.push(task.clone()),
          TaskState::Failed => shared.failed.push(task.clone()),
          TaskState::Cancelled => shared.cancelled.push(task.clone()),
          TaskState::Queued | TaskState::Active => unreachable!("terminal routing"),
        }
        shared.terminal_order.push_back(task.clone());
        task.settle_completed();
        debug!(queue = %core.name, task_id = %task.id(), state = ?next_state, "task settled");

        Self::collect_garbage(core, &mut shared);
        Self::notify_if_idle(&mut shared);
        failure
      }
    };
    if let Some(failure) = failure_event {
      warn!(queue = %core.name, error = %failure, "task failed");
      core.error_listeners.emit(&failure);
    }
    Self::try_start_next(core);
  }

  /// Cancellation of a still-queued task; active tasks are routed through
  /// their runner's deadline race instead.
  fn handle_abort(core: &Arc<Self>, task: &Arc<TaskRef<I, R>>, reason: AbortReason) {
    {
      let mut shared = core.shared.lock();
      let mut cell = task.cell.lock();
      if cell.state != TaskState::Queued {
        return;
      }
      cell.state = TaskState::Cancelled;
      cell.error = Some(TaskFailureError::new(
        task.id(),
        Arc::new(AbortError { reason }),
      ));
      cell.completed_at = Some(core.clock.now_ms());
      drop(cell);

      shared.queued.retain(|t| !Arc::ptr_eq(t, task));
      shared.cancelled.push(task.clone());
      shared.terminal_order.push_back(task.clone());
      task.settle_completed();

      Self::collect_garbage(core, &mut shared);
      Self::notify_if_idle(&mut shared);
    }
    debug!(queue = %core.name, task_id = %task.id(), "queued task cancelled before start");
    Self::try_start_next(core);
  }

  /// Retention pass: keep the most recent terminal tasks, evict the rest
  /// and detach their progress listeners.
  fn collect_garbage(core: &Arc<Self>, shared: &mut QueueShared<I, R>) {
    while shared.terminal_order.len() > core.max_completed_task_memory {
      let Some(evicted) = shared.terminal_order.pop_front() else {
        break;
      };
      match evicted.state() {
        TaskState::Succeeded => shared.succeeded.retain(|t| !Arc::ptr_eq(t, &evicted)),
        TaskState::Failed => shared.failed.retain(|t| !Arc::ptr_eq(t, &evicted)),
        TaskState::Cancelled => shared.cancelled.retain(|t| !Arc::ptr_eq(t, &evicted)),
        TaskState::Queued | TaskState::Active => {}
      }
      evicted.progress.clear();
      trace!(queue = %core.name, task_id = %evicted.id(), "terminal task evicted from retention");
    }
  }

  fn notify_if_idle(shared: &mut QueueShared<I, R>) {
    if shared.queued.is_empty() && shared.active.is_empty() {
      for settler in shared.completion_waiters.drain(..) {
        settler.resolve(());
      }
    }
  }

  async fn run_drain(core: Arc<Self>) {
    let pending: Vec<Arc<TaskRef<I, R>>> = {
      let shared = core.shared.lock();
      shared
        .queued
        .iter()
        .chain(shared.active.iter())
        .cloned()
        .collect()
    };
    for task in &pending {
      task.abort(AbortReason::QueueDrained);
    }

    // Nothing can be admitted while draining, so this converges.
    loop {
      let waiting: Vec<SettableFuture<()>> = {
        let shared = core.shared.lock();
        shared
          .queued
          .iter()
          .chain(shared.active.iter())
          .map(|t| t.completed())
          .collect()
      };
      if waiting.is_empty() {
        break;
      }
      for completion in waiting {
        let _ = completion.await;
      }
    }

    let settler = {
      let mut shared = core.shared.lock();
      shared.state = QueueState::Drained;
      shared.drain_settler.take()
    };
    info!(queue = %core.name, "queue drained");
    if let Some(settler) = settler {
      settler.resolve(());
    }
  }
}
