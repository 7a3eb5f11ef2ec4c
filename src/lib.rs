//! A Tokio-based toolkit of bounded-concurrency primitives: a cancellable
//! FIFO task queue with per-task deadlines and diagnostic retention, and a
//! concurrent resource pool with multi-lease records, lifecycle-based
//! retirement, and back-pressured acquisition. Both are built on a small
//! substrate of async combinators (settable futures, a deadline race with
//! late-settlement cleanup, bounded retry, settle-state inspection).

mod abort;
mod clock;
mod error;
mod events;
mod inspect;
mod pool;
mod queue;
mod resource;
mod retry;
mod settable;
mod single_lease;
mod task;
mod timeout;

pub use abort::{AbortController, AbortReason, AbortSignal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
  AbortError, ArcError, DynError, LateRejectionError, PanicError, PoolError, QueueError,
  TaskFailureError, TimeoutError, WaitError,
};
pub use events::ListenerId;
pub use inspect::{with_inspection, DebugValues, InspectedFuture};
pub use pool::{
  AcquireOptions, AllocationMethod, CallbackFuture, CreateFuture, LeaseDiagnostics,
  PoolDiagnostics, ReleaseOptions, ResourceDiagnostics, ResourcePool, ResourcePoolBuilder,
};
pub use queue::{
  EnqueueOptions, QueueDiagnostics, QueueState, TaskFuture, TaskQueue, TaskQueueBuilder,
};
pub use resource::Lease;
pub use retry::{with_retry, with_retry_and_cleanup};
pub use settable::{settable_future, Rejection, SettableFuture, Settler, SettlerDropped};
pub use single_lease::SingleLeasePool;
pub use task::{ProgressUpdate, TaskRef, TaskState};
pub use timeout::{flush_scheduled_work, with_timeout, TimeoutOptions};
