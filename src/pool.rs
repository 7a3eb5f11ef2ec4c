use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::abort::AbortController;
use crate::clock::{Clock, SystemClock};
use crate::error::{DynError, PanicError, PoolError, WaitError};
use crate::resource::{DestroyOutcome, InternalLease, Lease, RecordCell, ResourceRecord};
use crate::settable::{settable_future, Rejection, SettableFuture, Settler};
use crate::timeout::{with_timeout, TimeoutOptions};

/// Order in which the pool prefers reuse versus creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMethod {
  /// Reuse an existing resource before creating a new one.
  Lazy,
  /// Create resources up to `max_resources`, then reuse.
  Eager,
}

/// The type of future the `create` callback returns.
pub type CreateFuture<T> = Pin<Box<dyn Future<Output = Result<T, DynError>> + Send + 'static>>;

/// The type of future `destroy`/`on_acquire`/`on_release` callbacks return.
pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), DynError>> + Send + 'static>>;

type CreateFn<T> = Arc<dyn Fn() -> CreateFuture<T> + Send + Sync>;
type DestroyFn<T> = Arc<dyn Fn(Arc<T>) -> CallbackFuture + Send + Sync>;
type LeaseCallback<T> = Arc<dyn Fn(&Lease<T>) -> CallbackFuture + Send + Sync>;

type WaiterOutcome<T> = Result<Arc<InternalLease<T>>, PoolError>;

/// Options accepted by [`ResourcePool::acquire`].
#[derive(Debug, Default)]
pub struct AcquireOptions {
  /// Overrides the pool's default acquire timeout.
  pub timeout: Option<Duration>,
  /// External cancellation for this acquire. A timed-out acquire aborts the
  /// controller so sibling consumers of the token observe it.
  pub cancel: Option<AbortController>,
}

/// Options accepted by [`ResourcePool::release`] and
/// [`ResourcePool::retire`].
#[derive(Debug, Default)]
pub struct ReleaseOptions {
  /// Overrides the pool's default release timeout.
  pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ResourceDiagnostics {
  pub id: u64,
  pub created_at: u64,
  pub retired_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LeaseDiagnostics {
  pub id: u64,
  pub resource_id: u64,
}

/// Point-in-time snapshot of pool records and active leases.
#[derive(Debug, Clone)]
pub struct PoolDiagnostics {
  pub resources: Vec<ResourceDiagnostics>,
  pub leases: Vec<LeaseDiagnostics>,
}

struct PoolShared<T> {
  records: Vec<Arc<ResourceRecord<T>>>,
  waiters: VecDeque<Settler<WaiterOutcome<T>>>,
  drained: bool,
  drain_done: Option<SettableFuture<()>>,
  drain_settler: Option<Settler<()>>,
}

struct PoolCore<T> {
  name: Arc<String>,
  create: CreateFn<T>,
  destroy: DestroyFn<T>,
  on_acquire: Option<LeaseCallback<T>>,
  on_release: Option<LeaseCallback<T>>,
  allocation_method: AllocationMethod,
  max_leases_per_resource: usize,
  min_resources: usize,
  max_resources: usize,
  max_queued_acquire_requests: usize,
  retire_after_uses: Option<usize>,
  retire_after: Option<Duration>,
  force_destroy_retired_after: Option<Duration>,
  create_timeout: Option<Duration>,
  destroy_timeout: Option<Duration>,
  default_acquire_timeout: Option<Duration>,
  default_release_timeout: Option<Duration>,
  silence_release_errors: bool,
  clock: Arc<dyn Clock>,
  handle: TokioHandle,
  lease_index: DashMap<u64, Arc<InternalLease<T>>>,
  next_resource_id: AtomicU64,
  next_lease_id: AtomicU64,
  shared: Mutex<PoolShared<T>>,
}

/// Concurrent resource pool with multi-lease records, lifecycle-based
/// retirement, and back-pressured FIFO acquisition.
///
/// All scheduling decisions are consolidated into one synchronous
/// revalidate step that runs after every lease, release, retire, destroy,
/// or drain mutation: it retires overdue records, begins destruction of
/// idle or forcibly overdue retired records, keeps the configured floor
/// populated, and wakes as many parked acquirers as current capacity
/// allows, oldest first.
pub struct ResourcePool<T> {
  core: Arc<PoolCore<T>>,
}

impl<T> Clone for ResourcePool<T> {
  fn clone(&self) -> Self {
    Self {
      core: self.core.clone(),
    }
  }
}

impl<T> fmt::Debug for ResourcePool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let shared = self.core.shared.lock();
    f.debug_struct("ResourcePool")
      .field("name", &self.core.name)
      .field("records", &shared.records.len())
      .field("waiters", &shared.waiters.len())
      .field("drained", &shared.drained)
      .finish_non_exhaustive()
  }
}

/// Builder for [`ResourcePool`]; `create` and `destroy` are the mandatory
/// inputs.
pub struct ResourcePoolBuilder<T> {
  name: String,
  create: CreateFn<T>,
  destroy: DestroyFn<T>,
  on_acquire: Option<LeaseCallback<T>>,
  on_release: Option<LeaseCallback<T>>,
  allocation_method: AllocationMethod,
  max_leases_per_resource: usize,
  min_resources: usize,
  max_resources: usize,
  max_queued_acquire_requests: usize,
  retire_after_uses: Option<usize>,
  retire_after: Option<Duration>,
  force_destroy_retired_after: Option<Duration>,
  create_timeout: Option<Duration>,
  destroy_timeout: Option<Duration>,
  default_acquire_timeout: Option<Duration>,
  default_release_timeout: Option<Duration>,
  silence_release_errors: bool,
  clock: Arc<dyn Clock>,
  tokio_handle: Option<TokioHandle>,
}

impl<T> ResourcePoolBuilder<T>
where
  T: Send + Sync + 'static,
{
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Runs before a lease is handed to the caller; a failure aborts the
  /// acquire and releases the reservation.
  pub fn on_acquire<F, Fut>(mut self, callback: F) -> Self
  where
    F: Fn(&Lease<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DynError>> + Send + 'static,
  {
    self.on_acquire = Some(Arc::new(move |lease| {
      Box::pin(callback(lease)) as CallbackFuture
    }));
    self
  }

  /// Runs during release; a failure is surfaced (unless silenced) but the
  /// lease is dropped regardless.
  pub fn on_release<F, Fut>(mut self, callback: F) -> Self
  where
    F: Fn(&Lease<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DynError>> + Send + 'static,
  {
    self.on_release = Some(Arc::new(move |lease| {
      Box::pin(callback(lease)) as CallbackFuture
    }));
    self
  }

  pub fn allocation_method(mut self, method: AllocationMethod) -> Self {
    self.allocation_method = method;
    self
  }

  pub fn max_concurrent_leases_per_resource(mut self, limit: usize) -> Self {
    self.max_leases_per_resource = limit.max(1);
    self
  }

  /// Floor of records the pool keeps populated while not drained.
  pub fn min_resources(mut self, floor: usize) -> Self {
    self.min_resources = floor;
    self
  }

  pub fn max_resources(mut self, limit: usize) -> Self {
    self.max_resources = limit.max(1);
    self
  }

  pub fn max_queued_acquire_requests(mut self, limit: usize) -> Self {
    self.max_queued_acquire_requests = limit;
    self
  }

  /// Retire a record once its total lease count reaches `uses`.
  pub fn retire_resource_after_uses(mut self, uses: usize) -> Self {
    self.retire_after_uses = Some(uses.max(1));
    self
  }

  /// Retire a record once it has existed this long.
  pub fn retire_resource_after(mut self, age: Duration) -> Self {
    self.retire_after = Some(age);
    self
  }

  /// Forcibly destroy a retired record still holding active leases once it
  /// has been retired this long.
  pub fn force_destroy_retired_after(mut self, grace: Duration) -> Self {
    self.force_destroy_retired_after = Some(grace);
    self
  }

  pub fn create_timeout(mut self, timeout: Duration) -> Self {
    self.create_timeout = Some(timeout);
    self
  }

  pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
    self.destroy_timeout = Some(timeout);
    self
  }

  pub fn default_acquire_timeout(mut self, timeout: Duration) -> Self {
    self.default_acquire_timeout = Some(timeout);
    self
  }

  pub fn default_release_timeout(mut self, timeout: Duration) -> Self {
    self.default_release_timeout = Some(timeout);
    self
  }

  pub fn silence_release_errors(mut self, silence: bool) -> Self {
    self.silence_release_errors = silence;
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

  pub fn build(self) -> ResourcePool<T> {
    let handle = self.tokio_handle.unwrap_or_else(TokioHandle::current);
    ResourcePool {
      core: Arc::new(PoolCore {
        name: Arc::new(self.name),
        create: self.create,
        destroy: self.destroy,
        on_acquire: self.on_acquire,
        on_release: self.on_release,
        allocation_method: self.allocation_method,
        max_leases_per_resource: self.max_leases_per_resource,
        min_resources: self.min_resources,
        max_resources: self.max_resources,
        max_queued_acquire_requests: self.max_queued_acquire_requests,
        retire_after_uses: self.retire_after_uses,
        retire_after: self.retire_after,
        force_destroy_retired_after: self.force_destroy_retired_after,
        create_timeout: self.create_timeout,
        destroy_timeout: self.destroy_timeout,
        default_acquire_timeout: self.default_acquire_timeout,
        default_release_timeout: self.default_release_timeout,
        silence_release_errors: self.silence_release_errors,
        clock: self.clock,
        handle,
        lease_index: DashMap::new(),
        next_resource_id: AtomicU64::new(1),
        next_lease_id: AtomicU64::new(1),
        shared: Mutex::new(PoolShared {
          records: Vec::new(),
          waiters: VecDeque::new(),
          drained: false,
          drain_done: None,
          drain_settler: None,
        }),
      }),
    }
  }
}

impl<T> ResourcePool<T>
where
  T: Send + Sync + 'static,
{
  /// Starts a builder around the two mandatory lifecycle callbacks.
  pub fn builder<C, CFut, D, DFut>(create: C, destroy: D) -> ResourcePoolBuilder<T>
  where
    C: Fn() -> CFut + Send + Sync + 'static,
    CFut: Future<Output = Result<T, DynError>> + Send + 'static,
    D: Fn(Arc<T>) -> DFut + Send + Sync + 'static,
    DFut: Future<Output = Result<(), DynError>> + Send + 'static,
  {
    ResourcePoolBuilder {
      name: "resource-pool".to_string(),
      create: Arc::new(move || Box::pin(create()) as CreateFuture<T>),
      destroy: Arc::new(move |resource| Box::pin(destroy(resource)) as CallbackFuture),
      on_acquire: None,
      on_release: None,
      allocation_method: AllocationMethod::Lazy,
      max_leases_per_resource: 1,
      min_resources: 0,
      max_resources: usize::MAX,
      max_queued_acquire_requests: usize::MAX,
      retire_after_uses: None,
      retire_after: None,
      force_destroy_retired_after: None,
      create_timeout: None,
      destroy_timeout: None,
      default_acquire_timeout: None,
      default_release_timeout: None,
      silence_release_errors: false,
      clock: Arc::new(SystemClock),
      tokio_handle: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.core.name
  }

  pub fn resource_count(&self) -> usize {
    self.core.shared.lock().records.len()
  }

  pub fn active_lease_count(&self) -> usize {
    self.core.lease_index.len()
  }

  pub fn queued_acquire_count(&self) -> usize {
    self.core.shared.lock().waiters.len()
  }

  /// Populates the configured floor and awaits every pending creation.
  pub async fn initialize(&self) -> Result<(), PoolError> {
    if self.core.shared.lock().drained {
      return Err(PoolError::Drained);
    }
    PoolCore::revalidate(&self.core);
    let pending: Vec<_> = {
      let shared = self.core.shared.lock();
      shared.records.iter().map(|r| r.resource.clone()).collect()
    };
    for resource in pending {
      if let Err(rejection) = resource.await {
        return Err(PoolCore::<T>::rejection_to_pool_error(rejection));
      }
    }
    Ok(())
  }

  /// Grants a lease, creating or reusing a resource per the allocation
  /// method, or parks the request until capacity frees up.
  pub async fn acquire(&self, options: AcquireOptions) -> Result<Lease<T>, PoolError> {
    let core = self.core.clone();
    if core.shared.lock().drained {
      return Err(PoolError::Drained);
    }
    let timeout = options.timeout.or(core.default_acquire_timeout);
    // A lease granted after the deadline has no owner; the hook returns it.
    let late_core = core.clone();
    let outcome = with_timeout(
      PoolCore::acquire_procedure(core),
      TimeoutOptions {
        timeout,
        timeout_message: Some("acquire timed out".to_string()),
        external_cancel: options.cancel,
        on_late_resolve: Some(Box::new(move |lease: Lease<T>| {
          debug!(
            pool = %late_core.name,
            lease_id = lease.id,
            "releasing lease granted after its acquire deadline"
          );
          let handle = late_core.handle.clone();
          handle.spawn(async move {
            if let Err(error) = PoolCore::release_procedure(late_core, lease).await {
              debug!(error = %error, "late lease release failed");
            }
          });
        })),
        on_late_reject: Some(Box::new(|error: PoolError| {
          debug!(error = %error, "acquire failed after its deadline");
        })),
        ..TimeoutOptions::default()
      },
    )
    .await;
    outcome.map_err(PoolError::from)
  }

  /// Returns a lease to the pool. A callback failure or a destroy failure
  /// on the lease's (already-destroying) record is surfaced unless release
  /// errors are silenced; the lease is dropped in every case.
  pub async fn release(&self, lease: &Lease<T>, options: ReleaseOptions) -> Result<(), PoolError> {
    let core = self.core.clone();
    let timeout = options.timeout.or(core.default_release_timeout);
    let outcome = with_timeout(
      PoolCore::release_procedure(core, lease.clone()),
      TimeoutOptions {
        timeout,
        timeout_message: Some("release timed out".to_string()),
        ..TimeoutOptions::default()
      },
    )
    .await;
    match outcome {
      Ok(()) => Ok(()),
      Err(error) => Err(PoolError::from(error)),
    }
  }

  /// Marks the lease's record retired, then releases the lease.
  pub async fn retire(&self, lease: &Lease<T>, options: ReleaseOptions) -> Result<(), PoolError> {
    let core = &self.core;
    let Some(internal) = core.lease_index.get(&lease.id).map(|e| e.value().clone()) else {
      return Err(PoolError::UnknownLease(lease.id));
    };
    {
      let _shared = core.shared.lock();
      let mut cell = internal.record.cell.lock();
      if cell.retired_at.is_none() {
        cell.retired_at = Some(core.clock.now_ms());
      }
    }
    info!(pool = %core.name, resource_id = internal.record.id, "resource retired by caller");
    PoolCore::revalidate(core);
    self.release(lease, options).await
  }

  /// Destroys every record (cancelling the leases on them), rejects parked
  /// acquires, and awaits all destructions. Idempotent: later calls await
  /// the same completion.
  pub async fn drain(&self) {
    let (done, run) = {
      let mut shared = self.core.shared.lock();
      match shared.drain_done.clone() {
        Some(done) => (done, false),
        None => {
          let (done, settler) = settable_future::<()>();
          shared.drain_done = Some(done.clone());
          shared.drain_settler = Some(settler);
          shared.drained = true;
          (done, true)
        }
      }
    };
    if run {
      info!(pool = %self.core.name, "pool draining");
      let core = self.core.clone();
      let span = info_span!("pool_drain", pool = %self.core.name);
      self
        .core
        .handle
        .spawn(async move { PoolCore::run_drain(core).await }.instrument(span));
    }
    let _ = done.await;
  }

  pub fn diagnostics(&self) -> PoolDiagnostics {
    let shared = self.core.shared.lock();
    let mut resources = Vec::with_capacity(shared.records.len());
    let mut leases = Vec::new();
    for record in &shared.records {
      let cell = record.cell.lock();
      resources.push(ResourceDiagnostics {
        id: record.id,
        created_at: record.created_at,
        retired_at: cell.retired_at,
      });
      for lease in &cell.active_leases {
        leases.push(LeaseDiagnostics {
          id: lease.id,
          resource_id: record.id,
        });
      }
    }
    PoolDiagnostics { resources, leases }
  }
}

impl<T> PoolCore<T>
where
  T: Send + Sync + 'static,
{
  /// The pool's scheduling tick. Synchronous; runs after every mutation.
  fn revalidate(core: &Arc<Self>) {
    let now = core.clock.now_ms();
    let mut wakeups: Vec<(Settler<WaiterOutcome<T>>, WaiterOutcome<T>)> = Vec::new();
    {
      let mut shared = core.shared.lock();

      // Retirement by use count or age.
      for record in &shared.records {
        let mut cell = record.cell.lock();
        if cell.retired_at.is_some() {
          continue;
        }
        let by_uses = core
          .retire_after_uses
          .map_or(false, |limit| cell.total_uses() >= limit);
        let by_age = core.retire_after.map_or(false, |age| {
          now.saturating_sub(record.created_at) >= age.as_millis() as u64
        });
        if by_uses || by_age {
          cell.retired_at = Some(now);
          debug!(
            pool = %core.name,
            resource_id = record.id,
            uses = cell.total_uses(),
            "resource retired"
          );
        }
      }

      // Destruction of idle retired records and forcibly overdue ones.
      let mut doomed = Vec::new();
      shared.records.retain(|record| {
        let cell = record.cell.lock();
        let Some(retired_at) = cell.retired_at else {
          return true;
        };
        let idle = cell.active_leases.is_empty();
        let overdue = core.force_destroy_retired_after.map_or(false, |grace| {
          now.saturating_sub(retired_at) >= grace.as_millis() as u64
        });
        if idle || overdue {
          doomed.push((record.clone(), !idle));
          false
        } else {
          true
        }
      });
      for (record, forced) in doomed {
        Self::begin_destruction(core, record, forced);
      }

      // Floor population.
      if !shared.drained {
        let floor = core.min_resources.min(core.max_resources);
        while shared.records.len() < floor {
          Self::create_record(core, &mut shared);
        }
      }

      // Wake as many of the oldest waiters as capacity allows, handing each
      // its allocated lease.
      while !shared.waiters.is_empty() && Self::capacity(core, &shared) > 0 {
        let outcome = match Self::try_allocate(core, &mut shared) {
          Some(lease) => Ok(lease),
          None => {
            error!(pool = %core.name, "capacity reported with no allocatable lease");
            Err(PoolError::Internal(
              "waiter woken without allocatable capacity".to_string(),
            ))
          }
        };
        let failed = outcome.is_err();
        if let Some(waiter) = shared.waiters.pop_front() {
          wakeups.push((waiter, outcome));
        }
        if failed {
          break;
        }
      }
    }
    for (waiter, outcome) in wakeups {
      waiter.resolve(outcome);
    }
  }

  /// Spare lease slots on live records plus headroom for records not yet
  /// created. Retired records contribute nothing but still occupy their
  /// slot in the record set.
  fn capacity(core: &Self, shared: &PoolShared<T>) -> usize {
    let mut capacity = 0usize;
    for record in &shared.records {
      let cell = record.cell.lock();
      if cell.retired_at.is_some() {
        continue;
      }
      capacity = capacity.saturating_add(
        core
          .max_leases_per_resource
          .saturating_sub(cell.active_leases.len()),
      );
    }
    let headroom = core.max_resources.saturating_sub(shared.records.len());
    capacity.saturating_add(headroom.saturating_mul(core.max_leases_per_resource))
  }

  fn try_allocate(core: &Arc<Self>, shared: &mut PoolShared<T>) -> Option<Arc<InternalLease<T>>> {
    match core.allocation_method {
      AllocationMethod::Lazy => {
        Self::allocate_existing(core, shared).or_else(|| Self::allocate_fresh(core, shared))
      }
      AllocationMethod::Eager => {
        Self::allocate_fresh(core, shared).or_else(|| Self::allocate_existing(core, shared))
      }
    }
  }

  /// First record (insertion order) with a spare lease slot.
  fn allocate_existing(
    core: &Arc<Self>,
    shared: &mut PoolShared<T>,
  ) -> Option<Arc<InternalLease<T>>> {
    let record = shared
      .records
      .iter()
      .find(|record| {
        let cell = record.cell.lock();
        cell.retired_at.is_none() && cell.active_leases.len() < core.max_leases_per_resource
      })?
      .clone();
    Some(Self::lease_record(core, &record))
  }

  fn allocate_fresh(core: &Arc<Self>, shared: &mut PoolShared<T>) -> Option<Arc<InternalLease<T>>> {
    if shared.records.len() >= core.max_resources {
      return None;
    }
    let record = Self::create_record(core, shared);
    Some(Self::lease_record(core, &record))
  }

  fn lease_record(core: &Arc<Self>, record: &Arc<ResourceRecord<T>>) -> Arc<InternalLease<T>> {
    let lease = Arc::new(InternalLease {
      id: core.next_lease_id.fetch_add(1, AtomicOrdering::Relaxed),
      leased_at: core.clock.now_ms(),
      record: record.clone(),
    });
    record.cell.lock().active_leases.push(lease.clone());
    trace!(pool = %core.name, resource_id = record.id, lease_id = lease.id, "lease allocated");
    lease
  }

  /// Registers a record and spawns the driver that runs the user `create`
  /// under its timeout.
  fn create_record(core: &Arc<Self>, shared: &mut PoolShared<T>) -> Arc<ResourceRecord<T>> {
    let id = core.next_resource_id.fetch_add(1, AtomicOrdering::Relaxed);
    let (resource, settler) = settable_future::<Arc<T>>();
    let record = Arc::new(ResourceRecord {
      id,
      created_at: core.clock.now_ms(),
      resource,
      cell: Mutex::new(RecordCell {
        retired_at: None,
        active_leases: Vec::new(),
        past_leases: Vec::new(),
        destroy: None,
      }),
    });
    shared.records.push(record.clone());
    debug!(pool = %core.name, resource_id = id, "creating resource");
    Self::spawn_create_driver(core, record.clone(), settler);
    record
  }

  fn spawn_create_driver(
    core: &Arc<Self>,
    record: Arc<ResourceRecord<T>>,
    settler: Settler<Arc<T>>,
  ) {
    let core = core.clone();
    let span = info_span!("resource_create", pool = %core.name, resource_id = record.id);
    core.handle.clone().spawn(
      async move {
        let source = (core.create)();
        // A resource born after the deadline cannot be kept; tear it down.
        let late_core = core.clone();
        let outcome = with_timeout(
          source,
          TimeoutOptions {
            timeout: core.create_timeout,
            timeout_message: Some("resource creation timed out".to_string()),
            on_late_resolve: Some(Box::new(move |resource: T| {
              debug!(
                pool = %late_core.name,
                "destroying resource that finished creating after its deadline"
              );
              let resource = Arc::new(resource);
              let handle = late_core.handle.clone();
              handle.spawn(async move {
                if let Err(error) = (late_core.destroy)(resource).await {
                  warn!(error = %error, "late-born resource destruction failed");
                }
              });
            })),
            on_late_reject: Some(Box::new(|error: DynError| {
              debug!(error = %error, "creation failed after losing its deadline race");
            })),
            ..TimeoutOptions::default()
          },
        )
        .await;
        match outcome {
          Ok(resource) => {
            settler.resolve(Arc::new(resource));
          }
          Err(wait_error) => {
            let pool_error = match wait_error {
              WaitError::Timeout(e) => PoolError::Timeout(e),
              WaitError::Aborted(e) => PoolError::Aborted(e),
              WaitError::Source(e) => PoolError::CreateFailed(Arc::from(e)),
              WaitError::Panicked(p) => PoolError::CreateFailed(Arc::new(PanicError(p))),
            };
            warn!(pool = %core.name, resource_id = record.id, error = %pool_error, "resource creation failed");
            settler.reject(Arc::new(pool_error));
            Self::fail_record(&core, &record);
          }
        }
      }
      .instrument(span),
    );
  }

  /// Bookkeeping for a record whose creation failed: drop it from the set
  /// immediately so parked acquirers are not starved.
  fn fail_record(core: &Arc<Self>, record: &Arc<ResourceRecord<T>>) {
    {
      let mut shared = core.shared.lock();
      shared.records.retain(|r| r.id != record.id);
      let mut cell = record.cell.lock();
      if cell.destroy.is_none() {
        let (done, settler) = settable_future::<DestroyOutcome>();
        settler.resolve(Ok(()));
        cell.destroy = Some(done);
      }
    }
    Self::revalidate(core);
  }

  /// Detaches the record (the caller has already removed it from the record
  /// set, or is holding the set lock doing so) and spawns its destruction
  /// driver. Idempotent per record.
  fn begin_destruction(
    core: &Arc<Self>,
    record: Arc<ResourceRecord<T>>,
    forced: bool,
  ) -> SettableFuture<DestroyOutcome> {
    let (done, settler) = {
      let mut cell = record.cell.lock();
      if let Some(existing) = &cell.destroy {
        return existing.clone();
      }
      let (done, settler) = settable_future::<DestroyOutcome>();
      cell.destroy = Some(done.clone());
      (done, settler)
    };
    debug!(pool = %core.name, resource_id = record.id, forced, "destroying resource");
    let core = core.clone();
    let span = info_span!("resource_destroy", pool = %core.name, resource_id = record.id);
    core.handle.clone().spawn(
      async move {
        let resource = match record.resource.clone().await {
          Ok(resource) => resource,
          Err(_) => {
            // Creation never produced a resource; nothing to tear down.
            settler.resolve(Ok(()));
            return;
          }
        };
        let source = (core.destroy)(resource);
        let outcome = with_timeout(
          source,
          TimeoutOptions {
            timeout: core.destroy_timeout,
            timeout_message: Some("resource destruction timed out".to_string()),
            on_late_resolve: Some(Box::new(|_| {
              trace!("destruction finished after its deadline");
            })),
            on_late_reject: Some(Box::new(|error: DynError| {
              warn!(error = %error, "destruction failed after its deadline");
            })),
            ..TimeoutOptions::default()
          },
        )
        .await;
        let result = match outcome {
          Ok(()) => Ok(()),
          Err(wait_error) => Err(match wait_error {
            WaitError::Timeout(e) => PoolError::Timeout(e),
            WaitError::Aborted(e) => PoolError::Aborted(e),
            WaitError::Source(e) => PoolError::DestroyFailed(Arc::from(e)),
            WaitError::Panicked(p) => PoolError::DestroyFailed(Arc::new(PanicError(p))),
          }),
        };
        if let Err(error) = &result {
          warn!(pool = %core.name, resource_id = record.id, error = %error, "resource destruction failed");
        }
        settler.resolve(result);
      }
      .instrument(span),
    );
    done
  }

  async fn acquire_procedure(core: Arc<Self>) -> Result<Lease<T>, PoolError> {
    Self::revalidate(&core);

    let slot = {
      let mut shared = core.shared.lock();
      if shared.drained {
        return Err(PoolError::Drained);
      }
      match Self::try_allocate(&core, &mut shared) {
        Some(lease) => Ok(lease),
        None => {
          if shared.waiters.len() >= core.max_queued_acquire_requests {
            warn!(
              pool = %core.name,
              limit = core.max_queued_acquire_requests,
              "acquire rejected: waiter queue full"
            );
            return Err(PoolError::AcquireQueueFull {
              limit: core.max_queued_acquire_requests,
            });
          }
          let (waiter, settler) = settable_future::<WaiterOutcome<T>>();
          shared.waiters.push_back(settler);
          trace!(pool = %core.name, waiting = shared.waiters.len(), "acquire parked");
          Err(waiter)
        }
      }
    };

    let internal = match slot {
      Ok(lease) => lease,
      Err(waiter) => match waiter.await {
        Ok(Ok(lease)) => lease,
        Ok(Err(error)) => return Err(error),
        Err(rejection) => {
          return Err(PoolError::Internal(format!(
            "acquire waiter abandoned: {rejection}"
          )))
        }
      },
    };

    let resource = match internal.record.resource.clone().await {
      Ok(resource) => resource,
      Err(rejection) => {
        Self::unwind_lease(&core, &internal);
        return Err(Self::rejection_to_pool_error(rejection));
      }
    };

    let lease = Lease {
      id: internal.id,
      resource_id: internal.record.id,
      resource,
    };
    if let Some(on_acquire) = &core.on_acquire {
      if let Err(error) = on_acquire(&lease).await {
        let error = PoolError::CallbackFailed(Arc::from(error));
        warn!(pool = %core.name, lease_id = lease.id, error = %error, "acquire callback failed");
        Self::unwind_lease(&core, &internal);
        return Err(error);
      }
    }
    core.lease_index.insert(internal.id, internal.clone());
    trace!(pool = %core.name, lease_id = lease.id, resource_id = lease.resource_id, "lease acquired");
    Ok(lease)
  }

  /// Returns a reserved lease that was never handed to the caller.
  fn unwind_lease(core: &Arc<Self>, internal: &Arc<InternalLease<T>>) {
    {
      let _shared = core.shared.lock();
      let mut cell = internal.record.cell.lock();
      cell.active_leases.retain(|l| l.id != internal.id);
      cell.past_leases.push(internal.clone());
    }
    Self::revalidate(core);
  }

  async fn release_procedure(core: Arc<Self>, lease: Lease<T>) -> Result<(), PoolError> {
    // The index removal is the authoritative claim; a concurrent double
    // release observes an unknown lease.
    let Some((_, internal)) = core.lease_index.remove(&lease.id) else {
      return Err(PoolError::UnknownLease(lease.id));
    };

    let callback_error = match &core.on_release {
      Some(on_release) => on_release(&lease).await.err(),
      None => None,
    };

    {
      let _shared = core.shared.lock();
      let mut cell = internal.record.cell.lock();
      cell.active_leases.retain(|l| l.id != internal.id);
      cell.past_leases.push(internal.clone());
    }
    debug!(pool = %core.name, lease_id = lease.id, resource_id = internal.record.id, "lease released");
    Self::revalidate(&core);

    // When the record is (now) destroying, the destruction outcome belongs
    // to this caller.
    let destroy_watch = internal.record.cell.lock().destroy.clone();
    if let Some(watch) = destroy_watch {
      match watch.await {
        Ok(Ok(())) | Err(_) => {}
        Ok(Err(error)) => {
          if core.silence_release_errors {
            debug!(pool = %core.name, error = %error, "destroy error silenced on release");
          } else {
            return Err(error);
          }
        }
      }
    }

    match callback_error {
      Some(error) if core.silence_release_errors => {
        debug!(pool = %core.name, error = %error, "release callback error silenced");
        Ok(())
      }
      Some(error) => Err(PoolError::CallbackFailed(Arc::from(error))),
      None => Ok(()),
    }
  }

  async fn run_drain(core: Arc<Self>) {
    let (waiters, records) = {
      let mut shared = core.shared.lock();
      (
        std::mem::take(&mut shared.waiters),
        std::mem::take(&mut shared.records),
      )
    };
    for waiter in waiters {
      waiter.resolve(Err(PoolError::Drained));
    }
    let watches: Vec<_> = records
      .into_iter()
      .map(|record| Self::begin_destruction(&core, record, true))
      .collect();
    for watch in watches {
      let _ = watch.await;
    }
    let settler = {
      let mut shared = core.shared.lock();
      shared.drain_settler.take()
    };
    info!(pool = %core.name, "pool drained");
    if let Some(settler) = settler {
      settler.resolve(());
    }
  }

  fn rejection_to_pool_error(rejection: Rejection) -> PoolError {
    match rejection.0.downcast_ref::<PoolError>() {
      Some(error) => error.clone(),
      None => PoolError::CreateFailed(rejection.0.clone()),
    }
  }
}
