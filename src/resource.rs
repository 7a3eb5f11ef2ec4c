use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::settable::SettableFuture;

/// Future of the user-created resource, shared between a record, its leases,
/// and its destruction driver. May still be pending while leases against the
/// record already exist.
pub(crate) type ResourceFuture<T> = SettableFuture<Arc<T>>;

/// Outcome of a record's destruction, shared with any `release` that lands
/// while the record is being torn down.
pub(crate) type DestroyOutcome = Result<(), PoolError>;

pub(crate) struct RecordCell<T> {
  /// Set at most once; a retired record refuses new leases.
  pub(crate) retired_at: Option<u64>,
  pub(crate) active_leases: Vec<Arc<InternalLease<T>>>,
  pub(crate) past_leases: Vec<Arc<InternalLease<T>>>,
  /// Present once destruction has begun. The record leaves the pool's set
  /// at that instant, but this future stays awaitable.
  pub(crate) destroy: Option<SettableFuture<DestroyOutcome>>,
}

impl<T> RecordCell<T> {
  pub(crate) fn total_uses(&self) -> usize {
    self.active_leases.len() + self.past_leases.len()
  }
}

/// One pooled resource plus its lease bookkeeping.
pub(crate) struct ResourceRecord<T> {
  pub(crate) id: u64,
  pub(crate) created_at: u64,
  pub(crate) resource: ResourceFuture<T>,
  pub(crate) cell: Mutex<RecordCell<T>>,
}

/// A granted lease as tracked inside the pool.
pub(crate) struct InternalLease<T> {
  pub(crate) id: u64,
  #[allow(dead_code)]
  pub(crate) leased_at: u64,
  pub(crate) record: Arc<ResourceRecord<T>>,
}

/// Public view of a granted lease: the resolved resource plus the
/// identifiers needed to release or retire it later.
pub struct Lease<T> {
  pub(crate) id: u64,
  pub(crate) resource_id: u64,
  pub(crate) resource: Arc<T>,
}

impl<T> Lease<T> {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn resource_id(&self) -> u64 {
    self.resource_id
  }

  pub fn resource(&self) -> &Arc<T> {
    &self.resource
  }
}

impl<T> Clone for Lease<T> {
  fn clone(&self) -> Self {
    Self {
      id: self.id,
      resource_id: self.resource_id,
      resource: self.resource.clone(),
    }
  }
}

impl<T> fmt::Debug for Lease<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Lease")
      .field("id", &self.id)
      .field("resource_id", &self.resource_id)
      .finish_non_exhaustive()
  }
}
