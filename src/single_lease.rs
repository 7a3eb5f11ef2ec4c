use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::error::PoolError;
use crate::pool::{AcquireOptions, PoolDiagnostics, ReleaseOptions, ResourcePool};
use crate::resource::Lease;

/// Adapter over [`ResourcePool`] keyed by resource identity instead of
/// lease identity: callers hold the resource itself and hand it back to
/// release or retire it.
///
/// At most one lease per resource may be outstanding through the adapter; a
/// second acquire landing on an already-tracked resource is returned to the
/// pool and rejected.
pub struct SingleLeasePool<T> {
  pool: ResourcePool<T>,
  leases: DashMap<usize, Lease<T>>,
}

impl<T> SingleLeasePool<T>
where
  T: Send + Sync + 'static,
{
  pub fn wrap(pool: ResourcePool<T>) -> Self {
    Self {
      pool,
      leases: DashMap::new(),
    }
  }

  pub async fn acquire(&self, options: AcquireOptions) -> Result<Arc<T>, PoolError> {
    let lease = self.pool.acquire(options).await?;
    let key = Arc::as_ptr(lease.resource()) as usize;
    let resource = lease.resource().clone();
    let inserted = match self.leases.entry(key) {
      dashmap::mapref::entry::Entry::Occupied(_) => false,
      dashmap::mapref::entry::Entry::Vacant(slot) => {
        slot.insert(lease.clone());
        true
      }
    };
    if !inserted {
      warn!(
        pool = %self.pool.name(),
        lease_id = lease.id(),
        "second lease landed on an already-tracked resource"
      );
      let _ = self.pool.release(&lease, ReleaseOptions::default()).await;
      return Err(PoolError::LeaseNotConcurrent);
    }
    Ok(resource)
  }

  pub async fn release(&self, resource: &Arc<T>, options: ReleaseOptions) -> Result<(), PoolError> {
    let key = Arc::as_ptr(resource) as usize;
    let Some((_, lease)) = self.leases.remove(&key) else {
      return Err(PoolError::UnleasedResource);
    };
    self.pool.release(&lease, options).await
  }

  pub async fn retire(&self, resource: &Arc<T>, options: ReleaseOptions) -> Result<(), PoolError> {
    let key = Arc::as_ptr(resource) as usize;
    let Some((_, lease)) = self.leases.remove(&key) else {
      return Err(PoolError::UnleasedResource);
    };
    self.pool.retire(&lease, options).await
  }

  pub async fn drain(&self) {
    self.leases.clear();
    self.pool.drain().await;
  }

  pub fn diagnostics(&self) -> PoolDiagnostics {
    self.pool.diagnostics()
  }
}

impl<T> fmt::Debug for SingleLeasePool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SingleLeasePool")
      .field("tracked", &self.leases.len())
      .finish_non_exhaustive()
  }
}
