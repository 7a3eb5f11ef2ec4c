use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use task_harbor::{
  flush_scheduled_work, AcquireOptions, AllocationMethod, ManualClock, PoolError, ReleaseOptions,
  ResourcePool, ResourcePoolBuilder, SingleLeasePool,
};
use tokio::time::sleep;

// Helper to initialize tracing for tests; Once ensures a single init.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,task_harbor=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[derive(Default)]
struct LifecycleCounters {
  created: AtomicUsize,
  destroyed: AtomicUsize,
}

/// Pool over incrementing integers: the first created resource is 1, the
/// second 2, and so on.
fn counting_pool_builder(counters: Arc<LifecycleCounters>) -> ResourcePoolBuilder<u32> {
  let create_counters = counters.clone();
  let destroy_counters = counters;
  ResourcePool::<u32>::builder(
    move || {
      let counters = create_counters.clone();
      async move { Ok(counters.created.fetch_add(1, Ordering::SeqCst) as u32 + 1) }
    },
    move |_resource| {
      let counters = destroy_counters.clone();
      async move {
        counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    },
  )
}

#[tokio::test]
async fn lazy_allocation_reuses_before_creating() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("lazy")
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(**first.resource(), 1);
  pool.release(&first, ReleaseOptions::default()).await.unwrap();

  let second = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(**second.resource(), 1, "lazy allocation reuses the idle resource");
  pool.release(&second, ReleaseOptions::default()).await.unwrap();

  assert_eq!(counters.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn eager_allocation_creates_until_the_cap() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("eager")
    .allocation_method(AllocationMethod::Eager)
    .max_resources(3)
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  pool.release(&first, ReleaseOptions::default()).await.unwrap();
  let second = pool.acquire(AcquireOptions::default()).await.unwrap();

  assert_eq!(counters.created.load(Ordering::SeqCst), 2);
  assert_ne!(
    **second.resource(),
    **first.resource(),
    "eager allocation prefers a fresh resource"
  );
  pool.release(&second, ReleaseOptions::default()).await.unwrap();
}

#[tokio::test]
async fn full_pool_parks_acquires_and_bounds_the_waiter_queue() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("backpressure")
    .max_resources(2)
    .max_queued_acquire_requests(2)
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  let second = pool.acquire(AcquireOptions::default()).await.unwrap();

  let pool_third = pool.clone();
  let third = tokio::spawn(async move { pool_third.acquire(AcquireOptions::default()).await });
  let pool_fourth = pool.clone();
  let fourth = tokio::spawn(async move { pool_fourth.acquire(AcquireOptions::default()).await });
  flush_scheduled_work().await;
  assert_eq!(pool.queued_acquire_count(), 2);

  let overflow = pool.acquire(AcquireOptions::default()).await.unwrap_err();
  match &overflow {
    PoolError::AcquireQueueFull { limit } => assert_eq!(*limit, 2),
    other => panic!("expected a full waiter queue, got {other:?}"),
  }
  assert!(overflow.to_string().contains("queue size"));

  // Freeing one lease wakes exactly the oldest waiter.
  pool.release(&first, ReleaseOptions::default()).await.unwrap();
  let third_lease = third.await.unwrap().unwrap();
  assert_eq!(pool.queued_acquire_count(), 1);
  assert_eq!(counters.created.load(Ordering::SeqCst), 2);

  pool.release(&second, ReleaseOptions::default()).await.unwrap();
  let fourth_lease = fourth.await.unwrap().unwrap();
  pool
    .release(&third_lease, ReleaseOptions::default())
    .await
    .unwrap();
  pool
    .release(&fourth_lease, ReleaseOptions::default())
    .await
    .unwrap();
}

#[tokio::test]
async fn one_resource_carries_multiple_leases() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("multi-lease")
    .max_resources(1)
    .max_concurrent_leases_per_resource(2)
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  let second = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(**first.resource(), 1);
  assert_eq!(**second.resource(), 1);
  assert_eq!(counters.created.load(Ordering::SeqCst), 1);

  let pool_third = pool.clone();
  let third = tokio::spawn(async move { pool_third.acquire(AcquireOptions::default()).await });
  flush_scheduled_work().await;
  assert_eq!(pool.queued_acquire_count(), 1);

  pool.release(&first, ReleaseOptions::default()).await.unwrap();
  let third_lease = third.await.unwrap().unwrap();
  assert_eq!(**third_lease.resource(), 1);
  assert_eq!(counters.created.load(Ordering::SeqCst), 1);

  pool.release(&second, ReleaseOptions::default()).await.unwrap();
  pool
    .release(&third_lease, ReleaseOptions::default())
    .await
    .unwrap();
}

#[tokio::test]
async fn use_count_retirement_cycles_resources() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("retire-uses")
    .retire_resource_after_uses(2)
    .build();

  for _ in 0..4 {
    let lease = pool.acquire(AcquireOptions::default()).await.unwrap();
    pool.release(&lease, ReleaseOptions::default()).await.unwrap();
  }
  flush_scheduled_work().await;

  // Two leases per resource, so four cycles consume exactly two resources.
  assert_eq!(counters.created.load(Ordering::SeqCst), 2);
  assert_eq!(counters.destroyed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn age_retirement_replaces_old_resources() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let clock = Arc::new(ManualClock::new(0));
  let pool = counting_pool_builder(counters.clone())
    .name("retire-age")
    .retire_resource_after(Duration::from_secs(60))
    .clock(clock.clone())
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(**first.resource(), 1);
  pool.release(&first, ReleaseOptions::default()).await.unwrap();

  clock.advance(61_000);
  let second = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(**second.resource(), 2, "aged-out resource is replaced");
  flush_scheduled_work().await;
  assert_eq!(counters.created.load(Ordering::SeqCst), 2);
  assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
  pool.release(&second, ReleaseOptions::default()).await.unwrap();
}

#[tokio::test]
async fn caller_retirement_discards_the_resource() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("retire-explicit")
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  pool.retire(&first, ReleaseOptions::default()).await.unwrap();
  flush_scheduled_work().await;
  assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

  let second = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(**second.resource(), 2);
  pool.release(&second, ReleaseOptions::default()).await.unwrap();
}

#[tokio::test]
async fn retired_resources_still_count_against_the_cap() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("retired-in-cap")
    .max_resources(1)
    .retire_resource_after_uses(1)
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();

  let pool_second = pool.clone();
  let second = tokio::spawn(async move { pool_second.acquire(AcquireOptions::default()).await });
  flush_scheduled_work().await;

  // The record is retired with an active lease: it refuses new leases but
  // still occupies the only slot, so the acquire parks instead of creating.
  assert_eq!(counters.created.load(Ordering::SeqCst), 1);
  assert_eq!(pool.queued_acquire_count(), 1);

  pool.release(&first, ReleaseOptions::default()).await.unwrap();
  let second_lease = second.await.unwrap().unwrap();
  assert_eq!(**second_lease.resource(), 2);
  assert_eq!(counters.created.load(Ordering::SeqCst), 2);
  flush_scheduled_work().await;
  assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
  pool
    .release(&second_lease, ReleaseOptions::default())
    .await
    .unwrap();
}

#[tokio::test]
async fn initialize_populates_the_floor() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("floor")
    .min_resources(2)
    .build();

  pool.initialize().await.unwrap();
  assert_eq!(counters.created.load(Ordering::SeqCst), 2);
  assert_eq!(pool.resource_count(), 2);

  // The floor is reused, not exceeded.
  let lease = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(counters.created.load(Ordering::SeqCst), 2);
  pool.release(&lease, ReleaseOptions::default()).await.unwrap();
}

#[tokio::test]
async fn create_failure_surfaces_and_later_acquires_recover() {
  setup_tracing_for_test();
  let attempts = Arc::new(AtomicUsize::new(0));
  let attempts_clone = attempts.clone();
  let pool = ResourcePool::<u32>::builder(
    move || {
      let attempts = attempts_clone.clone();
      async move {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
          Err("forge is cold".into())
        } else {
          Ok(7)
        }
      }
    },
    |_resource| async move { Ok(()) },
  )
  .name("create-failure")
  .build();

  let error = pool.acquire(AcquireOptions::default()).await.unwrap_err();
  match &error {
    PoolError::CreateFailed(inner) => assert!(inner.to_string().contains("forge is cold")),
    other => panic!("expected a creation failure, got {other:?}"),
  }
  assert_eq!(pool.active_lease_count(), 0);

  let lease = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(**lease.resource(), 7);
  pool.release(&lease, ReleaseOptions::default()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn create_timeout_destroys_the_late_born_resource() {
  setup_tracing_for_test();
  let destroyed = Arc::new(AtomicUsize::new(0));
  let destroyed_clone = destroyed.clone();
  let pool = ResourcePool::<u32>::builder(
    || async move {
      sleep(Duration::from_millis(200)).await;
      Ok(7)
    },
    move |_resource| {
      let destroyed = destroyed_clone.clone();
      async move {
        destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    },
  )
  .name("create-timeout")
  .create_timeout(Duration::from_millis(50))
  .build();

  let error = pool.acquire(AcquireOptions::default()).await.unwrap_err();
  assert!(matches!(error, PoolError::Timeout(_)), "got {error:?}");

  // The abandoned creation eventually produces a resource; the pool cannot
  // keep it and must tear it down.
  sleep(Duration::from_millis(300)).await;
  flush_scheduled_work().await;
  assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn acquire_timeout_releases_the_lease_it_missed() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("acquire-timeout")
    .max_resources(1)
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();

  let error = pool
    .acquire(AcquireOptions {
      timeout: Some(Duration::from_millis(100)),
      ..AcquireOptions::default()
    })
    .await
    .unwrap_err();
  assert!(matches!(error, PoolError::Timeout(_)), "got {error:?}");

  // The parked request is still honored once capacity frees up; its lease
  // has no owner and is returned straight to the pool.
  pool.release(&first, ReleaseOptions::default()).await.unwrap();
  flush_scheduled_work().await;
  flush_scheduled_work().await;
  assert_eq!(pool.active_lease_count(), 0);
  assert_eq!(pool.queued_acquire_count(), 0);
  assert_eq!(counters.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acquire_callback_failure_releases_the_reservation() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("on-acquire")
    .on_acquire(|_lease| async move { Err("warmup probe failed".into()) })
    .build();

  let error = pool.acquire(AcquireOptions::default()).await.unwrap_err();
  match &error {
    PoolError::CallbackFailed(inner) => assert!(inner.to_string().contains("warmup probe failed")),
    other => panic!("expected a callback failure, got {other:?}"),
  }
  assert_eq!(pool.active_lease_count(), 0);
  assert!(pool.diagnostics().leases.is_empty());
}

#[tokio::test]
async fn release_callback_failure_still_releases() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("on-release")
    .on_release(|_lease| async move { Err("flush failed".into()) })
    .build();

  let lease = pool.acquire(AcquireOptions::default()).await.unwrap();
  let error = pool
    .release(&lease, ReleaseOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(error, PoolError::CallbackFailed(_)), "got {error:?}");
  assert_eq!(pool.active_lease_count(), 0, "the lease is gone regardless");

  // The resource itself survives and is reused.
  let again = pool.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(counters.created.load(Ordering::SeqCst), 1);
  pool.release(&again, ReleaseOptions::default()).await.unwrap_err();
}

#[tokio::test]
async fn silenced_release_errors_are_swallowed() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters)
    .name("silenced-release")
    .on_release(|_lease| async move { Err("flush failed".into()) })
    .silence_release_errors(true)
    .build();

  let lease = pool.acquire(AcquireOptions::default()).await.unwrap();
  pool.release(&lease, ReleaseOptions::default()).await.unwrap();
  assert_eq!(pool.active_lease_count(), 0);
}

#[tokio::test]
async fn double_release_reports_an_unknown_lease() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters).name("double-release").build();

  let lease = pool.acquire(AcquireOptions::default()).await.unwrap();
  pool.release(&lease, ReleaseOptions::default()).await.unwrap();
  let error = pool
    .release(&lease, ReleaseOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(error, PoolError::UnknownLease(_)), "got {error:?}");
}

#[tokio::test]
async fn drain_tears_everything_down_and_is_terminal() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("drain")
    .max_resources(2)
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  let _second = pool.acquire(AcquireOptions::default()).await.unwrap();

  let pool_parked = pool.clone();
  let parked = tokio::spawn(async move { pool_parked.acquire(AcquireOptions::default()).await });
  flush_scheduled_work().await;
  assert_eq!(pool.queued_acquire_count(), 1);

  pool.drain().await;
  assert_eq!(counters.destroyed.load(Ordering::SeqCst), 2);
  assert!(matches!(parked.await.unwrap(), Err(PoolError::Drained)));
  assert!(matches!(
    pool.acquire(AcquireOptions::default()).await,
    Err(PoolError::Drained)
  ));
  assert!(matches!(pool.initialize().await, Err(PoolError::Drained)));

  // Leases on destroyed records can still be handed back.
  pool.release(&first, ReleaseOptions::default()).await.unwrap();

  // Idempotent: a second drain awaits the same, already-finished teardown.
  pool.drain().await;
}

#[tokio::test]
async fn diagnostics_reflect_records_and_leases() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let clock = Arc::new(ManualClock::new(5_000));
  let pool = counting_pool_builder(counters)
    .name("diagnostics")
    .max_resources(2)
    .clock(clock)
    .build();

  let first = pool.acquire(AcquireOptions::default()).await.unwrap();
  let second = pool.acquire(AcquireOptions::default()).await.unwrap();

  let diagnostics = pool.diagnostics();
  assert_eq!(diagnostics.resources.len(), 2);
  assert_eq!(diagnostics.leases.len(), 2);
  assert!(diagnostics.resources.iter().all(|r| r.created_at == 5_000));
  assert!(diagnostics.resources.iter().all(|r| r.retired_at.is_none()));
  let resource_ids: Vec<u64> = diagnostics.resources.iter().map(|r| r.id).collect();
  for lease in &diagnostics.leases {
    assert!(resource_ids.contains(&lease.resource_id));
  }

  pool.retire(&first, ReleaseOptions::default()).await.unwrap();
  let diagnostics = pool.diagnostics();
  assert_eq!(diagnostics.resources.len(), 1);
  assert_eq!(diagnostics.leases.len(), 1);

  pool.release(&second, ReleaseOptions::default()).await.unwrap();
}

#[tokio::test]
async fn single_lease_adapter_is_keyed_by_resource() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters.clone())
    .name("single-lease")
    .build();
  let adapter = SingleLeasePool::wrap(pool);

  let resource = adapter.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(*resource, 1);
  adapter
    .release(&resource, ReleaseOptions::default())
    .await
    .unwrap();
  assert!(matches!(
    adapter.release(&resource, ReleaseOptions::default()).await,
    Err(PoolError::UnleasedResource)
  ));

  let resource = adapter.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(*resource, 1, "released resource is reused");
  adapter
    .retire(&resource, ReleaseOptions::default())
    .await
    .unwrap();
  flush_scheduled_work().await;
  assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

  adapter.drain().await;
}

#[tokio::test]
async fn single_lease_adapter_rejects_a_concurrent_second_lease() {
  setup_tracing_for_test();
  let counters = Arc::new(LifecycleCounters::default());
  let pool = counting_pool_builder(counters)
    .name("single-lease-conflict")
    .max_resources(1)
    .max_concurrent_leases_per_resource(2)
    .build();
  let adapter = SingleLeasePool::wrap(pool.clone());

  let resource = adapter.acquire(AcquireOptions::default()).await.unwrap();
  assert_eq!(*resource, 1);

  let error = adapter.acquire(AcquireOptions::default()).await.unwrap_err();
  assert!(matches!(error, PoolError::LeaseNotConcurrent), "got {error:?}");
  assert_eq!(pool.active_lease_count(), 1, "the duplicate lease was returned");

  adapter
    .release(&resource, ReleaseOptions::default())
    .await
    .unwrap();
}
