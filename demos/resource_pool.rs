use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use task_harbor::{AcquireOptions, ReleaseOptions, ResourcePool};
use tracing::info;

/// Stand-in for an expensive handle (a connection, a session, a subprocess).
#[derive(Debug)]
struct Connection {
  serial: u32,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Resource Pool Example ---");

  let serials = Arc::new(AtomicU32::new(1));
  let pool = ResourcePool::<Connection>::builder(
    move || {
      let serials = serials.clone();
      async move {
        let serial = serials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        info!("opened connection #{serial}");
        Ok(Connection { serial })
      }
    },
    |connection: Arc<Connection>| async move {
      info!("closed connection #{}", connection.serial);
      Ok(())
    },
  )
  .name("connection_pool")
  .max_resources(2)
  .retire_resource_after_uses(3)
  .build();

  pool.initialize().await.expect("pool initializes");

  for round in 0..4 {
    let lease = pool
      .acquire(AcquireOptions::default())
      .await
      .expect("acquire succeeds");
    info!(
      "round {round}: using connection #{} (lease {})",
      lease.resource().serial,
      lease.id()
    );
    pool
      .release(&lease, ReleaseOptions::default())
      .await
      .expect("release succeeds");
  }

  let diagnostics = pool.diagnostics();
  info!(
    "pool holds {} record(s), {} active lease(s)",
    diagnostics.resources.len(),
    diagnostics.leases.len()
  );

  pool.drain().await;
  info!("--- Resource Pool Example End ---");
}
