use std::sync::Arc;
use std::time::Duration;

use task_harbor::{EnqueueOptions, TaskQueue, TaskRef, TaskState};
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Queue Cancellation Example ---");

  let queue = TaskQueue::<&'static str, String>::builder(
    |task: Arc<TaskRef<&'static str, String>>| {
      let signal = task.signal();
      let label = *task.input();
      async move {
        for step in 0..50 {
          if signal.aborted() {
            info!("{label}: noticed the abort at step {step}, bailing out");
            return Err("aborted cooperatively".into());
          }
          tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(format!("{label} finished"))
      }
    },
  )
  .name("cancellation_demo")
  .max_concurrent_tasks(1)
  .build();

  queue.on_error(|failure| {
    info!("error event: {failure}");
  });

  let doomed = queue.enqueue("doomed", EnqueueOptions::default()).unwrap();
  let queued = queue.enqueue("never-started", EnqueueOptions::default()).unwrap();
  let survivor = queue.enqueue("survivor", EnqueueOptions::default()).unwrap();
  queue.start().expect("queue starts");

  tokio::time::sleep(Duration::from_millis(250)).await;
  info!("cancelling the active task and one queued task");
  doomed.abort("operator changed their mind");
  queued.abort("superseded before it ever ran");

  let _ = survivor.completed().await;

  info!("doomed:        {:?}", doomed.state());
  info!("never-started: {:?}", queued.state());
  info!("survivor:      {:?} -> {:?}", survivor.state(), survivor.output());
  assert_eq!(doomed.state(), TaskState::Cancelled);
  assert_eq!(queued.state(), TaskState::Cancelled);

  queue.drain().await;
  info!("--- Queue Cancellation Example End ---");
}
