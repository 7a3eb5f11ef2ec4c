use std::sync::Arc;
use std::time::Duration;

use task_harbor::{EnqueueOptions, TaskQueue, TaskRef, TaskState};
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Queue Example ---");

  let queue = TaskQueue::<u64, String>::builder(|task: Arc<TaskRef<u64, String>>| {
    let delay_ms = *task.input();
    async move {
      info!("task {} starting, will sleep for {}ms", task.id(), delay_ms);
      tokio::time::sleep(Duration::from_millis(delay_ms)).await;
      Ok(format!("slept {delay_ms}ms"))
    }
  })
  .name("basic_queue")
  .max_concurrent_tasks(2)
  .build();

  let mut tasks = Vec::new();
  for i in 0..5u64 {
    // Alternate sleep times for variety
    let delay_ms = 200 + i % 3 * 150;
    match queue.enqueue(delay_ms, EnqueueOptions::default()) {
      Ok(task) => {
        info!("enqueued task {} (input {delay_ms})", task.id());
        tasks.push(task);
      }
      Err(e) => tracing::error!("failed to enqueue task {i}: {e}"),
    }
  }

  info!("all tasks enqueued; starting the queue");
  queue.start().expect("queue starts");
  queue.wait_for_completion().await;

  for task in &tasks {
    assert_eq!(task.state(), TaskState::Succeeded);
    info!("task {} -> {:?}", task.id(), task.output());
  }

  queue.drain().await;
  info!("--- Basic Queue Example End ---");
}
