use leakguard::{TaskProbe, WorkerPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Worker Pool Example ---");

  let probe = TaskProbe::new();
  let workers = std::thread::available_parallelism().map_or(4, |n| n.get());
  let pool = WorkerPool::new(workers, Handle::current(), "records_pool").with_probe(probe.clone());

  info!("Live pool tasks before: {}", probe.live_count());

  // The order of the records does not matter, so several workers can
  // process them at once.
  let names = vec!["Anna", "Jacob", "Kell", "Carter", "Rory"];
  match pool
    .run(names, |name: &'static str| async move { name.to_uppercase() })
    .await
  {
    Ok(results) => {
      for result in results {
        match result.outcome {
          Ok(output) => info!("[worker {}]: output {}", result.worker_id, output),
          Err(e) => info!("[worker {}]: item {} failed: {}", result.worker_id, result.seq, e),
        }
      }
    }
    Err(e) => tracing::error!("Pool run failed: {}", e),
  }

  let leaked = probe.settle(Duration::from_secs(1)).await;
  info!("Live pool tasks after: {}", leaked);
  info!("--- Worker Pool Example End ---");
}
