use leakguard::{CancelSignal, CancelableRequest, Outcome, TaskProbe};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

// The first argument seeds the work duration, so a run can be repeated.
fn seed_from_args() -> u64 {
  std::env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(42)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Cancelable Request Example ---");

  let mut rng = StdRng::seed_from_u64(seed_from_args());
  let delay = Duration::from_millis(rng.random_range(0..200));
  info!("Work will take {:?}; the request allows 100ms.", delay);

  let probe = TaskProbe::new();
  let parent = CancelSignal::new();
  let request = CancelableRequest::new(Duration::from_millis(100), Handle::current(), "search")
    .with_parent(&parent)
    .with_probe(probe.clone());

  let outcome = request
    .run(move |signal| async move {
      tokio::select! {
        _ = tokio::time::sleep(delay) => Some("some value".to_string()),
        _ = signal.cancelled() => None,
      }
    })
    .await;

  match outcome {
    Outcome::Completed(Some(record)) => info!("Received: {}", record),
    Outcome::Completed(None) => info!("Search stopped early."),
    Outcome::TimedOut => info!("Timed out"),
    Outcome::Canceled => info!("Canceled"),
    Outcome::Failed(e) => info!("Search failed: {}", e),
  }

  let leaked = probe.settle(Duration::from_millis(200)).await;
  info!("Live request tasks after: {}", leaked);
  info!("--- Cancelable Request Example End ---");
}
