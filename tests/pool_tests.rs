use leakguard::{CancelSignal, PoolError, TaskProbe, TaskQueue, WorkError, WorkerExit, WorkerPool};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle as TokioHandle;
use tokio::time::sleep;

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,leakguard=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// Sleeps for a random few milliseconds so workers interleave.
async fn jitter(max_ms: u64) {
  let delay = rand::rng().random_range(0..=max_ms);
  sleep(Duration::from_millis(delay)).await;
}

#[tokio::test]
async fn test_run_uppercases_every_record() {
  setup_tracing_for_test();
  let pool_name = "test_pool_uppercase";
  tracing::info!("Starting test: {}", pool_name);
  let pool = WorkerPool::new(3, TokioHandle::current(), pool_name);

  let names = vec!["Anna", "Jacob", "Kell", "Carter", "Rory"];
  let results = pool
    .run(names.clone(), |name: &'static str| async move { name.to_uppercase() })
    .await
    .unwrap();

  assert_eq!(results.len(), 5);
  let mut seqs: Vec<usize> = results.iter().map(|r| r.seq).collect();
  seqs.sort_unstable();
  assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

  for result in &results {
    assert_eq!(result.outcome, Ok(names[result.seq].to_uppercase()));
    assert!(result.worker_id < 3);
  }
  tracing::info!("Finished test: {}", pool_name);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_once_for_any_worker_count() {
  setup_tracing_for_test();
  for (item_count, worker_count) in [(0usize, 1usize), (1, 1), (7, 1), (7, 3), (50, 4), (5, 16)] {
    let pool = WorkerPool::new(worker_count, TokioHandle::current(), "test_pool_exactly_once");
    let results = pool
      .run(0..item_count, |n: usize| async move {
        jitter(3).await;
        n * 10
      })
      .await
      .unwrap();

    assert_eq!(results.len(), item_count, "N={} W={}", item_count, worker_count);
    let mut seen = HashSet::new();
    for result in results {
      assert!(seen.insert(result.seq), "seq {} produced twice", result.seq);
      assert_eq!(result.outcome, Ok(result.seq * 10));
    }
    assert_eq!(seen, (0..item_count).collect::<HashSet<_>>());
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_worker_outlives_run() {
  setup_tracing_for_test();
  let probe = TaskProbe::new();
  let pool = WorkerPool::new(4, TokioHandle::current(), "test_pool_no_leak").with_probe(probe.clone());
  assert_eq!(probe.live_count(), 0);

  let results = pool
    .run(0..20u32, |n| async move {
      jitter(5).await;
      n
    })
    .await
    .unwrap();
  assert_eq!(results.len(), 20);

  // `run` joins its workers before returning.
  assert_eq!(probe.live_count(), 0, "live tasks: {:?}", probe.live_labels());
}

#[tokio::test]
async fn test_panicking_item_does_not_stall_siblings() {
  setup_tracing_for_test();
  let probe = TaskProbe::new();
  let pool = WorkerPool::new(2, TokioHandle::current(), "test_pool_panic").with_probe(probe.clone());

  let inputs = vec!["a", "boom", "c", "d"];
  let results = pool
    .run(inputs, |s: &'static str| async move {
      if s == "boom" {
        panic!("cannot process {}", s);
      }
      s.to_uppercase()
    })
    .await
    .unwrap();

  assert_eq!(results.len(), 4);
  let failures: Vec<_> = results.iter().filter(|r| r.outcome.is_err()).collect();
  assert_eq!(failures.len(), 1);
  assert_eq!(failures[0].seq, 1);
  assert_eq!(failures[0].outcome, Err(WorkError::Panicked("cannot process boom".to_string())));
  assert_eq!(probe.live_count(), 0);
}

#[tokio::test]
async fn test_try_run_attaches_failure_to_its_item() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(3, TokioHandle::current(), "test_pool_try_run");

  let results = pool
    .try_run(vec!["1", "2", "three", "4"], |s: &'static str| async move { s.parse::<u32>() })
    .await
    .unwrap();

  assert_eq!(results.len(), 4);
  for result in results {
    match result.seq {
      2 => assert!(matches!(result.outcome, Err(WorkError::Failed(_))), "got {:?}", result.outcome),
      seq => assert_eq!(result.outcome, Ok(seq as u32 + 1)),
    }
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_external_cancel_ends_run_without_leaks() {
  setup_tracing_for_test();
  let probe = TaskProbe::new();
  let cancel = CancelSignal::new();
  let pool = WorkerPool::new(2, TokioHandle::current(), "test_pool_external_cancel")
    .with_cancel(cancel.clone())
    .with_probe(probe.clone());

  let canceller = cancel.clone();
  tokio::spawn(async move {
    sleep(Duration::from_millis(60)).await;
    canceller.cancel();
  });

  let outcome = tokio::time::timeout(
    Duration::from_secs(2),
    pool.run(0..100u32, |n| async move {
      sleep(Duration::from_millis(20)).await;
      n
    }),
  )
  .await
  .expect("cancelled run should return promptly");

  match outcome {
    Err(PoolError::Canceled { received, expected }) => {
      assert_eq!(expected, 100);
      assert!(received < 100, "received {}", received);
    }
    other => panic!("Expected PoolError::Canceled, got {:?}", other.map(|r| r.len())),
  }
  assert_eq!(probe.live_count(), 0, "live tasks: {:?}", probe.live_labels());
}

#[tokio::test]
async fn test_dropping_collector_releases_workers() {
  setup_tracing_for_test();
  let probe = TaskProbe::new();
  let pool = WorkerPool::new(3, TokioHandle::current(), "test_pool_drop_collector").with_probe(probe.clone());

  // The producer stays open, so only cancellation can end the workers.
  let (mut producer, consumer) = TaskQueue::bounded::<u32>(8);
  for n in 0..6 {
    producer.push(n).await.unwrap();
  }

  let mut run = pool.spawn(consumer, |n| async move { n + 1 });
  let first = run.next().await.expect("at least one result");
  assert!(first.outcome.is_ok());
  assert_eq!(probe.live_count(), 3);

  drop(run);
  assert_eq!(probe.settle(Duration::from_millis(500)).await, 0, "live tasks: {:?}", probe.live_labels());

  // No consumer is left to take more work.
  assert_eq!(producer.push(99).await, Err(PoolError::QueueDisconnected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progressive_feeding_ends_when_producer_closes() {
  setup_tracing_for_test();
  let probe = TaskProbe::new();
  let pool = WorkerPool::new(3, TokioHandle::current(), "test_pool_progressive").with_probe(probe.clone());

  let (mut producer, consumer) = TaskQueue::bounded::<u32>(2);
  let mut run = pool.spawn(consumer, |n| async move {
    jitter(2).await;
    n * n
  });

  let feeder = tokio::spawn(async move {
    for n in 0..30u32 {
      producer.push(n).await.unwrap();
    }
    producer.close();
  });

  let mut squares = Vec::new();
  while let Some(result) = run.next().await {
    squares.push(result.outcome.unwrap());
  }
  feeder.await.unwrap();

  squares.sort_unstable();
  assert_eq!(squares, (0..30u32).map(|n| n * n).collect::<Vec<_>>());
  assert_eq!(run.received(), 30);

  let exits = run.join().await;
  assert_eq!(exits, vec![WorkerExit::Drained; 3]);
  assert_eq!(probe.live_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bounded_by_worker_count() {
  setup_tracing_for_test();
  let pool_name = "test_pool_concurrency";
  let pool = WorkerPool::new(3, TokioHandle::current(), pool_name);
  // (running now, highest seen)
  let gauge = Arc::new(parking_lot::Mutex::new((0usize, 0usize)));

  let work_gauge = gauge.clone();
  let results = pool
    .run(0..24u32, move |n| {
      let gauge = work_gauge.clone();
      async move {
        {
          let mut g = gauge.lock();
          g.0 += 1;
          g.1 = g.1.max(g.0);
        }
        sleep(Duration::from_millis(10)).await;
        gauge.lock().0 -= 1;
        n
      }
    })
    .await
    .unwrap();

  assert_eq!(results.len(), 24);
  let (running, peak) = *gauge.lock();
  assert_eq!(running, 0);
  assert!(peak <= 3, "peak concurrency {} exceeded worker count", peak);
  assert!(peak > 1, "workers never overlapped");

  let workers_used: HashSet<usize> = results.iter().map(|r| r.worker_id).collect();
  assert!(workers_used.len() > 1, "only workers {:?} took items", workers_used);
}
