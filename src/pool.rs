use crate::error::{PoolError, WorkError};
use crate::probe::{self, TaskProbe};
use crate::signal::CancelSignal;
use crate::task_queue::{QueueConsumer, TaskQueue, WorkItem};

use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// The result of processing one [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResult<R> {
  /// Sequence number of the item this result belongs to.
  pub seq: usize,
  /// Index of the worker that processed the item.
  pub worker_id: usize,
  pub outcome: Result<R, WorkError>,
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
  /// The queue was closed and empty.
  Drained,
  /// The run's cancel signal fired while the worker was waiting for an item
  /// or trying to publish a result.
  Canceled,
  /// The collector stopped listening; the last result was discarded.
  Abandoned,
}

/// A fixed-size pool of workers draining a closable queue.
///
/// Every call to [`WorkerPool::spawn`] or [`WorkerPool::run`] starts its own
/// `worker_count` workers; a pool value only carries configuration.
#[derive(Clone)]
pub struct WorkerPool {
  pool_name: Arc<String>,
  worker_count: usize,
  tokio_handle: TokioHandle,
  cancel: Option<CancelSignal>,
  probe: Option<TaskProbe>,
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("worker_count", &self.worker_count)
      .field("has_cancel", &self.cancel.is_some())
      .field("has_probe", &self.probe.is_some())
      .finish_non_exhaustive()
  }
}

impl WorkerPool {
  /// # Panics
  /// Panics if `worker_count` is zero.
  pub fn new(worker_count: usize, tokio_handle: TokioHandle, pool_name: &str) -> Self {
    assert!(worker_count > 0, "worker pool needs at least one worker");
    Self {
      pool_name: Arc::new(pool_name.to_string()),
      worker_count,
      tokio_handle,
      cancel: None,
      probe: None,
    }
  }

  /// Stops every run of this pool once `signal` fires.
  pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
    self.cancel = Some(signal);
    self
  }

  pub fn with_probe(mut self, probe: TaskProbe) -> Self {
    self.probe = Some(probe);
    self
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  /// Starts the workers on `queue` and returns the collector for their results.
  ///
  /// Each worker takes items until the queue is closed and drained, runs
  /// `work` on each one and publishes a [`WorkResult`]. A panic inside `work`
  /// becomes `WorkError::Panicked` on that item's result; the worker carries on.
  pub fn spawn<T, R, F, Fut>(&self, queue: QueueConsumer<T>, work: F) -> PoolRun<R>
  where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    let run_signal = self.cancel.as_ref().map_or_else(CancelSignal::new, CancelSignal::child);
    // One slot per worker: a worker holds at most one unpublished result.
    let (results_tx, results_rx) = mpsc::channel(self.worker_count);
    let work = Arc::new(work);

    info!(
      pool_name = %self.pool_name,
      workers = self.worker_count,
      queued = queue.len(),
      queue_closed = queue.is_closed(),
      "Starting workers."
    );

    let workers = (0..self.worker_count)
      .map(|worker_id| {
        let probe_guard = probe::track(self.probe.as_ref(), || {
          format!("{}/worker-{}", self.pool_name, worker_id)
        });
        let worker = Worker {
          worker_id,
          queue: queue.clone(),
          results_tx: results_tx.clone(),
          work: work.clone(),
          signal: run_signal.clone(),
        };
        self.tokio_handle.spawn(
          async move {
            let _probe_guard = probe_guard;
            worker.run().await
          }
          .instrument(info_span!("pool_worker", pool_name = %self.pool_name, worker_id)),
        )
      })
      .collect();

    PoolRun {
      pool_name: self.pool_name.clone(),
      results_rx,
      workers,
      signal: run_signal,
      received: 0,
    }
  }

  /// Processes every item and returns exactly one result per item, in no
  /// particular order.
  ///
  /// The items are loaded into a closed queue before the workers start. The
  /// call reads one result per item and then waits for every worker to exit,
  /// so no worker outlives it.
  ///
  /// # Errors
  /// `PoolError::Canceled` if the pool's cancel signal fired before all
  /// results arrived. `PoolError::WorkersLost` if the workers went away
  /// without being cancelled, e.g. because their runtime shut down. The
  /// workers have exited by then in both cases.
  pub async fn run<T, R, F, Fut, I>(&self, items: I, work: F) -> Result<Vec<WorkResult<R>>, PoolError>
  where
    I: IntoIterator<Item = T>,
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    let queue = TaskQueue::from_items(items);
    let expected = queue.len();
    let mut run = self.spawn(queue, work);

    let mut results = Vec::with_capacity(expected);
    while results.len() < expected {
      match run.next().await {
        Some(result) => {
          trace!(pool_name = %self.pool_name, seq = result.seq, worker_id = result.worker_id, "Collected result.");
          results.push(result);
        }
        None => break,
      }
    }

    let received = results.len();
    // Read before joining: join fires the signal itself.
    let canceled = run.signal().is_cancelled();
    let exits = run.join().await;
    debug!(pool_name = %self.pool_name, received, expected, exits = ?exits, "Run finished.");

    if received < expected {
      if canceled {
        warn!(pool_name = %self.pool_name, received, expected, "Run cancelled before every result arrived.");
        return Err(PoolError::Canceled { received, expected });
      }
      error!(pool_name = %self.pool_name, received, expected, "Workers stopped before every result arrived.");
      return Err(PoolError::WorkersLost { received, expected });
    }
    Ok(results)
  }

  /// Like [`WorkerPool::run`] for fallible work. An `Err` from `work` is
  /// recorded as `WorkError::Failed` on that item's result only.
  pub async fn try_run<T, R, E, F, Fut, I>(&self, items: I, work: F) -> Result<Vec<WorkResult<R>>, PoolError>
  where
    I: IntoIterator<Item = T>,
    T: Send + 'static,
    R: Send + 'static,
    E: Display,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    let results = self
      .run(items, move |item| {
        let fut = work(item);
        async move { fut.await.map_err(|e| e.to_string()) }
      })
      .await?;

    Ok(
      results
        .into_iter()
        .map(|result| WorkResult {
          seq: result.seq,
          worker_id: result.worker_id,
          outcome: match result.outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(WorkError::Failed(message)),
            Err(e) => Err(e),
          },
        })
        .collect(),
    )
  }
}

struct Worker<T, R, F> {
  worker_id: usize,
  queue: QueueConsumer<T>,
  results_tx: mpsc::Sender<WorkResult<R>>,
  work: Arc<F>,
  signal: CancelSignal,
}

impl<T, R, F, Fut> Worker<T, R, F>
where
  T: Send + 'static,
  R: Send + 'static,
  F: Fn(T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = R> + Send + 'static,
{
  async fn run(self) -> WorkerExit {
    debug!("Worker started.");

    let exit = loop {
      let WorkItem { seq, value } = tokio::select! {
        biased;
        _ = self.signal.cancelled() => break WorkerExit::Canceled,
        next = self.queue.next() => match next {
          Some(item) => item,
          None => break WorkerExit::Drained,
        },
      };
      trace!(seq, "Took item.");

      let work = self.work.clone();
      let outcome = match AssertUnwindSafe(async move { (*work)(value).await }).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
          let failure = WorkError::from_panic(payload);
          warn!(seq, error = %failure, "Work panicked; the failure is attached to the item's result.");
          Err(failure)
        }
      };

      let result = WorkResult {
        seq,
        worker_id: self.worker_id,
        outcome,
      };

      tokio::select! {
        biased;
        sent = self.results_tx.send(result) => {
          if sent.is_err() {
            debug!(seq, "Collector stopped listening; result discarded.");
            break WorkerExit::Abandoned;
          }
          trace!(seq, "Published result.");
        }
        _ = self.signal.cancelled() => {
          debug!(seq, "Cancelled while publishing; result discarded.");
          break WorkerExit::Canceled;
        }
      }
    };

    debug!(?exit, "Worker stopped.");
    exit
  }
}

/// Collector for one run of a [`WorkerPool`].
///
/// Dropping it fires the run's cancel signal, so workers never outlive a
/// collector that went away.
pub struct PoolRun<R> {
  pool_name: Arc<String>,
  results_rx: mpsc::Receiver<WorkResult<R>>,
  workers: Vec<JoinHandle<WorkerExit>>,
  signal: CancelSignal,
  received: usize,
}

impl<R> fmt::Debug for PoolRun<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolRun")
      .field("pool_name", &self.pool_name)
      .field("received", &self.received)
      .field("live_workers", &self.live_workers())
      .field("cancelled", &self.signal.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl<R> PoolRun<R> {
  /// Waits for the next result. Returns `None` once every worker has exited
  /// and all published results have been read.
  pub async fn next(&mut self) -> Option<WorkResult<R>> {
    let result = self.results_rx.recv().await;
    if result.is_some() {
      self.received += 1;
    }
    result
  }

  /// Number of results read so far.
  pub fn received(&self) -> usize {
    self.received
  }

  /// Number of workers that have not finished yet.
  pub fn live_workers(&self) -> usize {
    self.workers.iter().filter(|handle| !handle.is_finished()).count()
  }

  /// The run's cancel signal.
  pub fn signal(&self) -> &CancelSignal {
    &self.signal
  }

  /// Asks every worker to stop at its next suspension point.
  pub fn cancel(&self) {
    info!(pool_name = %*self.pool_name, "Run cancellation requested.");
    self.signal.cancel();
  }

  /// Stops listening for results, fires the run's signal and waits for every
  /// worker to exit.
  ///
  /// Results that were published but not read are discarded. Workers that were
  /// waiting to publish, or were still working, stop with
  /// `WorkerExit::Abandoned`. Workers waiting for an item stop with
  /// `WorkerExit::Canceled`, so an open queue cannot hold the join up. Workers
  /// that had already drained the queue report `WorkerExit::Drained`.
  pub async fn join(mut self) -> Vec<WorkerExit> {
    self.results_rx.close();
    let mut discarded = 0usize;
    while self.results_rx.try_recv().is_ok() {
      discarded += 1;
    }
    if discarded > 0 {
      warn!(pool_name = %*self.pool_name, discarded, "Discarded unread results while joining.");
    }
    self.signal.cancel();

    let workers = std::mem::take(&mut self.workers);
    info!(pool_name = %*self.pool_name, workers = workers.len(), "Waiting for workers to join.");

    let mut exits = Vec::with_capacity(workers.len());
    for joined in join_all(workers).await {
      match joined {
        Ok(exit) => exits.push(exit),
        Err(join_error) => {
          error!(pool_name = %*self.pool_name, "Error joining worker: {:?}", join_error);
        }
      }
    }
    exits
  }
}

impl<R> Drop for PoolRun<R> {
  fn drop(&mut self) {
    if self.signal.is_cancelled() {
      return;
    }
    let live = self.live_workers();
    if live > 0 {
      info!(
        pool_name = %*self.pool_name,
        live_workers = live,
        "PoolRun dropped with live workers. Cancelling the run."
      );
    }
    self.signal.cancel();
  }
}
