use crate::error::WorkError;
use crate::probe::{self, TaskProbe};
use crate::signal::{CancelSignal, Deadline, DoneReason};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, info_span, trace, Instrument};

/// How a request ended, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<R> {
  Completed(R),
  /// The parent signal fired, or the caller cancelled the request.
  Canceled,
  /// The request's own timeout elapsed first.
  TimedOut,
  /// The work panicked, or its worker was torn down without reporting.
  Failed(WorkError),
}

impl<R> Outcome<R> {
  pub fn is_completed(&self) -> bool {
    matches!(self, Outcome::Completed(_))
  }

  pub fn completed(self) -> Option<R> {
    match self {
      Outcome::Completed(value) => Some(value),
      _ => None,
    }
  }
}

impl<R> From<DoneReason> for Outcome<R> {
  fn from(reason: DoneReason) -> Self {
    match reason {
      DoneReason::Canceled => Outcome::Canceled,
      DoneReason::TimedOut => Outcome::TimedOut,
    }
  }
}

/// What the worker believes happened to its result.
///
/// `Delivered` is reported if and only if the caller's outcome is
/// `Completed` (or `Failed` carrying the work's own panic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  Delivered,
  Abandoned,
}

/// A single unit of work raced against a timeout and an optional parent signal.
///
/// The request is consumed by [`CancelableRequest::launch`], and the returned
/// [`InFlight`] is consumed by waiting for its outcome, so a request runs at
/// most once and never leaves a terminal state.
#[derive(Clone)]
pub struct CancelableRequest {
  name: Arc<String>,
  timeout: Duration,
  tokio_handle: TokioHandle,
  parent: Option<CancelSignal>,
  probe: Option<TaskProbe>,
}

impl fmt::Debug for CancelableRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelableRequest")
      .field("name", &self.name)
      .field("timeout", &self.timeout)
      .field("has_parent", &self.parent.is_some())
      .finish_non_exhaustive()
  }
}

impl CancelableRequest {
  pub fn new(timeout: Duration, tokio_handle: TokioHandle, name: &str) -> Self {
    Self {
      name: Arc::new(name.to_string()),
      timeout,
      tokio_handle,
      parent: None,
      probe: None,
    }
  }

  /// Cancels the request when `parent` fires.
  pub fn with_parent(mut self, parent: &CancelSignal) -> Self {
    self.parent = Some(parent.clone());
    self
  }

  pub fn with_probe(mut self, probe: TaskProbe) -> Self {
    self.probe = Some(probe);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Starts the deadline and spawns one worker running `work`.
  ///
  /// `work` receives the request's signal and may watch it to stop early.
  /// Work that ignores it runs to completion; only the wait for its result is
  /// cut short.
  pub fn launch<R, F, Fut>(self, work: F) -> InFlight<R>
  where
    R: Send + 'static,
    F: FnOnce(CancelSignal) -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    let deadline = self.start_deadline();
    let (result_tx, result_rx) = oneshot::channel();
    let signal = deadline.signal().clone();
    let probe_guard = probe::track(self.probe.as_ref(), || format!("{}/request", self.name));

    debug!(request = %self.name, timeout = ?self.timeout, "Launching request.");
    let worker = self.tokio_handle.spawn(
      async move {
        let _probe_guard = probe_guard;
        let work_signal = signal.clone();
        let produced = AssertUnwindSafe(async move { work(work_signal).await })
          .catch_unwind()
          .await
          .map_err(WorkError::from_panic);
        hand_off(result_tx, produced, &signal)
      }
      .instrument(info_span!("request_worker", request = %self.name)),
    );

    InFlight::new(self.name, deadline, result_rx, worker)
  }

  /// Like [`CancelableRequest::launch`] for synchronous work that cannot be
  /// interrupted. It runs on the blocking pool and always runs to completion.
  pub fn launch_blocking<R, F>(self, work: F) -> InFlight<R>
  where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
  {
    let deadline = self.start_deadline();
    let (result_tx, result_rx) = oneshot::channel();
    let signal = deadline.signal().clone();
    let probe_guard = probe::track(self.probe.as_ref(), || format!("{}/request", self.name));
    let span = info_span!("request_worker", request = %self.name, blocking = true);

    debug!(request = %self.name, timeout = ?self.timeout, "Launching blocking request.");
    let worker = self.tokio_handle.spawn_blocking(move || {
      let _entered = span.enter();
      let _probe_guard = probe_guard;
      let produced = std::panic::catch_unwind(AssertUnwindSafe(work)).map_err(WorkError::from_panic);
      hand_off(result_tx, produced, &signal)
    });

    InFlight::new(self.name, deadline, result_rx, worker)
  }

  /// Starts the request's deadline with its own timer, so the combined signal
  /// fires on time even while nobody is waiting for the outcome.
  fn start_deadline(&self) -> Deadline {
    let deadline = Deadline::after(self.timeout, self.parent.as_ref());
    let timer_guard = probe::track(self.probe.as_ref(), || format!("{}/deadline", self.name));
    // Detached: the timer ends once the signal fires, at the latest when the
    // `InFlight` releases it.
    deadline.arm(&self.tokio_handle, timer_guard);
    deadline
  }

  pub async fn run<R, F, Fut>(self, work: F) -> Outcome<R>
  where
    R: Send + 'static,
    F: FnOnce(CancelSignal) -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    self.launch(work).outcome().await
  }

  pub async fn run_blocking<R, F>(self, work: F) -> Outcome<R>
  where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
  {
    self.launch_blocking(work).outcome().await
  }
}

/// Publishes the worker's result unless the signal has already fired.
///
/// Never waits. The send succeeds only while the caller's receiver is open,
/// and the caller drains the receiver once after closing it, so a successful
/// send always reaches the caller.
fn hand_off<R>(
  result_tx: oneshot::Sender<Result<R, WorkError>>,
  produced: Result<R, WorkError>,
  signal: &CancelSignal,
) -> Delivery {
  if signal.is_cancelled() {
    debug!("Signal fired before the handoff; result discarded.");
    return Delivery::Abandoned;
  }
  match result_tx.send(produced) {
    Ok(()) => {
      trace!("Result handed off.");
      Delivery::Delivered
    }
    Err(_) => {
      debug!("Caller closed the handoff first; result discarded.");
      Delivery::Abandoned
    }
  }
}

/// A launched request.
///
/// Dropping it fires the request's signal, which tells the worker to discard
/// its result instead of waiting for a caller that is gone.
pub struct InFlight<R> {
  name: Arc<String>,
  deadline: Deadline,
  result_rx: oneshot::Receiver<Result<R, WorkError>>,
  worker: JoinHandle<Delivery>,
  _release: DropGuard,
}

impl<R> fmt::Debug for InFlight<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InFlight")
      .field("name", &self.name)
      .field("remaining", &self.deadline.remaining())
      .field("cancelled", &self.deadline.signal().is_cancelled())
      .field("worker_finished", &self.worker.is_finished())
      .finish()
  }
}

impl<R> InFlight<R> {
  fn new(
    name: Arc<String>,
    deadline: Deadline,
    result_rx: oneshot::Receiver<Result<R, WorkError>>,
    worker: JoinHandle<Delivery>,
  ) -> Self {
    let release = deadline.signal().release_on_drop();
    Self {
      name,
      deadline,
      result_rx,
      worker,
      _release: release,
    }
  }

  /// The request's combined signal: fires on parent cancellation, explicit
  /// cancellation or timeout.
  pub fn signal(&self) -> &CancelSignal {
    self.deadline.signal()
  }

  /// Cancels the request. The outcome becomes `Canceled` unless the result
  /// was already handed off. Calling it again, or after the outcome is known,
  /// does nothing.
  pub fn cancel(&self) {
    debug!(request = %self.name, "Request cancellation requested.");
    self.deadline.signal().cancel();
  }

  pub async fn outcome(self) -> Outcome<R> {
    self.outcome_tracked().await.0
  }

  /// Waits for the outcome and also returns the worker's handle, which
  /// resolves to what the worker believes happened to its result.
  ///
  /// If the result was handed off before the caller closed the handoff,
  /// delivery wins over a signal observed at the same time.
  pub async fn outcome_tracked(self) -> (Outcome<R>, JoinHandle<Delivery>) {
    let InFlight {
      name,
      deadline,
      mut result_rx,
      worker,
      _release,
    } = self;

    let outcome = tokio::select! {
      biased;
      received = &mut result_rx => match received {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(failure)) => Outcome::Failed(failure),
        // The worker only drops the handoff unsent after seeing the signal.
        Err(_) if deadline.signal().is_cancelled() => deadline.expired().await.into(),
        Err(_) => Outcome::Failed(WorkError::Lost),
      },
      reason = deadline.expired() => {
        result_rx.close();
        match result_rx.try_recv() {
          Ok(Ok(value)) => {
            debug!(request = %name, ?reason, "Result arrived with the signal; delivery wins.");
            Outcome::Completed(value)
          }
          Ok(Err(failure)) => Outcome::Failed(failure),
          Err(_) => reason.into(),
        }
      }
    };

    match &outcome {
      Outcome::Completed(_) => debug!(request = %name, "Request completed."),
      Outcome::Canceled => info!(request = %name, "Request canceled."),
      Outcome::TimedOut => info!(request = %name, "Request timed out."),
      Outcome::Failed(failure) => info!(request = %name, error = %failure, "Request failed."),
    }
    (outcome, worker)
  }
}
