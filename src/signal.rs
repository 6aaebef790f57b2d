use crate::probe::ProbeGuard;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use tracing::trace;

/// A one-shot, broadcast "done" signal.
///
/// Clones observe the same signal. Once cancelled it stays cancelled, and
/// cancelling again has no effect. Children fire when their parent fires,
/// never the other way round.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
  token: CancellationToken,
}

impl CancelSignal {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns a signal that fires when either `self` fires or the child itself
  /// is cancelled.
  pub fn child(&self) -> Self {
    Self {
      token: self.token.child_token(),
    }
  }

  pub fn cancel(&self) {
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Resolves once the signal has fired. Resolves immediately if it already has.
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }

  /// Fires the signal when the returned guard is dropped.
  pub(crate) fn release_on_drop(&self) -> DropGuard {
    self.token.clone().drop_guard()
  }
}

/// Why a [`Deadline`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
  /// The parent signal fired, or the signal was cancelled explicitly.
  Canceled,
  /// The timeout elapsed first.
  TimedOut,
}

/// A [`CancelSignal`] combined with a point in time.
///
/// The signal fires on whichever comes first: the parent (if any) firing,
/// an explicit `signal().cancel()`, or the timeout elapsing. The timeout fires
/// the signal while someone awaits [`Deadline::expired`], or at any time once
/// the deadline has been armed on a runtime.
#[derive(Debug)]
pub struct Deadline {
  signal: CancelSignal,
  at: Instant,
  reason: Arc<OnceLock<DoneReason>>,
}

impl Deadline {
  pub fn after(timeout: Duration, parent: Option<&CancelSignal>) -> Self {
    let signal = parent.map_or_else(CancelSignal::new, CancelSignal::child);
    Self {
      signal,
      at: Instant::now() + timeout,
      reason: Arc::new(OnceLock::new()),
    }
  }

  /// Spawns a timer that fires the signal when the deadline passes, whether or
  /// not anyone is waiting on it. The timer ends as soon as the signal fires
  /// for any other reason.
  pub(crate) fn arm(&self, tokio_handle: &TokioHandle, probe_guard: Option<ProbeGuard>) -> JoinHandle<()> {
    let signal = self.signal.clone();
    let reason = self.reason.clone();
    let at = self.at;
    tokio_handle.spawn(async move {
      let _probe_guard = probe_guard;
      tokio::select! {
        biased;
        _ = signal.cancelled() => {}
        _ = sleep_until(at) => {
          let _ = reason.set(DoneReason::TimedOut);
          trace!("Deadline passed; firing signal.");
          signal.cancel();
        }
      }
    })
  }

  pub fn signal(&self) -> &CancelSignal {
    &self.signal
  }

  /// Time left before the deadline, zero once it has passed.
  pub fn remaining(&self) -> Duration {
    self.at.saturating_duration_since(Instant::now())
  }

  /// Waits until the deadline fires and reports the first cause observed.
  ///
  /// On timeout the signal is cancelled, so every other observer of
  /// [`Deadline::signal`] wakes up too. If cancellation and timeout are both
  /// ready, cancellation wins.
  pub async fn expired(&self) -> DoneReason {
    tokio::select! {
      biased;
      _ = self.signal.cancelled() => *self.reason.get_or_init(|| DoneReason::Canceled),
      _ = sleep_until(self.at) => {
        let reason = *self.reason.get_or_init(|| DoneReason::TimedOut);
        self.signal.cancel();
        reason
      }
    }
  }
}
