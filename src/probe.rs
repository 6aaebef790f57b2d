use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{sleep, Instant};
use tracing::trace;

lazy_static::lazy_static! {
  static ref NEXT_PROBE_TASK_ID: AtomicU64 = AtomicU64::new(0);
}

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Counts the tasks a pool or request has spawned and not yet finished.
///
/// Meant for leak checks in tests and demos. Nothing in the crate reads it;
/// attach one with `with_probe` and compare [`TaskProbe::live_count`] before and
/// after a call.
#[derive(Debug, Clone, Default)]
pub struct TaskProbe {
  live: Arc<DashMap<u64, String>>,
}

impl TaskProbe {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn live_count(&self) -> usize {
    self.live.len()
  }

  /// Labels of the tasks that are still alive, sorted.
  pub fn live_labels(&self) -> Vec<String> {
    let mut labels: Vec<String> = self.live.iter().map(|entry| entry.value().clone()).collect();
    labels.sort();
    labels
  }

  /// Waits up to `grace` for every tracked task to finish and returns how many
  /// are still alive at the end.
  pub async fn settle(&self, grace: Duration) -> usize {
    let give_up_at = Instant::now() + grace;
    loop {
      let live = self.live_count();
      if live == 0 || Instant::now() >= give_up_at {
        return live;
      }
      sleep(SETTLE_POLL_INTERVAL).await;
    }
  }

  pub(crate) fn track(&self, label: String) -> ProbeGuard {
    let id = NEXT_PROBE_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed);
    trace!(task = %label, probe_id = id, "Probe: task started.");
    self.live.insert(id, label);
    ProbeGuard {
      id,
      live: self.live.clone(),
    }
  }
}

/// Removes its task from the probe when dropped, whether the task returned,
/// panicked or was aborted.
#[derive(Debug)]
pub(crate) struct ProbeGuard {
  id: u64,
  live: Arc<DashMap<u64, String>>,
}

impl Drop for ProbeGuard {
  fn drop(&mut self) {
    if let Some((_, label)) = self.live.remove(&self.id) {
      trace!(task = %label, probe_id = self.id, "Probe: task finished.");
    }
  }
}

/// Tracks a task on an optional probe.
pub(crate) fn track(probe: Option<&TaskProbe>, label: impl FnOnce() -> String) -> Option<ProbeGuard> {
  probe.map(|probe| probe.track(label()))
}
