use std::any::Any;

use thiserror::Error;

/// Failure of a single unit of work.
///
/// Carried inside the result of the item (or request) that failed; it never
/// reaches sibling workers or the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
  #[error("Work panicked: {0}")]
  Panicked(String),

  #[error("Work failed: {0}")]
  Failed(String),

  #[error("Worker went away without reporting a result")]
  Lost,
}

impl WorkError {
  pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    WorkError::Panicked(message)
  }
}

/// Errors returned by pool and queue calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Pool run was cancelled after {received} of {expected} results")]
  Canceled { received: usize, expected: usize },

  #[error("Pool workers stopped after {received} of {expected} results without being cancelled")]
  WorkersLost { received: usize, expected: usize },

  #[error("Task queue has no remaining consumers")]
  QueueDisconnected,

  #[error("Task queue is at capacity")]
  QueueFull,
}
