use crate::error::PoolError;

use async_channel::{Receiver, Sender, TrySendError};
use std::fmt;
use tracing::{debug, trace};

/// An input value together with the position it was pushed at.
///
/// `seq` is unique within a queue, so a collector can match every result back
/// to exactly one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
  pub seq: usize,
  pub value: T,
}

/// Constructors for a closable multi-consumer work queue.
///
/// The queue is split into a single [`QueueProducer`] and any number of
/// [`QueueConsumer`]s. The producer is the only sender: closing it (explicitly
/// or by dropping it) ends the queue once the remaining items are drained.
pub struct TaskQueue;

impl TaskQueue {
  /// Creates a queue that holds at most `capacity` pending items.
  ///
  /// # Panics
  /// Panics if `capacity` is zero.
  pub fn bounded<T>(capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    assert!(capacity > 0, "task queue capacity must be at least 1");
    let (tx, rx) = async_channel::bounded(capacity);
    (QueueProducer { tx, pushed: 0 }, QueueConsumer { rx })
  }

  pub fn unbounded<T>() -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = async_channel::unbounded();
    (QueueProducer { tx, pushed: 0 }, QueueConsumer { rx })
  }

  /// Loads every item into a queue sized to hold them all, then closes it.
  ///
  /// Loading never waits, and consumers stop on their own once the items are
  /// gone.
  pub fn from_items<T, I>(items: I) -> QueueConsumer<T>
  where
    I: IntoIterator<Item = T>,
  {
    let items: Vec<T> = items.into_iter().collect();
    let (mut producer, consumer) = Self::bounded(items.len().max(1));
    for item in items {
      // The consumer is alive and capacity covers every item.
      if let Err(e) = producer.try_push(item) {
        unreachable!("preloading a queue sized for its items failed: {e}");
      }
    }
    producer.close();
    consumer
  }
}

/// The sending half of a [`TaskQueue`].
///
/// Not `Clone`: there is exactly one producer, so the queue is closed exactly
/// once, by [`QueueProducer::close`] or by dropping the producer. Pushing after
/// close cannot be expressed.
pub struct QueueProducer<T> {
  tx: Sender<WorkItem<T>>,
  pushed: usize,
}

impl<T> fmt::Debug for QueueProducer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("pushed", &self.pushed)
      .field("len", &self.tx.len())
      .finish_non_exhaustive()
  }
}

impl<T> QueueProducer<T> {
  /// Pushes an item, waiting for room if the queue is full. Returns the
  /// sequence number assigned to it.
  ///
  /// # Errors
  /// Returns `PoolError::QueueDisconnected` if every consumer has been dropped.
  pub async fn push(&mut self, value: T) -> Result<usize, PoolError> {
    let seq = self.pushed;
    match self.tx.send(WorkItem { seq, value }).await {
      Ok(()) => {
        trace!(seq, "Queue: pushed item.");
        self.pushed += 1;
        Ok(seq)
      }
      Err(_) => {
        debug!(seq, "Queue: push failed, no consumers left.");
        Err(PoolError::QueueDisconnected)
      }
    }
  }

  /// Pushes an item without waiting.
  ///
  /// # Errors
  /// `PoolError::QueueFull` if the queue is at capacity,
  /// `PoolError::QueueDisconnected` if every consumer has been dropped.
  pub fn try_push(&mut self, value: T) -> Result<usize, PoolError> {
    let seq = self.pushed;
    match self.tx.try_send(WorkItem { seq, value }) {
      Ok(()) => {
        self.pushed += 1;
        Ok(seq)
      }
      Err(TrySendError::Full(_)) => Err(PoolError::QueueFull),
      Err(TrySendError::Closed(_)) => Err(PoolError::QueueDisconnected),
    }
  }

  /// Closes the queue. Items already pushed are still handed out; once they
  /// are gone every consumer sees the end of the queue.
  pub fn close(self) {
    debug!(pushed = self.pushed, pending = self.tx.len(), "Queue: closed by producer.");
    self.tx.close();
  }

  /// Number of items pushed so far.
  pub fn pushed(&self) -> usize {
    self.pushed
  }

  /// Number of items waiting to be taken.
  pub fn len(&self) -> usize {
    self.tx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tx.is_empty()
  }
}

/// The receiving half of a [`TaskQueue`]. Clones share the queue: every item
/// goes to exactly one of them.
pub struct QueueConsumer<T> {
  rx: Receiver<WorkItem<T>>,
}

impl<T> Clone for QueueConsumer<T> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}

impl<T> fmt::Debug for QueueConsumer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer")
      .field("len", &self.rx.len())
      .field("closed", &self.rx.is_closed())
      .finish()
  }
}

impl<T> QueueConsumer<T> {
  /// Takes the next item, waiting while the queue is open and empty.
  ///
  /// Returns `None` once the queue is closed and drained. That is the normal
  /// end of work, not an error.
  pub async fn next(&self) -> Option<WorkItem<T>> {
    self.rx.recv().await.ok()
  }

  pub fn len(&self) -> usize {
    self.rx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rx.is_empty()
  }

  /// `true` once the producer has closed the queue, even if items remain.
  pub fn is_closed(&self) -> bool {
    self.rx.is_closed()
  }
}
