//! A Tokio-based worker pool and cancelable request runner that never leave a
//! task blocked on a channel after the caller has lost interest in it.
//!
//! - [`WorkerPool`] drains a closable [`TaskQueue`] with a fixed number of
//!   workers and reports one [`WorkResult`] per item.
//! - [`CancelableRequest`] runs one unit of work against a timeout and an
//!   optional parent [`CancelSignal`], and reports exactly one [`Outcome`].
//! - [`TaskProbe`] counts live tasks so tests can check for leaks.

mod error;
mod pool;
mod probe;
mod request;
mod signal;
mod task_queue;

pub use error::{PoolError, WorkError};
pub use pool::{PoolRun, WorkResult, WorkerExit, WorkerPool};
pub use probe::TaskProbe;
pub use request::{CancelableRequest, Delivery, InFlight, Outcome};
pub use signal::{CancelSignal, Deadline, DoneReason};
pub use task_queue::{QueueConsumer, QueueProducer, TaskQueue, WorkItem};
