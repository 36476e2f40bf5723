//! Worker threads and the queues that feed them.

mod pool;
mod queue;
mod worker;

pub use pool::{WorkerPool, WorkerPoolError};
pub use queue::{DequeueTimeout, Outcome, Queue, Task, TaskResult};
