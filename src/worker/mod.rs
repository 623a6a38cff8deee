//! Execution mechanisms for queued tasks.
//!
//! - [`WorkerPool`]: supervised in-process execution on the executor's
//!   Execution Slots
//! - [`QueueConsumer`]: pulls tasks from the external work queue into the
//!   pool, one slot at a time
//!
//! # Execution Flow
//!
//! 1. A task arrives through [`WorkerPool::spawn`] (in-process queue) or
//!    the consumer pops it after securing a slot
//! 2. The executor moves the job to `running` and runs its steps
//! 3. The job ends `done` or `error`; a panic inside the task is caught by
//!    the pool supervisor and recorded as `error`

pub mod consumer;
pub mod pool;

pub use consumer::QueueConsumer;
pub use pool::WorkerPool;
