//! # opqueue
//!
//! A sequential async operation queue with nested-first insertion.
//!
//! Steps are applied one at a time, each receiving the previous step's
//! output. A step may discover more work while it runs; anything it appends
//! runs right after it, before the step that was queued next. Nested work is
//! data in a buffer, not recursion, so deep cascades do not grow the stack.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use opqueue::{OperationQueue, Step};
//!
//! let queue = OperationQueue::<Vec<&'static str>>::new("save_order");
//! queue
//!     .then(|mut log| { log.push("insert order"); Ok(log) })
//!     .then_nested(|q, mut log| {
//!         // discovered while saving: the order has lines
//!         q.then(|mut log| { log.push("insert line 1"); Ok(log) });
//!         q.then(|mut log| { log.push("insert line 2"); Ok(log) });
//!         log.push("inspect cascade");
//!         Ok(log)
//!     })
//!     .push(Step::value(|mut log: Vec<_>| { log.push("commit"); Ok(log) }).describe("commit"));
//!
//! let log = queue.run().await?;
//! ```
//!
//! ## Step kinds
//!
//! - **Value** steps map the value synchronously (`then`, `then_nested`,
//!   `then_do`, `then_value`).
//! - **Async** steps return a future (`then_async`, `then_async_nested`).
//! - **Observer** steps see the value or the failure without changing it
//!   (`observe`).
//!
//! Errors and panics from any step surface as one [`QueueError`]. The first
//! failure stops the run; queued observers are still told about it.

pub mod queue;
pub mod recorder;
pub mod step;

mod state;

pub use queue::{JsonQueue, OperationQueue, PendingStep, QueueError, QueueHandle, QueueSnapshot};
pub use recorder::{NoopRecorder, Recorder, RunId, RunStatus, StepId, StepInfo, StepStatus};
pub use step::{FailureHook, Step};
