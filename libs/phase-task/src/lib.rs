// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pooled, allocation-light tasks for hosts that drive their work from a phase-ordered frame
//! loop.
//!
//! A [`TaskHandle`] is a single-use view of an outcome that completes at most once. Handles are
//! backed by [completion sources](source::TaskSource) that are recycled through per-type
//! [pools](pool::RecyclePool) once their result has been consumed. The [`PhaseScheduler`] owns
//! the pools together with the queue of continuations that wait for a particular phase of the
//! host loop, and the host drives it one [`Phase`] at a time.
//!
//! ```
//! use core::time::Duration;
//! use phase_task::{Cancellation, PhaseScheduler, Status};
//!
//! let scheduler = PhaseScheduler::new();
//! let handle = scheduler.spawn({
//!     let scheduler = scheduler.clone();
//!     async move {
//!         scheduler.delay(Duration::from_millis(20), Cancellation::none()).await?;
//!         Ok(7)
//!     }
//! });
//!
//! scheduler.initialize();
//! scheduler.advance_update(Duration::from_millis(16));
//! assert_eq!(handle.status(), Status::Pending);
//! scheduler.advance_update(Duration::from_millis(16));
//! assert_eq!(handle.take_result().unwrap(), 7);
//! ```

pub mod cancel;
pub mod completion;
pub mod error;
mod loom;
pub mod manual;
pub mod phase;
pub mod pool;
pub mod promise;
pub mod report;
pub mod scheduler;
pub mod source;
pub mod switch;
pub mod task;
#[cfg(test)]
mod test_util;
#[cfg(all(test, not(loom)))]
mod tests;

pub use cancel::{CancelSignal, Cancellation};
pub use error::{Canceled, Fault, TaskError};
pub use manual::ManualSource;
pub use phase::{Phase, PhaseMask};
pub use promise::{AutoResetSource, YieldNow};
pub use report::{Failure, FailureReporter};
pub use scheduler::{PhaseScheduler, SchedulerBuilder, Tick};
pub use source::{Status, TaskSource, Token};
pub use switch::WorkerPool;
pub use task::TaskHandle;
