// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pooled completion sources driven by the scheduler.
//!
//! Each promise kind acquires its state from the scheduler's pools, completes at most once and
//! goes back to its pool when its result is consumed. A cancellation signal that is already
//! requested when a promise would be created short-circuits to a pre-canceled
//! [`AutoResetSource`] instead.

mod auto_reset;
mod delay;
mod never;
mod next_frame;
mod yield_now;

pub use auto_reset::AutoResetSource;
pub use yield_now::YieldNow;
