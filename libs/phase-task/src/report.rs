// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Forwarding of failures nobody consumed.

use crate::error::TaskError;
use crate::phase::PhaseMask;
use crate::scheduler::{Callback, PendingEntry, PendingQueue};
use core::fmt;
use std::sync::Weak;

/// A fault or cancellation that was recorded but never consumed.
///
/// Delivered to the scheduler's [failure sink](crate::scheduler::SchedulerBuilder::failure_sink)
/// during the next phase drain.
#[derive(Clone, Debug)]
pub struct Failure {
    error: TaskError,
}

/// Forwards unobserved failures to the scheduler that owns the reporting object.
///
/// Reporters only hold a weak reference to the scheduler's pending list, so pooled objects never
/// keep a scheduler alive. Failures reported after the scheduler is gone are logged instead.
#[derive(Clone)]
pub struct FailureReporter {
    queue: Weak<PendingQueue>,
}

// === impl Failure ===

impl Failure {
    pub(crate) fn new(error: TaskError) -> Self {
        Self { error }
    }

    pub fn error(&self) -> &TaskError {
        &self.error
    }

    pub fn into_error(self) -> TaskError {
        self.error
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unobserved task failure: {}", self.error)
    }
}

impl core::error::Error for Failure {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

// === impl FailureReporter ===

impl FailureReporter {
    pub(crate) fn new(queue: Weak<PendingQueue>) -> Self {
        Self { queue }
    }

    /// A reporter that is not attached to any scheduler.
    pub fn disconnected() -> Self {
        Self { queue: Weak::new() }
    }

    /// Schedules `error` to be handed to the failure sink on the next drain of any phase.
    pub fn report(&self, error: TaskError) {
        if let Some(queue) = self.queue.upgrade() {
            queue.push(PendingEntry::new(
                PhaseMask::ALL,
                Callback::Report(Failure::new(error)),
            ));
        } else {
            tracing::warn!(%error, "unobserved task failure with no scheduler to report to");
        }
    }
}

impl fmt::Debug for FailureReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureReporter")
            .field("connected", &(self.queue.strong_count() > 0))
            .finish_non_exhaustive()
    }
}
