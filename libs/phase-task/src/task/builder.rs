// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::TaskError;
use crate::scheduler::PhaseScheduler;
use crate::task::TaskHandle;
use crate::task::cell::TaskCell;
use crate::task::id::Id;
use core::any::type_name;
use core::panic::Location;
use tracing::Instrument;
use tracing::instrument::Instrumented;

/// Configures how a computation is spawned.
///
/// Returned by [`PhaseScheduler::task_builder`].
#[derive(Debug)]
#[must_use]
pub struct TaskBuilder<'a> {
    scheduler: &'a PhaseScheduler,
    location: Option<&'static Location<'static>>,
    name: Option<&'a str>,
    kind: &'a str,
}

impl<'a> TaskBuilder<'a> {
    pub(crate) fn new(scheduler: &'a PhaseScheduler) -> Self {
        Self {
            scheduler,
            location: None,
            name: None,
            kind: "task",
        }
    }

    /// Names the computation in its tracing span. Unnamed by default.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Sets the `task.kind` recorded in the span, `"task"` by default.
    pub fn kind(mut self, kind: &'a str) -> Self {
        self.kind = kind;
        self
    }

    /// Attributes the computation to `location` instead of the caller of
    /// [`spawn`](Self::spawn).
    ///
    /// A panic inside the computation becomes a [`Fault`](crate::error::Fault) at this location.
    pub fn location(mut self, location: &'static Location<'static>) -> Self {
        self.location = Some(location);
        self
    }

    /// Spawns `future` into a pooled cell and starts polling it on the calling thread.
    ///
    /// See [`PhaseScheduler::spawn`].
    #[track_caller]
    pub fn spawn<F, T>(self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Send + 'static,
    {
        let id = Id::next();

        let loc = match self.location {
            Some(location) => location,
            None => Location::caller(),
        };
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?self.name,
            task.kind = self.kind,
            task.output = %type_name::<T>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        let pool = self.scheduler.pool::<TaskCell<Instrumented<F>, T>>();
        TaskCell::spawn(&pool, future.instrument(span), id, loc)
    }
}
