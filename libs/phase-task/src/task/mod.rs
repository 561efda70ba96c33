// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Handles to pending outcomes and the computations that produce them.

mod builder;
mod cell;
mod combinator;
mod id;

use crate::cancel::Cancellation;
use crate::error::{Misuse, TaskError, misuse};
use crate::phase::PhaseMask;
use crate::report::FailureReporter;
use crate::scheduler::PhaseScheduler;
use crate::source::{Status, TaskSource, Token};
use core::fmt;
use core::mem;
use core::panic::Location;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::Arc;
use std::task::Wake;

pub use builder::TaskBuilder;
pub use combinator::{AndThen, Defer, Flatten, Map, defer};
pub use id::Id;

/// A single-use handle to an outcome that may not be available yet.
///
/// A handle either carries its value directly, or refers to a [`TaskSource`] together with the
/// [`Token`] it was issued for. Awaiting the handle, or calling [`take_result`](Self::take_result)
/// once it completed, consumes the outcome.
///
/// Awaiting a pending handle registers the waker of the first poll that finds it pending. Later
/// polls do not replace it, since a source accepts a single continuation per use. Polling with a
/// waker that would not wake the same task logs a warning.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct TaskHandle<T> {
    repr: Repr<T>,
}

enum Repr<T> {
    Ready(T),
    Source {
        source: Arc<dyn TaskSource<T>>,
        token: Token,
        /// The continuation handed to the source, if any.
        registered: Option<Waker>,
    },
    Consumed,
}

// === impl TaskHandle ===

impl<T> TaskHandle<T> {
    /// A handle that already succeeded with `value`.
    pub const fn ready(value: T) -> Self {
        Self {
            repr: Repr::Ready(value),
        }
    }

    pub fn from_source(source: Arc<dyn TaskSource<T>>, token: Token) -> Self {
        Self {
            repr: Repr::Source {
                source,
                token,
                registered: None,
            },
        }
    }

    /// # Panics
    ///
    /// Panics if the handle was already consumed, or if its source has moved on to another use.
    #[track_caller]
    pub fn status(&self) -> Status {
        match &self.repr {
            Repr::Ready(_) => Status::Succeeded,
            Repr::Source { source, token, .. } => source.status(*token),
            Repr::Consumed => misuse(Misuse::StaleHandle),
        }
    }

    /// Shorthand for `self.status().is_completed()`.
    ///
    /// # Panics
    ///
    /// See [`status`](Self::status).
    #[track_caller]
    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    /// The token this handle was issued with, `None` for immediate values.
    pub fn token(&self) -> Option<Token> {
        match &self.repr {
            Repr::Source { token, .. } => Some(*token),
            _ => None,
        }
    }

    /// Registers `continuation` to be woken once the outcome is available.
    ///
    /// If it already is, `continuation` is woken before this returns.
    ///
    /// # Panics
    ///
    /// Panics if a continuation was already registered on a single-consumer source, or if the
    /// handle is stale.
    #[track_caller]
    pub fn on_completed(&mut self, continuation: Waker) {
        match &mut self.repr {
            Repr::Ready(_) => continuation.wake(),
            Repr::Source {
                source,
                token,
                registered,
            } => {
                *registered = Some(continuation.clone());
                source.on_completed(continuation, *token);
            }
            Repr::Consumed => misuse(Misuse::StaleHandle),
        }
    }

    /// Consumes the outcome.
    ///
    /// # Errors
    ///
    /// Returns the fault or cancellation the source completed with.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is not available yet, or if the handle is stale.
    #[track_caller]
    pub fn take_result(mut self) -> Result<T, TaskError> {
        self.take()
    }

    #[track_caller]
    fn take(&mut self) -> Result<T, TaskError> {
        match mem::replace(&mut self.repr, Repr::Consumed) {
            Repr::Ready(value) => Ok(value),
            Repr::Source { source, token, .. } => source.take_result(token),
            Repr::Consumed => misuse(Misuse::StaleHandle),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match &mut this.repr {
            Repr::Ready(_) => {}
            Repr::Source {
                source,
                token,
                registered,
            } => {
                if source.status(*token) == Status::Pending {
                    match registered {
                        None => {
                            *registered = Some(cx.waker().clone());
                            source.on_completed(cx.waker().clone(), *token);
                        }
                        Some(waker) if !waker.will_wake(cx.waker()) => {
                            tracing::warn!(
                                %token,
                                "`TaskHandle` polled with a new waker, the first one stays registered"
                            );
                        }
                        Some(_) => {}
                    }
                    return Poll::Pending;
                }
            }
            Repr::Consumed => panic!("`TaskHandle` polled after completion"),
        }

        Poll::Ready(this.take())
    }
}

impl<T> Unpin for TaskHandle<T> {}

impl<T> From<T> for TaskHandle<T> {
    fn from(value: T) -> Self {
        Self::ready(value)
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TaskHandle");
        match &self.repr {
            Repr::Ready(_) => s.field("status", &Status::Succeeded),
            Repr::Source {
                token, registered, ..
            } => s
                .field("token", token)
                .field("registered", &registered.is_some()),
            Repr::Consumed => s.field("consumed", &true),
        };
        s.finish()
    }
}

// === impl PhaseScheduler ===

impl PhaseScheduler {
    /// Spawns `future` as a pooled computation.
    ///
    /// The computation starts running on the calling thread right away and resumes on whichever
    /// thread wakes it afterwards. A panic inside `future` completes the returned handle with a
    /// [`Fault`](crate::error::Fault).
    #[track_caller]
    pub fn spawn<F, T>(&self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Send + 'static,
    {
        self.task_builder().spawn(future)
    }

    pub fn task_builder(&self) -> TaskBuilder<'_> {
        TaskBuilder::new(self)
    }

    /// Lets `handle` complete in the background.
    ///
    /// If it completes with a fault or cancellation, the failure is delivered to the failure sink
    /// during a later phase drain.
    pub fn forget<T: Send + 'static>(&self, mut handle: TaskHandle<T>) {
        if handle.is_completed() {
            if let Err(error) = handle.take_result() {
                self.reporter().report(error);
            }
            return;
        }

        let forget = Arc::new(Forget {
            handle: spin::Mutex::new(None),
            reporter: self.reporter(),
        });
        let waker = Waker::from(forget.clone());
        handle.on_completed(waker);
        *forget.handle.lock() = Some(handle);

        // the source may have completed while we registered
        forget.consume();
    }
}

// === impl PhaseScheduler ===

impl PhaseScheduler {
    /// Lets `handle` complete in the background and passes a fault or cancellation to `handler`
    /// instead of the failure sink.
    ///
    /// With `on_main` set, `handler` runs on the main thread, during the next update drain if the
    /// failure arrived elsewhere. A panic raised by `handler` is delivered to the failure sink.
    #[track_caller]
    pub fn forget_with<T, H>(&self, handle: TaskHandle<T>, handler: H, on_main: bool)
    where
        T: Send + 'static,
        H: FnOnce(TaskError) + Send + 'static,
    {
        let scheduler = self.clone();
        let task = self
            .task_builder()
            .kind("forget")
            .location(Location::caller())
            .spawn(async move {
                let Err(error) = handle.await else {
                    return Ok(());
                };
                if on_main {
                    scheduler
                        .switch_to_main(PhaseMask::UPDATE, Cancellation::none())
                        .await?;
                }
                // a panic here faults the task, which `forget` reports
                handler(error);
                Ok(())
            });
        self.forget(task);
    }
}

struct Forget<T> {
    handle: spin::Mutex<Option<TaskHandle<T>>>,
    reporter: FailureReporter,
}

impl<T: Send + 'static> Forget<T> {
    fn consume(&self) {
        let mut slot = self.handle.lock();
        if !slot.as_ref().is_some_and(TaskHandle::is_completed) {
            return;
        }
        let handle = slot.take();
        drop(slot);

        if let Some(Err(error)) = handle.map(TaskHandle::take_result) {
            self.reporter.report(error);
        }
    }
}

impl<T: Send + 'static> Wake for Forget<T> {
    fn wake(self: Arc<Self>) {
        self.consume();
    }
}
