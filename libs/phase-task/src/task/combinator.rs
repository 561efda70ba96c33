// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::TaskError;
use crate::task::TaskHandle;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, ready};
use pin_project::pin_project;

/// Future returned from [`TaskHandle::map`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Map<T, F> {
    handle: TaskHandle<T>,
    f: Option<F>,
}

/// Future returned from [`TaskHandle::and_then`].
#[pin_project(project = AndThenProj)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub enum AndThen<T, U, F> {
    First { handle: TaskHandle<T>, f: Option<F> },
    Second { handle: TaskHandle<U> },
}

/// Future returned from [`TaskHandle::flatten`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Flatten<T> {
    state: FlattenState<T>,
}

enum FlattenState<T> {
    Outer(TaskHandle<TaskHandle<T>>),
    Inner(TaskHandle<T>),
}

/// Future returned from [`defer`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Defer<T, F> {
    factory: Option<F>,
    handle: Option<TaskHandle<T>>,
}

/// Postpones creating a handle until the returned future is first polled.
///
/// `factory` runs at most once, on the thread that first polls the future.
pub fn defer<T, F>(factory: F) -> Defer<T, F>
where
    F: FnOnce() -> TaskHandle<T>,
{
    Defer {
        factory: Some(factory),
        handle: None,
    }
}

impl<T> TaskHandle<T> {
    /// Transforms the value once it is available. Failures pass through untouched.
    pub fn map<U, F>(self, f: F) -> Map<T, F>
    where
        F: FnOnce(T) -> U,
    {
        Map {
            handle: self,
            f: Some(f),
        }
    }

    /// Continues with the handle `f` returns once the value is available. Failures pass through
    /// untouched and `f` is never called.
    pub fn and_then<U, F>(self, f: F) -> AndThen<T, U, F>
    where
        F: FnOnce(T) -> TaskHandle<U>,
    {
        AndThen::First {
            handle: self,
            f: Some(f),
        }
    }
}

impl<T> TaskHandle<TaskHandle<T>> {
    /// Awaits the outer handle and then the handle it produced.
    pub fn flatten(self) -> Flatten<T> {
        Flatten {
            state: FlattenState::Outer(self),
        }
    }
}

// === impl Defer ===

impl<T, F> Future for Defer<T, F>
where
    F: FnOnce() -> TaskHandle<T>,
{
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(factory) = this.factory.take() {
            this.handle = Some(factory());
        }
        match &mut this.handle {
            Some(handle) => Pin::new(handle).poll(cx),
            None => panic!("`Defer` polled after its factory panicked"),
        }
    }
}

// the factory is never pinned
impl<T, F> Unpin for Defer<T, F> {}

impl<T, F> fmt::Debug for Defer<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defer")
            .field("created", &self.factory.is_none())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

// === impl Map ===

impl<T, U, F> Future for Map<T, F>
where
    F: FnOnce(T) -> U,
{
    type Output = Result<U, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let outcome = ready!(Pin::new(this.handle).poll(cx));
        let Some(f) = this.f.take() else {
            panic!("`Map` polled after completion");
        };
        Poll::Ready(outcome.map(f))
    }
}

impl<T, F> fmt::Debug for Map<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

// === impl AndThen ===

impl<T, U, F> Future for AndThen<T, U, F>
where
    F: FnOnce(T) -> TaskHandle<U>,
{
    type Output = Result<U, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                AndThenProj::First { handle, f } => {
                    let value = match ready!(Pin::new(handle).poll(cx)) {
                        Ok(value) => value,
                        Err(error) => return Poll::Ready(Err(error)),
                    };
                    let Some(f) = f.take() else {
                        panic!("`AndThen` polled after completion");
                    };
                    self.set(AndThen::Second { handle: f(value) });
                }
                AndThenProj::Second { handle } => return Pin::new(handle).poll(cx),
            }
        }
    }
}

impl<T, U, F> fmt::Debug for AndThen<T, U, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AndThen::First { handle, .. } => f.debug_tuple("First").field(handle).finish(),
            AndThen::Second { handle } => f.debug_tuple("Second").field(handle).finish(),
        }
    }
}

// === impl Flatten ===

impl<T> Future for Flatten<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match &mut self.state {
                FlattenState::Outer(outer) => match ready!(Pin::new(outer).poll(cx)) {
                    Ok(inner) => self.state = FlattenState::Inner(inner),
                    Err(error) => return Poll::Ready(Err(error)),
                },
                FlattenState::Inner(inner) => return Pin::new(inner).poll(cx),
            }
        }
    }
}

impl<T> fmt::Debug for Flatten<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            FlattenState::Outer(outer) => f.debug_tuple("Flatten").field(outer).finish(),
            FlattenState::Inner(inner) => f.debug_tuple("Flatten").field(inner).finish(),
        }
    }
}
