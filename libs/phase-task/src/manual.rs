// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A completion source for many observers.

use crate::cancel::Cancellation;
use crate::error::{Fault, Misuse, TaskError, misuse};
use crate::report::FailureReporter;
use crate::scheduler::PhaseScheduler;
use crate::source::{Status, TaskSource, Token};
use crate::task::TaskHandle;
use core::fmt;
use core::panic::{AssertUnwindSafe, Location};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use core::task::Waker;
use std::panic;
use std::sync::Arc;

/// A completion source any number of handles can observe.
///
/// Unlike the pooled sources, a `ManualSource` is never recycled and does not check tokens.
/// Every handle created through [`handle`](Self::handle) registers its own continuation, and all
/// of them are woken in registration order when the source completes. Registrations after
/// completion are woken right away. The outcome is cloned for every consumer.
///
/// Completing a source a second time is ignored and reported as `false`.
pub struct ManualSource<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    status: AtomicU8,
    state: spin::Mutex<State<T>>,
    /// Set once any handle consumed the outcome.
    observed: AtomicBool,
    reporter: FailureReporter,
}

struct State<T> {
    outcome: Option<Result<T, TaskError>>,
    continuations: Vec<Waker>,
}

// === impl ManualSource ===

impl<T> ManualSource<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(reporter: FailureReporter) -> Self {
        Self {
            inner: Arc::new(Inner {
                status: AtomicU8::new(Status::Pending as u8),
                state: spin::Mutex::new(State {
                    outcome: None,
                    continuations: Vec::new(),
                }),
                observed: AtomicBool::new(false),
                reporter,
            }),
        }
    }

    /// A new handle observing this source.
    pub fn handle(&self) -> TaskHandle<T> {
        TaskHandle::from_source(self.inner.clone(), Token::new(0))
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    #[track_caller]
    pub fn try_set_result(&self, value: T) -> bool {
        self.inner.try_complete(Ok(value))
    }

    #[track_caller]
    pub fn try_set_fault(&self, fault: Fault) -> bool {
        self.inner.try_complete(Err(TaskError::Faulted(fault)))
    }

    #[track_caller]
    pub fn try_set_canceled(&self, cancellation: Cancellation) -> bool {
        self.inner
            .try_complete(Err(TaskError::canceled(cancellation)))
    }
}

impl<T> Clone for ManualSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ManualSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualSource")
            .field("status", &self.inner.status())
            .field("observed", &self.inner.observed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl Inner ===

impl<T> Inner<T> {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    #[track_caller]
    fn try_complete(&self, outcome: Result<T, TaskError>) -> bool {
        let status = Status::of(&outcome);

        let continuations = {
            let mut state = self.state.lock();
            if self.status() != Status::Pending {
                tracing::trace!(?status, "manual source already completed, ignoring");
                return false;
            }
            state.outcome = Some(outcome);
            self.status.store(status as u8, Ordering::Release);
            core::mem::take(&mut state.continuations)
        };

        tracing::trace!(?status, observers = continuations.len(), "manual source completed");
        for continuation in continuations {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| continuation.wake())) {
                let fault = Fault::from_panic(payload, Location::caller());
                self.reporter.report(TaskError::Faulted(fault));
            }
        }

        true
    }
}

impl<T> TaskSource<T> for Inner<T>
where
    T: Clone + Send,
{
    fn status(&self, _token: Token) -> Status {
        Inner::status(self)
    }

    fn on_completed(&self, continuation: Waker, _token: Token) {
        {
            let mut state = self.state.lock();
            if self.status() == Status::Pending {
                state.continuations.push(continuation);
                return;
            }
        }

        continuation.wake();
    }

    #[track_caller]
    fn take_result(self: Arc<Self>, _token: Token) -> Result<T, TaskError> {
        let state = self.state.lock();
        match &state.outcome {
            Some(outcome) => {
                self.observed.store(true, Ordering::Release);
                outcome.clone()
            }
            None => misuse(Misuse::NotCompleted),
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.observed.load(Ordering::Acquire) {
            return;
        }
        if let Some(Err(error)) = self.state.get_mut().outcome.take() {
            self.reporter.report(error);
        }
    }
}

// === impl PhaseScheduler ===

impl PhaseScheduler {
    /// A new multi-observer completion source reporting to this scheduler.
    pub fn manual_source<T: Clone + Send + 'static>(&self) -> ManualSource<T> {
        ManualSource::new(self.reporter())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::test_util::{CountingWaker, collecting_sink};
    use std::task::Wake;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[test]
    fn every_observer_is_notified_once() {
        let scheduler = PhaseScheduler::new();
        let source = scheduler.manual_source::<u32>();

        let mut first = task::spawn(source.handle());
        let mut second = task::spawn(source.handle());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        assert!(source.try_set_result(5));
        assert!(first.is_woken());
        assert!(second.is_woken());

        assert_eq!(assert_ready_ok!(first.poll()), 5);
        assert_eq!(assert_ready_ok!(second.poll()), 5);
    }

    #[test]
    fn continuations_run_in_registration_order() {
        let scheduler = PhaseScheduler::new();
        let source = scheduler.manual_source::<()>();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            let mut handle = source.handle();
            handle.on_completed(Waker::from(Arc::new(Record(move || {
                order.lock().unwrap().push(i);
            }))));
            handles.push(handle);
        }

        source.try_set_result(());
        assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
    }

    #[test]
    fn late_registration_runs_inline() {
        let scheduler = PhaseScheduler::new();
        let source = scheduler.manual_source::<&str>();
        source.try_set_result("early");

        let counter = CountingWaker::new();
        let mut handle = source.handle();
        handle.on_completed(counter.waker());
        assert_eq!(counter.count(), 1);
        assert_eq!(handle.take_result().unwrap(), "early");
    }

    #[test]
    #[should_panic(expected = "not yet completed")]
    fn take_result_while_pending() {
        let scheduler = PhaseScheduler::new();
        let source = scheduler.manual_source::<u32>();
        let _ = source.handle().take_result();
    }

    #[test]
    fn repeated_completion_is_ignored() {
        let scheduler = PhaseScheduler::new();
        let source = scheduler.manual_source::<u32>();

        assert!(source.try_set_result(1));
        assert!(!source.try_set_result(2));
        assert!(!source.try_set_fault(Fault::msg("late")));
        assert_eq!(source.status(), Status::Succeeded);
        assert_eq!(source.handle().take_result().unwrap(), 1);
    }

    #[test]
    fn panicking_continuation_is_reported_and_the_rest_still_run() {
        let (sink, failures) = collecting_sink();
        let scheduler = PhaseScheduler::builder().failure_sink(sink).build();
        let source = scheduler.manual_source::<()>();

        let mut exploding = source.handle();
        exploding.on_completed(Waker::from(Arc::new(Record(explode))));
        let counter = CountingWaker::new();
        let mut counted = source.handle();
        counted.on_completed(counter.waker());

        source.try_set_result(());
        assert_eq!(counter.count(), 1);

        scheduler.run_phase(Phase::Update);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].error().as_fault().unwrap().panic_message(),
            Some("observer exploded")
        );
    }

    #[test]
    fn unobserved_fault_is_reported_on_drop() {
        let (sink, failures) = collecting_sink();
        let scheduler = PhaseScheduler::builder().failure_sink(sink).build();

        let source = scheduler.manual_source::<()>();
        source.try_set_fault(Fault::msg("ignored"));
        drop(source);

        scheduler.run_phase(Phase::Render);
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[test]
    fn completion_from_another_thread() {
        let scheduler = PhaseScheduler::new();
        let source = scheduler.manual_source::<String>();
        let handle = source.handle();

        let completer = std::thread::spawn(move || {
            assert!(source.try_set_result(String::from("from afar")));
        });

        assert_eq!(futures::executor::block_on(handle).unwrap(), "from afar");
        completer.join().unwrap();
    }

    fn explode() {
        panic!("observer exploded");
    }

    struct Record<F>(F);

    impl<F: Fn() + Send + Sync + 'static> Wake for Record<F> {
        fn wake(self: Arc<Self>) {
            (self.0)();
        }
    }
}
