// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::Cancellation;
use crate::completion::CompletionCore;
use crate::error::TaskError;
use crate::report::FailureReporter;
use crate::scheduler::PhaseScheduler;
use crate::source::{Status, TaskSource, Token};
use crate::task::TaskHandle;
use core::task::Waker;
use std::sync::{Arc, Weak};
use std::task::Wake;

/// A source that only ever completes as canceled.
struct NeverSource<T> {
    core: CompletionCore<T>,
    cancel: Cancellation,
}

/// The callback registered with the cancellation signal.
///
/// Only holds the source weakly, so a signal that is never requested does not keep dropped
/// sources alive.
struct CancelNever<T>(Weak<NeverSource<T>>);

impl<T: Send + 'static> NeverSource<T> {
    fn register(cancel: Cancellation, reporter: FailureReporter) -> Arc<Self> {
        let source = Arc::new(Self {
            core: CompletionCore::new(reporter),
            cancel: cancel.clone(),
        });
        cancel.on_requested(Waker::from(Arc::new(CancelNever(Arc::downgrade(&source)))));
        source
    }
}

impl<T: Send> Wake for CancelNever<T> {
    fn wake(self: Arc<Self>) {
        if let Some(source) = self.0.upgrade() {
            source.core.try_set_canceled(source.cancel.clone());
        }
    }
}

impl<T: Send> TaskSource<T> for NeverSource<T> {
    fn status(&self, token: Token) -> Status {
        self.core.status(token)
    }

    fn on_completed(&self, continuation: Waker, token: Token) {
        self.core.on_completed(continuation, token);
    }

    fn take_result(self: Arc<Self>, token: Token) -> Result<T, TaskError> {
        self.core.take_result(token)
    }
}

impl PhaseScheduler {
    /// A handle that never succeeds.
    ///
    /// It completes as canceled once `cancel` is requested, and stays pending forever for
    /// [`Cancellation::none`].
    pub fn never<T: Send + 'static>(&self, cancel: Cancellation) -> TaskHandle<T> {
        let source = NeverSource::register(cancel, self.reporter());
        let token = source.core.version();
        TaskHandle::from_source(source, token)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::test_util::TestSignal;

    #[test]
    fn completes_only_when_canceled() {
        let scheduler = PhaseScheduler::new();
        let signal = Arc::new(TestSignal::default());
        let handle = scheduler.never::<u32>(signal.clone().into());

        for phase in Phase::ORDERED {
            scheduler.run_phase(phase);
        }
        assert_eq!(handle.status(), Status::Pending);

        signal.request();
        assert_eq!(handle.status(), Status::Canceled);
        assert!(handle.take_result().unwrap_err().is_canceled());
    }

    #[test]
    fn already_requested() {
        let scheduler = PhaseScheduler::new();
        let signal = Arc::new(TestSignal::default());
        signal.request();

        let handle = scheduler.never::<()>(signal.into());
        assert_eq!(handle.status(), Status::Canceled);
    }

    #[test]
    fn dropped_source_is_freed_before_the_signal_fires() {
        let signal = Arc::new(TestSignal::default());
        let source =
            NeverSource::<u32>::register(signal.clone().into(), FailureReporter::disconnected());
        let weak = Arc::downgrade(&source);

        drop(source);
        assert!(weak.upgrade().is_none());

        // the stale callback finds nothing to complete
        signal.request();
    }
}
