// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The boundary to an external cancellation primitive.
//!
//! Cancellation is cooperative: primitives that accept a [`Cancellation`] check it at each
//! suspension and resumption point and transition to [`Status::Canceled`](crate::source::Status)
//! when they find it requested.

use crate::error::TaskError;
use crate::phase::PhaseMask;
use crate::scheduler::{Callback, PendingEntry, PhaseScheduler};
use core::fmt;
use core::task::Waker;
use std::sync::Arc;
use std::task::Wake;

/// An externally owned cancellation signal.
pub trait CancelSignal: Send + Sync {
    /// Returns `true` once cancellation has been requested.
    fn is_requested(&self) -> bool;

    /// Registers `callback` to be woken when cancellation is requested.
    ///
    /// If cancellation has already been requested, implementations must wake `callback` right away.
    fn on_requested(&self, callback: Waker);
}

/// A cloneable handle to an optional [`CancelSignal`].
///
/// [`Cancellation::none`] can never be requested.
#[derive(Clone, Default)]
pub struct Cancellation(Option<Arc<dyn CancelSignal>>);

impl Cancellation {
    pub const fn none() -> Self {
        Self(None)
    }

    pub fn new(signal: Arc<dyn CancelSignal>) -> Self {
        Self(Some(signal))
    }

    /// Returns `true` if this handle refers to a signal at all.
    pub fn can_be_canceled(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_requested(&self) -> bool {
        self.0.as_ref().is_some_and(|signal| signal.is_requested())
    }

    /// Registers `callback` with the underlying signal. Does nothing for [`Cancellation::none`].
    pub fn on_requested(&self, callback: Waker) {
        if let Some(signal) = &self.0 {
            signal.on_requested(callback);
        }
    }

    /// Registers `f` to run through `scheduler` once cancellation is requested.
    ///
    /// Whichever thread requests cancellation, `f` runs on the main thread during the next drain
    /// of any phase. Does nothing for [`Cancellation::none`].
    pub fn on_requested_in_loop<F>(&self, scheduler: &PhaseScheduler, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.can_be_canceled() {
            return;
        }
        self.on_requested(Waker::from(Arc::new(PostOnRequest {
            scheduler: scheduler.clone(),
            f: spin::Mutex::new(Some(Box::new(f) as Box<dyn FnOnce() + Send>)),
        })));
    }

    /// Checks the signal.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Canceled`] carrying this handle if cancellation was requested.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_requested() {
            Err(TaskError::canceled(self.clone()))
        } else {
            Ok(())
        }
    }
}

struct PostOnRequest {
    scheduler: PhaseScheduler,
    f: spin::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Wake for PostOnRequest {
    fn wake(self: Arc<Self>) {
        if let Some(f) = self.f.lock().take() {
            self.scheduler
                .push(PendingEntry::new(PhaseMask::ALL, Callback::Call(f)));
        }
    }
}

impl<S: CancelSignal + 'static> From<Arc<S>> for Cancellation {
    fn from(signal: Arc<S>) -> Self {
        Self(Some(signal))
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("is_requested", &self.is_requested())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::test_util::{CountingWaker, TestSignal};

    #[test]
    fn none_is_never_requested() {
        let cancel = Cancellation::none();
        assert!(!cancel.can_be_canceled());
        assert!(!cancel.is_requested());
        assert!(cancel.check().is_ok());

        let counter = CountingWaker::new();
        cancel.on_requested(counter.waker());
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn request_wakes_registered_callbacks() {
        let signal = Arc::new(TestSignal::default());
        let cancel = Cancellation::from(signal.clone());

        let counter = CountingWaker::new();
        cancel.on_requested(counter.waker());
        assert_eq!(counter.count(), 0);
        assert!(cancel.check().is_ok());

        signal.request();
        assert_eq!(counter.count(), 1);
        assert!(cancel.check().unwrap_err().is_canceled());

        // late registrations run right away
        cancel.on_requested(counter.waker());
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn in_loop_callbacks_wait_for_a_drain() {
        let scheduler = PhaseScheduler::new();
        let signal = Arc::new(TestSignal::default());
        let cancel = Cancellation::from(signal.clone());
        let counter = CountingWaker::new();

        cancel.on_requested_in_loop(&scheduler, {
            let waker = counter.waker();
            move || waker.wake()
        });
        assert_eq!(scheduler.pending(), 0);

        std::thread::spawn(move || signal.request()).join().unwrap();
        assert_eq!(counter.count(), 0);
        assert_eq!(scheduler.pending(), 1);

        scheduler.run_phase(Phase::PostRender);
        assert_eq!(counter.count(), 1);

        Cancellation::none().on_requested_in_loop(&scheduler, never_called);
        assert_eq!(scheduler.pending(), 0);
    }

    fn never_called() {
        unreachable!("a handle without a signal is never canceled");
    }
}
