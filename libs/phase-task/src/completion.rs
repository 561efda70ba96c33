// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The exactly-once completion engine behind every pooled source.

use crate::cancel::Cancellation;
use crate::error::{Fault, Misuse, TaskError, misuse};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use crate::report::FailureReporter;
use crate::source::{Status, Token};
use bitflags::bitflags;
use core::fmt;
use core::task::Waker;
use static_assertions::const_assert_eq;

/// Stores the outcome of one operation and hands it to exactly one continuation.
///
/// A `CompletionCore` is completed at most once per use: of all concurrent calls to
/// [`try_complete`](Self::try_complete) and its shorthands, exactly one wins and every other call
/// returns `false` without touching the stored outcome.
///
/// Registration of the single continuation races against completion without a lock. The
/// continuation slot moves through the following states:
///
/// - `EMPTY`: nothing registered, not completed.
/// - `REGISTERING`: a registrant owns the slot and is storing its waker.
/// - `WAITING`: a waker is stored.
/// - `CLAIMED`: the completer has published the outcome. Whoever observes both a stored waker and
///   `CLAIMED` last is responsible for waking it.
///
/// Once the outcome has been consumed the core is [retired](Self::retire), which bumps its
/// version and invalidates every [`Token`] handed out for the previous use. It must then be
/// [`reset`](Self::reset) before reuse, once nothing else references it.
pub struct CompletionCore<T> {
    /// Number of completion attempts since the last reset. Only the attempt that moves this from
    /// zero to one may write the outcome.
    completions: AtomicU32,
    status: AtomicU8,
    slot: AtomicUsize,
    continuation: UnsafeCell<Option<Waker>>,
    outcome: UnsafeCell<Option<Result<T, TaskError>>>,
    consumed: AtomicBool,
    /// Set when a fault or cancellation is recorded, cleared when it is consumed.
    unobserved: AtomicBool,
    version: AtomicU32,
    reporter: FailureReporter,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Slot: usize {
        const EMPTY = 0b000;
        const REGISTERING = 0b001;
        const WAITING = 0b010;
        const CLAIMED = 0b100;
    }
}
// EMPTY MUST be zero
const_assert_eq!(Slot::EMPTY.bits(), 0);

// Safety: the outcome is written once by the winning completer before `status` is published with
// release ordering, and the continuation is only touched by whoever owns the slot state.
unsafe impl<T: Send> Send for CompletionCore<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for CompletionCore<T> {}

// === impl CompletionCore ===

impl<T> CompletionCore<T> {
    pub fn new(reporter: FailureReporter) -> Self {
        Self {
            completions: AtomicU32::new(0),
            status: AtomicU8::new(Status::Pending as u8),
            slot: AtomicUsize::new(Slot::EMPTY.bits()),
            continuation: UnsafeCell::new(None),
            outcome: UnsafeCell::new(None),
            consumed: AtomicBool::new(false),
            unobserved: AtomicBool::new(false),
            version: AtomicU32::new(0),
            reporter,
        }
    }

    /// The token handles for the current use must carry.
    pub fn version(&self) -> Token {
        Token::new(self.version.load(Ordering::Acquire))
    }

    pub fn try_set_result(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    pub fn try_set_fault(&self, fault: Fault) -> bool {
        self.try_complete(Err(TaskError::Faulted(fault)))
    }

    pub fn try_set_canceled(&self, cancellation: Cancellation) -> bool {
        self.try_complete(Err(TaskError::canceled(cancellation)))
    }

    /// Records `outcome` and wakes the registered continuation, if any.
    ///
    /// Returns `false` without changing anything if the core was already completed.
    pub fn try_complete(&self, outcome: Result<T, TaskError>) -> bool {
        if self.completions.fetch_add(1, Ordering::AcqRel) != 0 {
            tracing::trace!(version = self.version.load(Ordering::Relaxed), "already completed");
            return false;
        }

        let status = Status::of(&outcome);
        tracing::trace!(version = self.version.load(Ordering::Relaxed), ?status, "completing");

        if status != Status::Succeeded {
            self.unobserved.store(true, Ordering::Relaxed);
        }
        // Safety: only the winner of the completion counter writes the outcome, and readers wait
        // for `status` to be published below.
        self.outcome.with_mut(|ptr| unsafe { *ptr = Some(outcome) });
        self.status.store(status as u8, Ordering::Release);

        let prev = self.fetch_or(Slot::CLAIMED, Ordering::AcqRel);
        if prev == Slot::WAITING {
            // Safety: the registrant finished storing its waker (`WAITING`) and will never touch
            // the slot again after observing `CLAIMED`.
            let waker = self.continuation.with_mut(|ptr| unsafe { (*ptr).take() });
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        // `EMPTY`: a later registration observes `CLAIMED` and wakes itself inline.
        // `REGISTERING`: the registrant fails its final CAS and wakes itself.

        true
    }

    pub fn status(&self, token: Token) -> Status {
        self.validate(token);
        self.unchecked_status()
    }

    /// The current status, without validating a token.
    pub fn unchecked_status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Registers the single continuation for the current use.
    ///
    /// If the core already completed, `continuation` is woken before this returns.
    ///
    /// # Panics
    ///
    /// Panics if `token` is stale, or if a continuation was already registered.
    #[track_caller]
    pub fn on_completed(&self, continuation: Waker, token: Token) {
        self.validate(token);

        match self.compare_exchange(Slot::EMPTY, Slot::REGISTERING, Ordering::Acquire) {
            Ok(_) => {}
            Err(actual) if actual.intersects(Slot::WAITING | Slot::REGISTERING) => {
                misuse(Misuse::AlreadyAwaited)
            }
            Err(_) => {
                // Completion got here first. Leave a marker so a second registration is still
                // detected, then run the continuation inline.
                self.fetch_or(Slot::WAITING, Ordering::Release);
                tracing::trace!("already completed, waking inline");
                continuation.wake();
                return;
            }
        }

        // Safety: `REGISTERING` grants exclusive access to the continuation
        self.continuation
            .with_mut(|ptr| unsafe { *ptr = Some(continuation) });

        if let Err(actual) =
            self.compare_exchange(Slot::REGISTERING, Slot::WAITING, Ordering::AcqRel)
        {
            // Completion raced us while we were registering and left the wakeup to us.
            debug_assert!(actual.contains(Slot::CLAIMED));
            // Safety: the completer saw `REGISTERING` and did not touch the continuation
            let waker = self.continuation.with_mut(|ptr| unsafe { (*ptr).take() });
            self.slot
                .store((Slot::WAITING | Slot::CLAIMED).bits(), Ordering::Release);
            if let Some(waker) = waker {
                tracing::trace!("completed while registering, waking inline");
                waker.wake();
            }
        }
    }

    /// Consumes the outcome of the current use.
    ///
    /// # Errors
    ///
    /// Returns the fault or cancellation the core completed with.
    ///
    /// # Panics
    ///
    /// Panics if `token` is stale, if the core has not completed yet or if the outcome was already
    /// taken.
    #[track_caller]
    pub fn take_result(&self, token: Token) -> Result<T, TaskError> {
        self.validate(token);

        if self.unchecked_status() == Status::Pending {
            misuse(Misuse::NotCompleted);
        }
        if self.consumed.swap(true, Ordering::AcqRel) {
            misuse(Misuse::StaleHandle);
        }

        self.unobserved.store(false, Ordering::Release);
        // Safety: `status` was published after the outcome was written and `consumed` grants
        // exclusive access to take it.
        let outcome = self.outcome.with_mut(|ptr| unsafe { (*ptr).take() });
        match outcome {
            Some(outcome) => outcome,
            None => misuse(Misuse::StaleHandle),
        }
    }

    /// Ends the current use.
    ///
    /// A fault or cancellation that was never consumed is forwarded to the [`FailureReporter`],
    /// and the version is bumped so that every [`Token`] of the finished use becomes stale. The
    /// completer of the finished use may still be returning from
    /// [`try_complete`](Self::try_complete) while this runs.
    pub fn retire(&self) {
        self.report_unobserved();

        let prev = self.version.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(version = prev, "retired");
    }

    /// Clears the core for its next use.
    ///
    /// The caller must guarantee that nothing else references the core anymore, including a
    /// completer of the previous use that has not returned yet. Call [`retire`](Self::retire)
    /// first to invalidate the previous use's tokens.
    pub fn reset(&self) {
        self.report_unobserved();

        // Safety: the caller guarantees exclusive access to the core
        self.outcome.with_mut(|ptr| unsafe { *ptr = None });
        // Safety: see above
        self.continuation.with_mut(|ptr| unsafe { *ptr = None });
        self.consumed.store(false, Ordering::Relaxed);
        self.unobserved.store(false, Ordering::Relaxed);
        self.status
            .store(Status::Pending as u8, Ordering::Relaxed);
        self.slot.store(Slot::EMPTY.bits(), Ordering::Relaxed);
        self.completions.store(0, Ordering::Release);
    }

    #[track_caller]
    fn validate(&self, token: Token) {
        if token != self.version() {
            misuse(Misuse::StaleHandle);
        }
    }

    fn report_unobserved(&self) {
        if !self.unobserved.swap(false, Ordering::AcqRel) {
            return;
        }

        // Safety: the flag is set before the outcome is published and cleared before it is taken
        let error = self.outcome.with(|ptr| unsafe {
            (*ptr)
                .as_ref()
                .and_then(|outcome| outcome.as_ref().err().cloned())
        });

        if let Some(error) = error {
            tracing::trace!(%error, "reporting unobserved failure");
            self.reporter.report(error);
        }
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: Slot, new: Slot, success: Ordering) -> Result<Slot, Slot> {
        self.slot
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(Slot::from_bits_retain)
            .map_err(Slot::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_or(&self, slot: Slot, order: Ordering) -> Slot {
        Slot::from_bits_retain(self.slot.fetch_or(slot.bits(), order))
    }
}

impl<T> Drop for CompletionCore<T> {
    fn drop(&mut self) {
        self.report_unobserved();
    }
}

impl<T> fmt::Debug for CompletionCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCore")
            .field("status", &self.unchecked_status())
            .field("version", &self.version())
            .field(
                "slot",
                &Slot::from_bits_retain(self.slot.load(Ordering::Relaxed)),
            )
            .field("unobserved", &self.unobserved.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use crate::test_util::CountingWaker;
    use std::sync::Arc;
    use std::thread;

    fn core<T>() -> CompletionCore<T> {
        CompletionCore::new(FailureReporter::disconnected())
    }

    #[test]
    fn register_then_complete() {
        let core = core::<u32>();
        let token = core.version();
        let counter = CountingWaker::new();

        core.on_completed(counter.waker(), token);
        assert_eq!(counter.count(), 0);
        assert_eq!(core.status(token), Status::Pending);

        assert!(core.try_set_result(3));
        assert_eq!(counter.count(), 1);
        assert_eq!(core.status(token), Status::Succeeded);
        assert_eq!(core.take_result(token).unwrap(), 3);
    }

    #[test]
    fn complete_then_register_runs_inline() {
        let core = core::<u32>();
        let token = core.version();
        let counter = CountingWaker::new();

        assert!(core.try_set_result(5));
        core.on_completed(counter.waker(), token);
        assert_eq!(counter.count(), 1);
        assert_eq!(core.take_result(token).unwrap(), 5);
    }

    #[test]
    fn completes_exactly_once() {
        let core = core::<u32>();
        let token = core.version();

        assert!(core.try_set_result(1));
        assert!(!core.try_set_result(2));
        assert!(!core.try_set_fault(Fault::msg("late")));
        assert!(!core.try_set_canceled(Cancellation::none()));

        assert_eq!(core.status(token), Status::Succeeded);
        assert_eq!(core.take_result(token).unwrap(), 1);
    }

    #[test]
    fn fault_and_cancellation_are_distinct() {
        let faulted = core::<()>();
        assert!(faulted.try_set_fault(Fault::msg("boom")));
        assert_eq!(faulted.unchecked_status(), Status::Faulted);
        assert!(faulted.take_result(faulted.version()).unwrap_err().is_faulted());

        let canceled = core::<()>();
        assert!(canceled.try_set_canceled(Cancellation::none()));
        assert_eq!(canceled.unchecked_status(), Status::Canceled);
        assert!(canceled.take_result(canceled.version()).unwrap_err().is_canceled());
    }

    #[test]
    #[should_panic(expected = "not yet completed")]
    fn take_while_pending() {
        let core = core::<u32>();
        let _ = core.take_result(core.version());
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn take_twice() {
        let core = core::<u32>();
        let token = core.version();
        core.try_set_result(1);
        let _ = core.take_result(token);
        let _ = core.take_result(token);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn stale_token_after_retire() {
        let core = core::<u32>();
        let token = core.version();
        core.try_set_result(1);
        let _ = core.take_result(token);
        core.retire();

        let _ = core.status(token);
    }

    #[test]
    #[should_panic(expected = "already awaited")]
    fn second_registration_while_pending() {
        let core = core::<u32>();
        let token = core.version();
        core.on_completed(CountingWaker::new().waker(), token);
        core.on_completed(CountingWaker::new().waker(), token);
    }

    #[test]
    #[should_panic(expected = "already awaited")]
    fn second_registration_after_completion() {
        let core = core::<u32>();
        let token = core.version();
        core.on_completed(CountingWaker::new().waker(), token);
        core.try_set_result(1);
        core.on_completed(CountingWaker::new().waker(), token);
    }

    #[test]
    fn reset_clears_everything() {
        let core = core::<u32>();
        let first = core.version();
        core.on_completed(CountingWaker::new().waker(), first);
        core.try_set_result(1);
        core.take_result(first).unwrap();
        core.retire();
        core.reset();

        let second = core.version();
        assert_ne!(first, second);
        assert_eq!(core.status(second), Status::Pending);

        let counter = CountingWaker::new();
        core.on_completed(counter.waker(), second);
        assert!(core.try_set_result(2));
        assert_eq!(counter.count(), 1);
        assert_eq!(core.take_result(second).unwrap(), 2);
    }

    #[test]
    fn retire_reports_unconsumed_failures() {
        use crate::phase::Phase;
        use crate::scheduler::PhaseScheduler;
        use crate::test_util::collecting_sink;

        let (sink, failures) = collecting_sink();
        let scheduler = PhaseScheduler::builder().failure_sink(sink).build();
        let core = CompletionCore::<()>::new(scheduler.reporter());
        core.try_set_fault(Fault::msg("dropped on the floor"));
        core.retire();
        core.reset();

        assert_eq!(scheduler.run_phase(Phase::Update).reported, 1);
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[test]
    fn complete_and_register_stress() {
        for _ in 0..1000 {
            let core = Arc::new(core::<u32>());
            let token = core.version();
            let counter = CountingWaker::new();

            let completer = thread::spawn({
                let core = core.clone();
                move || assert!(core.try_set_result(42))
            });

            core.on_completed(counter.waker(), token);
            completer.join().unwrap();

            assert_eq!(counter.count(), 1);
            assert_eq!(core.take_result(token).unwrap(), 42);
        }
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{model, thread};
    use crate::test_util::CountingWaker;
    use std::sync::Arc;

    fn core<T>() -> CompletionCore<T> {
        CompletionCore::new(FailureReporter::disconnected())
    }

    #[test]
    fn complete_and_register_race() {
        model(|| {
            let core = Arc::new(core::<u32>());
            let token = core.version();
            let counter = CountingWaker::new();

            let completer = thread::spawn({
                let core = core.clone();
                move || assert!(core.try_set_result(42))
            });

            core.on_completed(counter.waker(), token);
            completer.join().unwrap();

            assert_eq!(counter.count(), 1);
            assert_eq!(core.take_result(token).unwrap(), 42);
        });
    }

    #[test]
    fn consume_while_completer_returns_then_reuse() {
        model(|| {
            let core = Arc::new(core::<u32>());
            let token = core.version();

            let completer = thread::spawn({
                let core = core.clone();
                move || assert!(core.try_set_result(1))
            });

            // the outcome may be visible before the completer is done with the core
            let consumed_early = core.status(token) != Status::Pending;
            if consumed_early {
                assert_eq!(core.take_result(token).unwrap(), 1);
                core.retire();
            }
            completer.join().unwrap();
            if !consumed_early {
                assert_eq!(core.take_result(token).unwrap(), 1);
                core.retire();
            }

            // a pool only resets once it holds the last reference
            core.reset();
            let next = core.version();
            assert_ne!(next, token);

            let counter = CountingWaker::new();
            core.on_completed(counter.waker(), next);
            assert_eq!(counter.count(), 0, "next use woken before it completed");

            assert!(core.try_set_result(2));
            assert_eq!(counter.count(), 1);
            assert_eq!(core.take_result(next).unwrap(), 2);
        });
    }
}
