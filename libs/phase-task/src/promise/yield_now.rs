// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::Cancellation;
use crate::completion::CompletionCore;
use crate::phase::{Phase, PhaseMask};
use crate::pool::{Home, PooledSource, Recycle};
use crate::scheduler::{Callback, PendingEntry, PhaseScheduler, Step};
use crate::task::TaskHandle;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

/// Future returned from [`PhaseScheduler::yield_now`].
///
/// Suspends exactly once and resumes during the next drain of a phase in its mask.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    scheduler: PhaseScheduler,
    mask: PhaseMask,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        self.yielded = true;
        self.scheduler.schedule(self.mask, cx.waker().clone());
        Poll::Pending
    }
}

/// Completes on the next drain of a phase in its mask.
pub(crate) struct YieldPromise {
    core: CompletionCore<()>,
    cancel: spin::Mutex<Cancellation>,
    home: Home<Self>,
}

impl Step for YieldPromise {
    fn step(self: Arc<Self>, _scheduler: &PhaseScheduler) {
        let cancel = self.cancel.lock().clone();
        if cancel.is_requested() {
            self.core.try_set_canceled(cancel);
        } else {
            self.core.try_set_result(());
        }
    }
}

impl Recycle for YieldPromise {
    fn create(home: Home<Self>) -> Self {
        Self {
            core: CompletionCore::new(home.reporter()),
            cancel: spin::Mutex::new(Cancellation::none()),
            home,
        }
    }

    fn home(&self) -> &Home<Self> {
        &self.home
    }

    fn retire(&self) {
        self.core.retire();
        *self.cancel.lock() = Cancellation::none();
    }

    fn reset(&self) {
        self.core.reset();
    }
}

impl PooledSource for YieldPromise {
    type Output = ();

    fn core(&self) -> &CompletionCore<()> {
        &self.core
    }
}

impl PhaseScheduler {
    /// Suspends the calling computation until the next drain of `phase`.
    ///
    /// Unlike [`yield_with`](Self::yield_with) this allocates nothing and cannot be canceled.
    pub fn yield_now(&self, phase: impl Into<PhaseMask>) -> YieldNow {
        YieldNow {
            scheduler: self.clone(),
            mask: phase.into(),
            yielded: false,
        }
    }

    /// A pooled handle that completes during the next drain of `phase`, or as canceled if
    /// `cancel` was requested by then.
    pub fn yield_with(&self, phase: Phase, cancel: Cancellation) -> TaskHandle<()> {
        if cancel.is_requested() {
            return self.from_canceled(cancel);
        }

        let promise = self.pool::<YieldPromise>().acquire();
        *promise.cancel.lock() = cancel;

        let token = promise.core.version();
        self.push(PendingEntry::new(
            phase.mask(),
            Callback::Step(promise.clone()),
        ));
        TaskHandle::from_source(promise, token)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::source::Status;
    use crate::test_util::TestSignal;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn yield_now_suspends_once() {
        let scheduler = PhaseScheduler::new();
        let mut fut = task::spawn(scheduler.yield_now(Phase::PreRender));

        assert_pending!(fut.poll());
        assert!(!fut.is_woken());
        scheduler.run_phase(Phase::Update);
        assert!(!fut.is_woken());
        scheduler.run_phase(Phase::PreRender);
        assert!(fut.is_woken());
        assert_ready!(fut.poll());
    }

    #[test]
    fn yield_now_accepts_masks() {
        let scheduler = PhaseScheduler::new();
        let mut fut = task::spawn(scheduler.yield_now(PhaseMask::INIT | PhaseMask::POST_RENDER));

        assert_pending!(fut.poll());
        scheduler.run_phase(Phase::PostRender);
        assert!(fut.is_woken());
    }

    #[test]
    fn yield_with_resolves_on_next_drain() {
        let scheduler = PhaseScheduler::new();
        let handle = scheduler.yield_with(Phase::PostUpdate, Cancellation::none());

        scheduler.run_phase(Phase::Update);
        assert_eq!(handle.status(), Status::Pending);
        scheduler.run_phase(Phase::PostUpdate);
        assert_eq!(handle.status(), Status::Succeeded);
        handle.take_result().unwrap();
    }

    #[test]
    #[should_panic(expected = "not yet completed")]
    fn yield_with_take_result_before_drain() {
        let scheduler = PhaseScheduler::new();
        let handle = scheduler.yield_with(Phase::Update, Cancellation::none());
        scheduler.run_phase(Phase::Render);
        let _ = handle.take_result();
    }

    #[test]
    fn yield_with_observes_cancellation() {
        let scheduler = PhaseScheduler::new();
        let signal = Arc::new(TestSignal::default());
        let handle = scheduler.yield_with(Phase::Update, signal.clone().into());

        signal.request();
        scheduler.run_phase(Phase::Update);
        assert!(handle.take_result().unwrap_err().is_canceled());
    }
}
