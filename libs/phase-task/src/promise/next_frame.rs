// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::Cancellation;
use crate::completion::CompletionCore;
use crate::phase::Phase;
use crate::pool::{Home, PooledSource, Recycle};
use crate::scheduler::{Callback, PendingEntry, PhaseScheduler, Step};
use crate::task::TaskHandle;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

/// Completes on the first drain of `phase` after the frame counter moved past `frame`.
pub(crate) struct NextFramePromise {
    core: CompletionCore<()>,
    frame: AtomicU64,
    phase: AtomicU8,
    cancel: spin::Mutex<Cancellation>,
    home: Home<Self>,
}

impl NextFramePromise {
    fn phase(&self) -> Phase {
        let index = usize::from(self.phase.load(Ordering::Acquire));
        Phase::from_index(index).unwrap_or(Phase::Update)
    }
}

impl Step for NextFramePromise {
    fn step(self: Arc<Self>, scheduler: &PhaseScheduler) {
        let cancel = self.cancel.lock().clone();
        if cancel.is_requested() {
            self.core.try_set_canceled(cancel);
            return;
        }

        if scheduler.frame() == self.frame.load(Ordering::Acquire) {
            let mask = self.phase().mask();
            scheduler.push(PendingEntry::new(mask, Callback::Step(self)));
            return;
        }

        self.core.try_set_result(());
    }
}

impl Recycle for NextFramePromise {
    fn create(home: Home<Self>) -> Self {
        Self {
            core: CompletionCore::new(home.reporter()),
            frame: AtomicU64::new(0),
            phase: AtomicU8::new(Phase::Update as u8),
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
        self.frame.store(0, Ordering::Release);
        self.phase.store(Phase::Update as u8, Ordering::Release);
    }
}

impl PooledSource for NextFramePromise {
    type Output = ();

    fn core(&self) -> &CompletionCore<()> {
        &self.core
    }
}

impl PhaseScheduler {
    /// Completes during the first drain of `phase` that happens after the next render advance.
    pub fn wait_for_next_frame(&self, phase: Phase, cancel: Cancellation) -> TaskHandle<()> {
        if cancel.is_requested() {
            return self.from_canceled(cancel);
        }

        let promise = self.pool::<NextFramePromise>().acquire();
        promise.frame.store(self.frame(), Ordering::Release);
        promise.phase.store(phase as u8, Ordering::Release);
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
    use core::time::Duration;

    #[test]
    fn resolves_after_one_render_advance() {
        let scheduler = PhaseScheduler::new();
        let handle = scheduler.wait_for_next_frame(Phase::Render, Cancellation::none());

        scheduler.advance_update(Duration::from_millis(16));
        assert_eq!(handle.status(), Status::Pending);

        scheduler.advance_render();
        assert_eq!(handle.status(), Status::Succeeded);
        handle.take_result().unwrap();
    }

    #[test]
    #[should_panic(expected = "not yet completed")]
    fn take_result_before_next_frame() {
        let scheduler = PhaseScheduler::new();
        let handle = scheduler.wait_for_next_frame(Phase::Render, Cancellation::none());
        scheduler.advance_update(Duration::from_millis(16));
        let _ = handle.take_result();
    }

    #[test]
    fn draining_the_phase_without_a_new_frame_keeps_waiting() {
        let scheduler = PhaseScheduler::new();
        let handle = scheduler.wait_for_next_frame(Phase::Render, Cancellation::none());

        scheduler.run_phase(Phase::Render);
        assert_eq!(handle.status(), Status::Pending);
        assert_eq!(scheduler.pending(), 1);

        scheduler.record_frame();
        scheduler.run_phase(Phase::Render);
        assert_eq!(handle.status(), Status::Succeeded);
    }

    #[test]
    fn update_waits_span_a_render() {
        let scheduler = PhaseScheduler::new();
        let handle = scheduler.wait_for_next_frame(Phase::Update, Cancellation::none());

        scheduler.advance_update(Duration::from_millis(16));
        assert_eq!(handle.status(), Status::Pending);

        scheduler.advance_render();
        assert_eq!(handle.status(), Status::Pending);

        scheduler.advance_update(Duration::from_millis(16));
        assert_eq!(handle.status(), Status::Succeeded);
    }

    #[test]
    fn cancellation() {
        let scheduler = PhaseScheduler::new();
        let signal = Arc::new(TestSignal::default());
        let handle = scheduler.wait_for_next_frame(Phase::Render, signal.clone().into());

        signal.request();
        scheduler.run_phase(Phase::Render);
        assert_eq!(handle.status(), Status::Canceled);
    }
}
