// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::Cancellation;
use crate::completion::CompletionCore;
use crate::phase::PhaseMask;
use crate::pool::{Home, PooledSource, Recycle};
use crate::scheduler::{Callback, PendingEntry, PhaseScheduler, Step};
use crate::task::TaskHandle;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;

/// Completes once the scheduler's elapsed time reaches `deadline`.
///
/// Re-checks on every drain of [`Phase::Update`](crate::phase::Phase::Update).
pub(crate) struct DelayPromise {
    core: CompletionCore<()>,
    /// Deadline in elapsed nanoseconds.
    deadline: AtomicU64,
    cancel: spin::Mutex<Cancellation>,
    home: Home<Self>,
}

impl Step for DelayPromise {
    fn step(self: Arc<Self>, scheduler: &PhaseScheduler) {
        let cancel = self.cancel.lock().clone();
        if cancel.is_requested() {
            self.core.try_set_canceled(cancel);
            return;
        }

        if scheduler.elapsed_nanos() < self.deadline.load(Ordering::Acquire) {
            scheduler.push(PendingEntry::new(PhaseMask::UPDATE, Callback::Step(self)));
            return;
        }

        self.core.try_set_result(());
    }
}

impl Recycle for DelayPromise {
    fn create(home: Home<Self>) -> Self {
        Self {
            core: CompletionCore::new(home.reporter()),
            deadline: AtomicU64::new(0),
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
        self.deadline.store(0, Ordering::Release);
    }
}

impl PooledSource for DelayPromise {
    type Output = ();

    fn core(&self) -> &CompletionCore<()> {
        &self.core
    }
}

impl PhaseScheduler {
    /// Completes once at least `duration` of elapsed time has been reported through update
    /// advances.
    ///
    /// The deadline is checked on every drain of [`Phase::Update`](crate::phase::Phase::Update),
    /// and so is `cancel`.
    pub fn delay(&self, duration: Duration, cancel: Cancellation) -> TaskHandle<()> {
        if cancel.is_requested() {
            return self.from_canceled(cancel);
        }

        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let promise = self.pool::<DelayPromise>().acquire();
        promise.deadline.store(
            self.elapsed_nanos().saturating_add(nanos),
            Ordering::Release,
        );
        *promise.cancel.lock() = cancel;

        let token = promise.core.version();
        self.push(PendingEntry::new(
            PhaseMask::UPDATE,
            Callback::Step(promise.clone()),
        ));
        TaskHandle::from_source(promise, token)
    }
}
