// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Moving a computation between the main thread and a worker pool.

use crate::cancel::Cancellation;
use crate::error::{Fault, TaskError};
use crate::phase::PhaseMask;
use crate::scheduler::PhaseScheduler;
use crate::task::TaskHandle;
use core::fmt;
use core::panic::{AssertUnwindSafe, Location};
use core::pin::Pin;
use core::task::{Context, Poll, Waker, ready};
use pin_project::pin_project;
use std::panic;
use std::sync::Arc;

/// An externally owned pool of background threads.
pub trait WorkerPool: Send + Sync {
    /// Wakes `callback` on a pool thread, carrying over the caller's ambient context (such as the
    /// current tracing span).
    fn enqueue(&self, callback: Waker);

    /// Wakes `callback` on a pool thread without capturing any ambient context.
    fn enqueue_without_context(&self, callback: Waker);
}

/// Future returned from [`PhaseScheduler::switch_to_worker_pool`].
///
/// Always suspends once and resumes on a pool thread.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SwitchToWorkerPool {
    pool: Arc<dyn WorkerPool>,
    capture_context: bool,
    enqueued: bool,
}

/// Future returned from [`PhaseScheduler::switch_to_main`].
///
/// Completes right away on the main thread, otherwise resumes during the next drain of a phase
/// in its mask. Fails with [`TaskError::Canceled`] if its cancellation was requested by the time
/// it resumes.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SwitchToMain {
    scheduler: PhaseScheduler,
    mask: PhaseMask,
    cancel: Cancellation,
    scheduled: bool,
}

/// Future returned from [`PhaseScheduler::return_to_main`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct ReturnToMain<F: Future> {
    #[pin]
    inner: F,
    output: Option<F::Output>,
    inner_done: bool,
    switch: SwitchToMain,
}

// === impl SwitchToWorkerPool ===

impl SwitchToWorkerPool {
    pub fn new(pool: Arc<dyn WorkerPool>, capture_context: bool) -> Self {
        Self {
            pool,
            capture_context,
            enqueued: false,
        }
    }
}

impl Future for SwitchToWorkerPool {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.enqueued {
            return Poll::Ready(());
        }

        self.enqueued = true;
        tracing::trace!(capture_context = self.capture_context, "switching to worker pool");
        if self.capture_context {
            self.pool.enqueue(cx.waker().clone());
        } else {
            self.pool.enqueue_without_context(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for SwitchToWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchToWorkerPool")
            .field("capture_context", &self.capture_context)
            .field("enqueued", &self.enqueued)
            .finish_non_exhaustive()
    }
}

// === impl SwitchToMain ===

impl Future for SwitchToMain {
    type Output = Result<(), TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.scheduler.is_main_thread() {
            return Poll::Ready(self.cancel.check());
        }

        if !self.scheduled {
            self.scheduled = true;
            tracing::trace!(mask = ?self.mask, "switching to main thread");
            self.scheduler.schedule(self.mask, cx.waker().clone());
        }
        Poll::Pending
    }
}

// === impl ReturnToMain ===

impl<F: Future> Future for ReturnToMain<F> {
    type Output = Result<F::Output, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if !*this.inner_done {
            let output = ready!(this.inner.as_mut().poll(cx));
            *this.inner_done = true;
            *this.output = Some(output);
        }

        ready!(Pin::new(&mut *this.switch).poll(cx))?;

        let Some(output) = this.output.take() else {
            panic!("`ReturnToMain` polled after completion");
        };
        Poll::Ready(Ok(output))
    }
}

impl<F: Future> fmt::Debug for ReturnToMain<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnToMain")
            .field("inner_done", &self.inner_done)
            .field("switch", &self.switch)
            .finish_non_exhaustive()
    }
}

// === impl PhaseScheduler ===

impl PhaseScheduler {
    /// Resumes the awaiting computation on the main thread.
    pub fn switch_to_main(&self, mask: impl Into<PhaseMask>, cancel: Cancellation) -> SwitchToMain {
        SwitchToMain {
            scheduler: self.clone(),
            mask: mask.into(),
            cancel,
            scheduled: false,
        }
    }

    /// Resumes the awaiting computation on a thread of the configured worker pool.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler was built without a [worker pool](crate::scheduler::SchedulerBuilder::worker_pool).
    #[track_caller]
    pub fn switch_to_worker_pool(&self) -> SwitchToWorkerPool {
        SwitchToWorkerPool::new(self.expect_worker_pool(), true)
    }

    /// Like [`switch_to_worker_pool`](Self::switch_to_worker_pool), but does not carry the
    /// caller's context over to the pool thread.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler was built without a worker pool.
    #[track_caller]
    pub fn switch_to_worker_pool_without_context(&self) -> SwitchToWorkerPool {
        SwitchToWorkerPool::new(self.expect_worker_pool(), false)
    }

    /// Runs `future` and then switches to the main thread, whichever thread `future` finished on.
    pub fn return_to_main<F: Future>(
        &self,
        mask: impl Into<PhaseMask>,
        cancel: Cancellation,
        future: F,
    ) -> ReturnToMain<F> {
        ReturnToMain {
            inner: future,
            output: None,
            inner_done: false,
            switch: self.switch_to_main(mask, cancel),
        }
    }

    /// Runs `f` on the worker pool.
    ///
    /// With `return_to_main` the returned handle completes on the main thread during the next
    /// [`Phase::Update`](crate::phase::Phase::Update) drain after `f` returned, otherwise on the
    /// pool thread. `cancel` is checked before and after switching. A panic inside `f` becomes a
    /// [`Fault`].
    ///
    /// # Panics
    ///
    /// Panics if the scheduler was built without a worker pool.
    #[track_caller]
    pub fn run_on_worker_pool<F, R>(
        &self,
        f: F,
        return_to_main: bool,
        cancel: Cancellation,
    ) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let location = Location::caller();
        let switch = self.switch_to_worker_pool();
        let back = return_to_main.then(|| self.switch_to_main(PhaseMask::UPDATE, cancel.clone()));

        self.task_builder()
            .kind("worker")
            .location(location)
            .spawn(async move {
                cancel.check()?;
                switch.await;
                cancel.check()?;

                let result = panic::catch_unwind(AssertUnwindSafe(f));
                if let Some(back) = back {
                    back.await?;
                }

                result.map_err(|payload| TaskError::Faulted(Fault::from_panic(payload, location)))
            })
    }

    #[track_caller]
    fn expect_worker_pool(&self) -> Arc<dyn WorkerPool> {
        match self.worker_pool() {
            Some(pool) => pool.clone(),
            None => panic!("no worker pool configured for this scheduler"),
        }
    }
}
