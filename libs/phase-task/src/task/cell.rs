// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::completion::CompletionCore;
use crate::error::{Fault, TaskError};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::pool::{Home, PooledSource, Recycle, RecyclePool};
use crate::source::{Status, TaskSource};
use crate::task::TaskHandle;
use crate::task::id::Id;
use bitflags::bitflags;
use core::panic::{AssertUnwindSafe, Location};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use static_assertions::const_assert_eq;
use std::panic;
use std::sync::Arc;
use std::task::Wake;

/// The pooled state of one spawned computation.
///
/// A cell is polled inline by whichever thread wakes it. Wakeups that arrive while another
/// thread is polling set `NOTIFIED`, which makes the polling thread go around once more instead
/// of polling concurrently.
pub(crate) struct TaskCell<F, T> {
    state: AtomicUsize,
    future: UnsafeCell<Option<F>>,
    meta: UnsafeCell<Meta>,
    core: CompletionCore<T>,
    home: Home<Self>,
}

#[derive(Copy, Clone)]
struct Meta {
    id: Id,
    spawned_at: &'static Location<'static>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        const IDLE = 0b000;
        const POLLING = 0b001;
        const NOTIFIED = 0b010;
        const COMPLETE = 0b100;
    }
}
// IDLE MUST be zero
const_assert_eq!(State::IDLE.bits(), 0);

// Safety: the future and metadata are only accessed by the thread that claimed `POLLING`, or
// by the sole owner while the cell is being activated.
unsafe impl<F: Send, T: Send> Send for TaskCell<F, T> {}
// Safety: see above
unsafe impl<F: Send, T: Send> Sync for TaskCell<F, T> {}

// === impl TaskCell ===

impl<F, T> TaskCell<F, T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    pub(crate) fn spawn(
        pool: &Arc<RecyclePool<Self>>,
        future: F,
        id: Id,
        spawned_at: &'static Location<'static>,
    ) -> TaskHandle<T> {
        let cell = pool.acquire();

        // Safety: a freshly acquired cell is referenced by nobody else
        cell.future.with_mut(|ptr| unsafe { *ptr = Some(future) });
        // Safety: see above
        cell.meta
            .with_mut(|ptr| unsafe { *ptr = Meta { id, spawned_at } });
        cell.state.store(State::IDLE.bits(), Ordering::Release);

        let token = cell.core.version();
        tracing::trace!(task.tid = id.as_u64(), %token, "spawn");
        cell.run();

        match cell.core.unchecked_status() {
            // finished without suspending, hand out the value directly and recycle the cell
            Status::Succeeded => match TaskSource::take_result(cell, token) {
                Ok(value) => TaskHandle::ready(value),
                Err(_) => unreachable!("succeeded cell yielded an error"),
            },
            _ => TaskHandle::from_source(cell, token),
        }
    }

    fn run(self: &Arc<Self>) {
        if !self.claim() {
            return;
        }

        let outcome = {
            let waker = Waker::from(self.clone());
            let mut cx = Context::from_waker(&waker);

            loop {
                if let Poll::Ready(outcome) = self.poll_future(&mut cx) {
                    break outcome;
                }

                match self.compare_exchange(State::POLLING, State::IDLE) {
                    Ok(_) => return,
                    Err(actual) => {
                        debug_assert!(actual.contains(State::NOTIFIED));
                        // woken while polling, go around again
                        self.state
                            .fetch_and(!State::NOTIFIED.bits(), Ordering::AcqRel);
                    }
                }
            }
        };

        // The waker above is gone, so that a continuation consuming our result right away finds
        // the cell unreferenced.
        self.state
            .store(State::COMPLETE.bits(), Ordering::Release);
        self.core.try_complete(outcome);
    }

    /// Claims the right to poll, or leaves a notification for the thread that holds it.
    fn claim(&self) -> bool {
        let mut state = State::from_bits_retain(self.state.load(Ordering::Acquire));
        loop {
            if state.contains(State::COMPLETE) {
                return false;
            }

            let next = if state.contains(State::POLLING) {
                state | State::NOTIFIED
            } else {
                State::POLLING
            };

            match self.compare_exchange(state, next) {
                Ok(_) => return !state.contains(State::POLLING),
                Err(actual) => state = actual,
            }
        }
    }

    fn poll_future(&self, cx: &mut Context<'_>) -> Poll<Result<T, TaskError>> {
        // Safety: `POLLING` grants exclusive access to the metadata
        let Meta { id, spawned_at } = self.meta.with(|ptr| unsafe { *ptr });

        self.future.with_mut(|ptr| {
            // Safety: `POLLING` grants exclusive access to the future
            let slot = unsafe { &mut *ptr };

            let poll = match slot.as_mut() {
                Some(future) => panic::catch_unwind(AssertUnwindSafe(|| {
                    // Safety: the future lives inside the reference-counted cell and is only ever
                    // dropped in place.
                    unsafe { Pin::new_unchecked(future) }.poll(cx)
                })),
                None => return Poll::Pending,
            };

            match poll {
                Ok(Poll::Pending) => Poll::Pending,
                Ok(Poll::Ready(outcome)) => {
                    *slot = None;
                    Poll::Ready(outcome)
                }
                Err(payload) => {
                    *slot = None;
                    let fault = Fault::from_panic(payload, spawned_at);
                    tracing::trace!(task.tid = id.as_u64(), %fault, "task panicked");
                    Poll::Ready(Err(TaskError::Faulted(fault)))
                }
            }
        })
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: State, new: State) -> Result<State, State> {
        self.state
            .compare_exchange(curr.bits(), new.bits(), Ordering::AcqRel, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }
}

impl<F, T> Wake for TaskCell<F, T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.run();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.run();
    }
}

impl<F, T> Recycle for TaskCell<F, T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    fn create(home: Home<Self>) -> Self {
        Self {
            // inert until activated by `spawn`
            state: AtomicUsize::new(State::COMPLETE.bits()),
            future: UnsafeCell::new(None),
            meta: UnsafeCell::new(Meta {
                id: Id::stub(),
                spawned_at: Location::caller(),
            }),
            core: CompletionCore::new(home.reporter()),
            home,
        }
    }

    fn home(&self) -> &Home<Self> {
        &self.home
    }

    fn retire(&self) {
        self.core.retire();
    }

    fn reset(&self) {
        // `state` stays `COMPLETE` so that late wakeups are ignored until the next activation
        self.core.reset();
    }
}

impl<F, T> PooledSource for TaskCell<F, T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn core(&self) -> &CompletionCore<T> {
        &self.core
    }
}
