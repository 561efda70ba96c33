// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The phase-ordered cooperative scheduler a host loop drives.
//!
//! A [`PhaseScheduler`] keeps a single list of pending continuations, each tagged with the set of
//! [`Phase`]s it may run in. The host calls [`PhaseScheduler::run_phase`] once per phase per loop
//! iteration (or the [`advance_update`](PhaseScheduler::advance_update) and
//! [`advance_render`](PhaseScheduler::advance_render) shorthands), which moves every matching
//! entry into a separate drain buffer under the lock and then runs them in order without it.
//! Entries scheduled while a phase drains therefore wait for the next call.

use crate::error::{Fault, TaskError};
use crate::phase::{Phase, PhaseMask};
use crate::pool::{PoolRegistry, Recycle, RecyclePool};
use crate::report::{Failure, FailureReporter};
use crate::switch::WorkerPool;
use core::fmt;
use core::mem;
use core::panic::{AssertUnwindSafe, Location};
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::Waker;
use core::time::Duration;
use std::panic;
use std::sync::Arc;
use std::thread::{self, ThreadId};

const DEFAULT_POOL_CAPACITY: usize = 64;
const DEFAULT_PENDING_CAPACITY: usize = 256;

/// Receives every [`Failure`] nobody consumed.
pub type FailureSink = Arc<dyn Fn(Failure) + Send + Sync>;

/// A single-threaded, phase-driven scheduler.
///
/// Cloning a `PhaseScheduler` is cheap and yields another handle to the same scheduler.
#[derive(Clone)]
pub struct PhaseScheduler {
    shared: Arc<Shared>,
}

/// Configures and creates a [`PhaseScheduler`].
#[must_use]
pub struct SchedulerBuilder {
    pool_capacity: usize,
    pending_capacity: usize,
    failure_sink: Option<FailureSink>,
    worker_pool: Option<Arc<dyn WorkerPool>>,
    main_thread: Option<ThreadId>,
}

/// A continuation waiting for one of the phases in its mask.
pub struct PendingEntry {
    mask: PhaseMask,
    callback: Callback,
}

/// Summary of a single [`PhaseScheduler::run_phase`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Tick {
    /// The phase that was drained.
    pub phase: Phase,

    /// The number of continuations that ran.
    pub ran: usize,

    /// The number of failures handed to the failure sink, including panics raised by
    /// continuations.
    pub reported: usize,

    /// The number of entries left in the pending list once the drain finished.
    pub remaining: usize,
}

/// Work that re-enters the scheduler when it runs, such as a pooled promise re-checking its
/// condition.
pub(crate) trait Step: Send + Sync {
    fn step(self: Arc<Self>, scheduler: &PhaseScheduler);
}

pub(crate) enum Callback {
    Wake(Waker),
    Step(Arc<dyn Step>),
    Call(Box<dyn FnOnce() + Send>),
    Report(Failure),
}

pub(crate) struct PendingQueue {
    entries: spin::Mutex<Vec<PendingEntry>>,
}

struct Shared {
    queue: Arc<PendingQueue>,
    drain: spin::Mutex<Vec<PendingEntry>>,
    sink: spin::RwLock<FailureSink>,
    main_thread: spin::RwLock<ThreadId>,
    /// Total elapsed time reported through update advances, in nanoseconds.
    elapsed: AtomicU64,
    /// Number of render advances so far.
    frame: AtomicU64,
    pools: PoolRegistry,
    worker_pool: Option<Arc<dyn WorkerPool>>,
}

// === impl PhaseScheduler ===

impl PhaseScheduler {
    /// Creates a scheduler with the default configuration, recording the calling thread as the
    /// main thread.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            failure_sink: None,
            worker_pool: None,
            main_thread: None,
        }
    }

    /// Schedules `waker` to be woken on the next drain of any phase in `mask`.
    pub fn schedule(&self, mask: PhaseMask, waker: Waker) {
        self.push(PendingEntry::new(mask, Callback::Wake(waker)));
    }

    /// Schedules `f` to run on the next drain of any phase in `mask`.
    ///
    /// A panic raised by `f` is caught and delivered to the failure sink.
    pub fn post<F>(&self, mask: PhaseMask, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(PendingEntry::new(mask, Callback::Call(Box::new(f))));
    }

    /// Runs every pending continuation whose mask includes `phase`.
    ///
    /// Continuations run in the order they were scheduled. Anything scheduled while this drain
    /// runs, including a continuation rescheduling itself for `phase`, waits for the next call.
    ///
    /// # Panics
    ///
    /// Panics raised by continuations are caught and reported. A panic raised by the failure sink
    /// itself propagates to the caller once the entries this drain had not reached yet are put
    /// back at the front of the pending list, so a later call still runs them.
    #[track_caller]
    pub fn run_phase(&self, phase: Phase) -> Tick {
        let _span = tracing::trace_span!("run_phase", %phase).entered();

        let mut drain = mem::take(&mut *self.shared.drain.lock());
        {
            let mut pending = self.shared.queue.entries.lock();
            drain.extend(pending.extract_if(.., |entry| entry.mask.includes(phase)));
        }

        let mut tick = Tick {
            phase,
            ran: 0,
            reported: 0,
            remaining: 0,
        };

        let caller = Location::caller();
        let mut entries = drain.drain(..);
        while let Some(entry) = entries.next() {
            let failure = match entry.callback {
                Callback::Report(failure) => Some(failure),
                callback => {
                    tick.ran += 1;
                    panic::catch_unwind(AssertUnwindSafe(|| self.invoke(callback)))
                        .err()
                        .map(|payload| {
                            Failure::new(TaskError::Faulted(Fault::from_panic(payload, caller)))
                        })
                }
            };
            let Some(failure) = failure else {
                continue;
            };

            tick.reported += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.deliver(failure))) {
                // whatever this drain did not reach goes back to the front of the pending list
                let rest: Vec<_> = entries.by_ref().collect();
                drop(entries);
                {
                    let mut pending = self.shared.queue.entries.lock();
                    let scheduled = mem::replace(&mut *pending, rest);
                    pending.extend(scheduled);
                }
                *self.shared.drain.lock() = drain;
                tracing::warn!("failure sink panicked, re-queued the rest of the drain");
                panic::resume_unwind(payload);
            }
        }
        drop(entries);

        *self.shared.drain.lock() = drain;
        tick.remaining = self.shared.queue.entries.lock().len();

        tracing::trace!(
            ran = tick.ran,
            reported = tick.reported,
            remaining = tick.remaining,
            "phase drained"
        );
        tick
    }

    /// Records the calling thread as the main thread and drains [`Phase::Init`] followed by
    /// [`Phase::PostInit`].
    ///
    /// Hosts call this exactly once at startup.
    #[track_caller]
    pub fn initialize(&self) -> [Tick; 2] {
        self.set_main_thread(thread::current().id());
        [
            self.run_phase(Phase::Init),
            self.run_phase(Phase::PostInit),
        ]
    }

    /// Adds `elapsed` to the total elapsed time and drains the three update phases in order.
    #[track_caller]
    pub fn advance_update(&self, elapsed: Duration) -> [Tick; 3] {
        self.record_elapsed(elapsed);
        [
            self.run_phase(Phase::PreUpdate),
            self.run_phase(Phase::Update),
            self.run_phase(Phase::PostUpdate),
        ]
    }

    /// Advances the frame counter and drains the three render phases in order.
    #[track_caller]
    pub fn advance_render(&self) -> [Tick; 3] {
        self.record_frame();
        [
            self.run_phase(Phase::PreRender),
            self.run_phase(Phase::Render),
            self.run_phase(Phase::PostRender),
        ]
    }

    /// Adds `elapsed` to the total elapsed time without draining anything.
    ///
    /// For hosts that drive phases individually through [`run_phase`](Self::run_phase).
    pub fn record_elapsed(&self, elapsed: Duration) {
        self.shared
            .elapsed
            .fetch_add(duration_to_nanos(elapsed), Ordering::AcqRel);
    }

    /// Advances the frame counter without draining anything.
    pub fn record_frame(&self) {
        self.shared.frame.fetch_add(1, Ordering::AcqRel);
    }

    /// The total time reported through update advances.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos())
    }

    /// The number of render advances so far.
    pub fn frame(&self) -> u64 {
        self.shared.frame.load(Ordering::Acquire)
    }

    pub fn main_thread(&self) -> ThreadId {
        *self.shared.main_thread.read()
    }

    pub fn set_main_thread(&self, id: ThreadId) {
        *self.shared.main_thread.write() = id;
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread()
    }

    /// Replaces the failure sink.
    pub fn set_failure_sink<F>(&self, sink: F)
    where
        F: Fn(Failure) + Send + Sync + 'static,
    {
        *self.shared.sink.write() = Arc::new(sink);
    }

    /// A reporter forwarding to this scheduler.
    pub fn reporter(&self) -> FailureReporter {
        FailureReporter::new(Arc::downgrade(&self.shared.queue))
    }

    /// The number of entries waiting in the pending list.
    pub fn pending(&self) -> usize {
        self.shared.queue.entries.lock().len()
    }

    /// The pool this scheduler uses for instances of `P`.
    pub fn pool<P: Recycle>(&self) -> Arc<RecyclePool<P>> {
        self.shared.pools.get::<P>()
    }

    pub(crate) fn worker_pool(&self) -> Option<&Arc<dyn WorkerPool>> {
        self.shared.worker_pool.as_ref()
    }

    pub(crate) fn elapsed_nanos(&self) -> u64 {
        self.shared.elapsed.load(Ordering::Acquire)
    }

    pub(crate) fn push(&self, entry: PendingEntry) {
        self.shared.queue.push(entry);
    }

    fn invoke(&self, callback: Callback) {
        match callback {
            Callback::Wake(waker) => waker.wake(),
            Callback::Step(step) => step.step(self),
            Callback::Call(f) => f(),
            Callback::Report(failure) => self.deliver(failure),
        }
    }

    fn deliver(&self, failure: Failure) {
        let sink = self.shared.sink.read().clone();
        sink(failure);
    }
}

impl Default for PhaseScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PhaseScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseScheduler")
            .field("main_thread", &self.main_thread())
            .field("elapsed", &self.elapsed())
            .field("frame", &self.frame())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

// === impl SchedulerBuilder ===

impl SchedulerBuilder {
    /// The maximum number of idle instances kept per pooled type.
    ///
    /// Defaults to 64.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// The number of entries the pending list and drain buffer reserve up front.
    ///
    /// Defaults to 256.
    pub fn pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    /// Where unobserved failures are delivered.
    ///
    /// By default they are logged at the `error` level.
    pub fn failure_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(Failure) + Send + Sync + 'static,
    {
        self.failure_sink = Some(Arc::new(sink));
        self
    }

    /// The worker pool used by [`PhaseScheduler::switch_to_worker_pool`].
    pub fn worker_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    /// Overrides the main thread identity.
    ///
    /// By default the thread calling [`build`](Self::build) is the main thread.
    pub fn main_thread(mut self, id: ThreadId) -> Self {
        self.main_thread = Some(id);
        self
    }

    pub fn build(self) -> PhaseScheduler {
        let queue = Arc::new(PendingQueue {
            entries: spin::Mutex::new(Vec::with_capacity(self.pending_capacity)),
        });
        let reporter = FailureReporter::new(Arc::downgrade(&queue));

        let shared = Shared {
            drain: spin::Mutex::new(Vec::with_capacity(self.pending_capacity)),
            sink: spin::RwLock::new(
                self.failure_sink
                    .unwrap_or_else(|| Arc::new(log_failure) as FailureSink),
            ),
            main_thread: spin::RwLock::new(
                self.main_thread.unwrap_or_else(|| thread::current().id()),
            ),
            elapsed: AtomicU64::new(0),
            frame: AtomicU64::new(0),
            pools: PoolRegistry::new(self.pool_capacity, reporter),
            worker_pool: self.worker_pool,
            queue,
        };

        PhaseScheduler {
            shared: Arc::new(shared),
        }
    }
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("pool_capacity", &self.pool_capacity)
            .field("pending_capacity", &self.pending_capacity)
            .field("failure_sink", &self.failure_sink.is_some())
            .field("worker_pool", &self.worker_pool.is_some())
            .field("main_thread", &self.main_thread)
            .finish()
    }
}

fn log_failure(failure: Failure) {
    tracing::error!(error = %failure.error(), "unobserved task failure");
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

// === impl PendingEntry ===

impl PendingEntry {
    pub(crate) fn new(mask: PhaseMask, callback: Callback) -> Self {
        Self { mask, callback }
    }

    pub fn mask(&self) -> PhaseMask {
        self.mask
    }
}

impl fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.callback {
            Callback::Wake(_) => "wake",
            Callback::Step(_) => "step",
            Callback::Call(_) => "call",
            Callback::Report(_) => "report",
        };
        f.debug_struct("PendingEntry")
            .field("mask", &self.mask)
            .field("callback", &kind)
            .finish()
    }
}

// === impl PendingQueue ===

impl PendingQueue {
    pub(crate) fn push(&self, entry: PendingEntry) {
        tracing::trace!(?entry, "schedule");
        self.entries.lock().push(entry);
    }
}
