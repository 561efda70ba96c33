// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Free-list recycling for completion sources and spawned computations.
//!
//! Every pooled type implements [`Recycle`]. Instances are handed out by
//! [`RecyclePool::acquire`] and come back through [`RecyclePool::release`] once their result has
//! been consumed. Releasing only retires the finished use. An idle instance is reset and handed
//! out again once the pool holds the last reference to it, so neither a completer that is still
//! returning nor a stale waker or handle from a previous use can reach the next occupant.

use crate::completion::CompletionCore;
use crate::error::TaskError;
use crate::report::FailureReporter;
use crate::source::{Status, TaskSource, Token};
use core::any::{Any, TypeId, type_name};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::Waker;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// A type that can be kept in a [`RecyclePool`].
pub trait Recycle: Sized + Send + Sync + 'static {
    /// Constructs a fresh instance owned by `home`.
    fn create(home: Home<Self>) -> Self;

    fn home(&self) -> &Home<Self>;

    /// Ends the finished use and drops what it referenced.
    ///
    /// Called by [`RecyclePool::release`]. Other threads may still hold references to the
    /// instance, so only state they never touch may be cleared here.
    fn retire(&self);

    /// Clears every field back to its default.
    ///
    /// Called by [`RecyclePool::acquire`] once the pool holds the only reference.
    fn reset(&self);
}

/// A pooled type that owns a [`CompletionCore`].
///
/// Every `PooledSource` is a [`TaskSource`] that releases itself back to its pool as soon as its
/// result is consumed.
pub trait PooledSource: Recycle {
    type Output: Send + 'static;

    fn core(&self) -> &CompletionCore<Self::Output>;
}

/// The back-reference from a pooled instance to the pool it returns to.
pub struct Home<P> {
    pool: Weak<RecyclePool<P>>,
    reporter: FailureReporter,
}

/// A bounded free list of `P` instances.
pub struct RecyclePool<P> {
    free: spin::Mutex<Vec<Arc<P>>>,
    capacity: usize,
    reporter: FailureReporter,
    created: AtomicUsize,
    reused: AtomicUsize,
}

/// One [`RecyclePool`] per pooled type, created on first use.
pub(crate) struct PoolRegistry {
    pools: spin::Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    capacity: usize,
    reporter: FailureReporter,
}

// === impl RecyclePool ===

impl<P: Recycle> RecyclePool<P> {
    pub fn new(capacity: usize, reporter: FailureReporter) -> Arc<Self> {
        Arc::new(Self {
            free: spin::Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            reporter,
            created: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        })
    }

    /// Returns an idle instance nobody else references, or constructs a new one.
    pub fn acquire(self: &Arc<Self>) -> Arc<P> {
        let recycled = {
            let mut free = self.free.lock();
            free.iter_mut()
                .rposition(|item| Arc::get_mut(item).is_some())
                .map(|index| free.swap_remove(index))
        };

        if let Some(item) = recycled {
            item.reset();
            self.reused.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(pool = type_name::<P>(), "reusing idle instance");
            return item;
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pool = type_name::<P>(), "creating instance");
        Arc::new(P::create(Home {
            pool: Arc::downgrade(self),
            reporter: self.reporter.clone(),
        }))
    }

    /// Retires `item` and puts it back into the pool it was acquired from.
    ///
    /// The item is dropped instead if its pool is gone or full.
    pub fn release(item: Arc<P>) {
        item.retire();

        let Some(pool) = item.home().pool.upgrade() else {
            return;
        };

        let mut free = pool.free.lock();
        if free.len() < pool.capacity {
            free.push(item);
        } else {
            drop(free);
            tracing::trace!(pool = type_name::<P>(), "pool full, dropping instance");
        }
    }

    /// The number of instances currently waiting in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// The number of instances this pool has constructed.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// The number of times an idle instance was handed out again.
    pub fn reused(&self) -> usize {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<P> fmt::Debug for RecyclePool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecyclePool")
            .field("type", &type_name::<P>())
            .field("idle", &self.free.lock().len())
            .field("capacity", &self.capacity)
            .field("created", &self.created.load(Ordering::Relaxed))
            .field("reused", &self.reused.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl Home ===

impl<P> Home<P> {
    /// The reporter pooled instances hand to their [`CompletionCore`].
    pub fn reporter(&self) -> FailureReporter {
        self.reporter.clone()
    }
}

impl<P> fmt::Debug for Home<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Home")
            .field("pool", &type_name::<P>())
            .field("reporter", &self.reporter)
            .finish()
    }
}

// === impl PooledSource ===

impl<P: PooledSource> TaskSource<P::Output> for P {
    fn status(&self, token: Token) -> Status {
        self.core().status(token)
    }

    fn on_completed(&self, continuation: Waker, token: Token) {
        self.core().on_completed(continuation, token);
    }

    fn take_result(self: Arc<Self>, token: Token) -> Result<P::Output, TaskError> {
        let outcome = self.core().take_result(token);
        RecyclePool::release(self);
        outcome
    }
}

// === impl PoolRegistry ===

impl PoolRegistry {
    pub(crate) fn new(capacity: usize, reporter: FailureReporter) -> Self {
        Self {
            pools: spin::Mutex::new(HashMap::new()),
            capacity,
            reporter,
        }
    }

    pub(crate) fn get<P: Recycle>(&self) -> Arc<RecyclePool<P>> {
        let pool = self
            .pools
            .lock()
            .entry(TypeId::of::<P>())
            .or_insert_with(|| {
                RecyclePool::<P>::new(self.capacity, self.reporter.clone())
                    as Arc<dyn Any + Send + Sync>
            })
            .clone();

        pool.downcast::<RecyclePool<P>>()
            .unwrap_or_else(|_| unreachable!("pool registered under a foreign type id"))
    }
}
