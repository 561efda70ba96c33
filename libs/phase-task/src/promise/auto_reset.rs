// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::Cancellation;
use crate::completion::CompletionCore;
use crate::error::Fault;
use crate::pool::{Home, PooledSource, Recycle};
use crate::scheduler::PhaseScheduler;
use crate::source::{Status, Token};
use crate::task::TaskHandle;
use core::fmt;
use std::sync::Arc;

/// The producer side of a pooled, single-consumer completion source.
///
/// Hand [`handle`](Self::handle) to the consumer and complete it through one of the `try_set_*`
/// methods. The backing state returns to its pool once the consumer took the result and this
/// producer is dropped. A producer that outlived the use it was created for is rejected.
pub struct AutoResetSource<T: Send + 'static> {
    promise: Arc<AutoResetPromise<T>>,
    token: Token,
}

pub(crate) struct AutoResetPromise<T> {
    core: CompletionCore<T>,
    home: Home<Self>,
}

// === impl AutoResetSource ===

impl<T: Send + 'static> AutoResetSource<T> {
    /// A handle observing this source. Only one handle may await it.
    pub fn handle(&self) -> TaskHandle<T> {
        TaskHandle::from_source(self.promise.clone(), self.token)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// # Panics
    ///
    /// Panics if the result was already consumed.
    #[track_caller]
    pub fn status(&self) -> Status {
        self.promise.core.status(self.token)
    }

    /// Returns `false` if the source was already completed.
    pub fn try_set_result(&self, value: T) -> bool {
        self.is_current() && self.promise.core.try_set_result(value)
    }

    /// Returns `false` if the source was already completed.
    pub fn try_set_fault(&self, fault: Fault) -> bool {
        self.is_current() && self.promise.core.try_set_fault(fault)
    }

    /// Returns `false` if the source was already completed.
    pub fn try_set_canceled(&self, cancellation: Cancellation) -> bool {
        self.is_current() && self.promise.core.try_set_canceled(cancellation)
    }

    fn is_current(&self) -> bool {
        self.promise.core.version() == self.token
    }
}

impl<T: Send + 'static> fmt::Debug for AutoResetSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoResetSource")
            .field("token", &self.token)
            .field("core", &self.promise.core)
            .finish()
    }
}

// === impl AutoResetPromise ===

impl<T: Send + 'static> Recycle for AutoResetPromise<T> {
    fn create(home: Home<Self>) -> Self {
        Self {
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
        self.core.reset();
    }
}

impl<T: Send + 'static> PooledSource for AutoResetPromise<T> {
    type Output = T;

    fn core(&self) -> &CompletionCore<T> {
        &self.core
    }
}

// === impl PhaseScheduler ===

impl PhaseScheduler {
    /// Acquires a pooled single-consumer completion source.
    pub fn auto_reset_source<T: Send + 'static>(&self) -> AutoResetSource<T> {
        let promise = self.pool::<AutoResetPromise<T>>().acquire();
        let token = promise.core.version();
        AutoResetSource { promise, token }
    }

    /// A handle that already failed with `fault`.
    ///
    /// The fault is reported to the failure sink if the handle is dropped without being consumed.
    pub fn from_fault<T: Send + 'static>(&self, fault: Fault) -> TaskHandle<T> {
        let source = self.auto_reset_source();
        source.try_set_fault(fault);
        source.handle()
    }

    /// A handle that already completed as canceled by `cancellation`.
    pub fn from_canceled<T: Send + 'static>(&self, cancellation: Cancellation) -> TaskHandle<T> {
        let source = self.auto_reset_source();
        source.try_set_canceled(cancellation);
        source.handle()
    }
}
