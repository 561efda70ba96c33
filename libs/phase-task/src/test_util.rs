// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::CancelSignal;
use crate::report::Failure;
use crate::switch::WorkerPool;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::Waker;
use std::sync::{Arc, Mutex};
use std::task::Wake;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::Span;

/// A waker that counts how often it was woken.
#[derive(Debug, Clone, Default)]
pub(crate) struct CountingWaker(Arc<Counter>);

#[derive(Debug, Default)]
struct Counter(AtomicUsize);

impl Wake for Counter {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl CountingWaker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::from(self.0.clone())
    }

    pub(crate) fn count(&self) -> usize {
        self.0.0.load(Ordering::SeqCst)
    }
}

/// A cancellation signal driven by hand.
#[derive(Debug, Default)]
pub(crate) struct TestSignal {
    requested: AtomicBool,
    callbacks: Mutex<Vec<Waker>>,
}

impl TestSignal {
    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let callbacks = core::mem::take(&mut *self.callbacks.lock().unwrap());
        for callback in callbacks {
            callback.wake();
        }
    }
}

impl CancelSignal for TestSignal {
    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn on_requested(&self, callback: Waker) {
        let mut callbacks = self.callbacks.lock().unwrap();
        if self.is_requested() {
            drop(callbacks);
            callback.wake();
        } else {
            callbacks.push(callback);
        }
    }
}

/// A failure sink that records everything it receives.
pub(crate) fn collecting_sink() -> (
    impl Fn(Failure) + Send + Sync + 'static,
    Arc<Mutex<Vec<Failure>>>,
) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let failures = failures.clone();
        move |failure: Failure| failures.lock().unwrap().push(failure)
    };
    (sink, failures)
}

/// A worker pool whose jobs are queued until a test runs them on a fresh thread.
#[derive(Debug, Default)]
pub(crate) struct QueuedPool {
    jobs: Mutex<Vec<Job>>,
}

#[derive(Debug)]
struct Job {
    callback: Waker,
    span: Option<Span>,
}

impl QueuedPool {
    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Runs every queued job on a new thread and returns that thread's id.
    pub(crate) fn run_on_new_thread(&self) -> ThreadId {
        self.run_in_background().join().unwrap()
    }

    /// Starts running every queued job on a new thread without waiting for it.
    pub(crate) fn run_in_background(&self) -> JoinHandle<ThreadId> {
        let jobs = core::mem::take(&mut *self.jobs.lock().unwrap());
        thread::spawn(move || {
            for job in jobs {
                let _entered = job.span.as_ref().map(Span::enter);
                job.callback.wake();
            }
            thread::current().id()
        })
    }
}

impl WorkerPool for QueuedPool {
    fn enqueue(&self, callback: Waker) {
        self.jobs.lock().unwrap().push(Job {
            callback,
            span: Some(Span::current()),
        });
    }

    fn enqueue_without_context(&self, callback: Waker) {
        self.jobs.lock().unwrap().push(Job {
            callback,
            span: None,
        });
    }
}
