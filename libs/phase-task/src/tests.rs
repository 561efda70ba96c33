// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scenarios that drive the scheduler the way a host loop would.

use crate::cancel::Cancellation;
use crate::error::TaskError;
use crate::phase::Phase;
use crate::scheduler::PhaseScheduler;
use crate::source::Status;
use crate::test_util::{TestSignal, collecting_sink};
use core::time::Duration;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

const FRAME: Duration = Duration::from_millis(16);

fn run_frame(scheduler: &PhaseScheduler) {
    scheduler.advance_update(FRAME);
    scheduler.advance_render();
}

#[test]
fn delay_resolves_on_the_third_update() {
    let scheduler = PhaseScheduler::new();
    scheduler.initialize();

    let handle = scheduler.delay(Duration::from_millis(250), Cancellation::none());

    scheduler.advance_update(Duration::from_millis(100));
    assert_eq!(handle.status(), Status::Pending);
    scheduler.advance_update(Duration::from_millis(100));
    assert_eq!(handle.status(), Status::Pending);
    scheduler.advance_update(Duration::from_millis(100));
    assert_eq!(handle.status(), Status::Succeeded);

    handle.take_result().unwrap();
}

#[test]
fn next_frame_resolves_after_a_single_render_advance() {
    let scheduler = PhaseScheduler::new();
    scheduler.initialize();

    let handle = scheduler.wait_for_next_frame(Phase::Render, Cancellation::none());
    assert_eq!(handle.status(), Status::Pending);

    scheduler.advance_render();
    assert_eq!(handle.status(), Status::Succeeded);
}

#[test]
fn manual_source_notifies_every_observer_once() {
    let scheduler = PhaseScheduler::new();
    let source = scheduler.manual_source::<&'static str>();

    let spawn_observer = |source: &crate::manual::ManualSource<&'static str>| {
        let handle = source.handle();
        scheduler.spawn(async move { handle.await.map(str::len) })
    };
    let first = spawn_observer(&source);
    let second = spawn_observer(&source);
    assert_eq!(first.status(), Status::Pending);
    assert_eq!(second.status(), Status::Pending);

    assert!(source.try_set_result("done"));
    assert!(!source.try_set_result("again"));

    assert_eq!(first.take_result().unwrap(), 4);
    assert_eq!(second.take_result().unwrap(), 4);
}

#[test]
fn dropped_fault_is_reraised_by_a_later_phase() {
    let (sink, failures) = collecting_sink();
    let scheduler = PhaseScheduler::builder().failure_sink(sink).build();

    let handle = scheduler.spawn(async { Err::<(), _>(TaskError::msg("lost")) });
    assert_eq!(handle.status(), Status::Faulted);
    drop(handle);
    assert!(failures.lock().unwrap().is_empty());

    let tick = scheduler.run_phase(Phase::PreRender);
    assert_eq!(tick.reported, 1);

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error().to_string().contains("lost"));
}

#[test]
fn scripted_computation_follows_the_loop() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let scheduler = PhaseScheduler::new();
    scheduler.initialize();
    let log = Arc::new(Mutex::new(Vec::new()));

    let handle = scheduler.spawn({
        let scheduler = scheduler.clone();
        let log = log.clone();
        async move {
            let step = |name: &'static str| log.lock().unwrap().push(name);

            step("start");
            scheduler.yield_now(Phase::PreUpdate).await;
            step("pre-update");
            scheduler.yield_now(Phase::Render).await;
            step("render");
            scheduler
                .delay(Duration::from_millis(100), Cancellation::none())
                .await?;
            step("delayed");
            scheduler
                .wait_for_next_frame(Phase::PostRender, Cancellation::none())
                .await?;
            step("next frame");

            Ok(scheduler.frame())
        }
    });

    // the delay starts during the first render phase at 16ms and needs until 116ms
    for _ in 0..7 {
        run_frame(&scheduler);
    }
    assert_eq!(handle.status(), Status::Pending);
    assert_eq!(*log.lock().unwrap(), ["start", "pre-update", "render"]);

    run_frame(&scheduler);
    assert_eq!(handle.take_result().unwrap(), 8);
    assert_eq!(
        *log.lock().unwrap(),
        ["start", "pre-update", "render", "delayed", "next frame"]
    );
}

#[test]
fn cancellation_propagates_through_awaits() {
    let scheduler = PhaseScheduler::new();
    let signal = Arc::new(TestSignal::default());

    let handle = scheduler.spawn({
        let scheduler = scheduler.clone();
        let cancel = Cancellation::from(signal.clone());
        async move {
            scheduler.delay(Duration::from_secs(60), cancel).await?;
            Ok(())
        }
    });

    run_frame(&scheduler);
    assert_eq!(handle.status(), Status::Pending);

    signal.request();
    run_frame(&scheduler);
    assert_eq!(handle.status(), Status::Canceled);
    assert!(handle.take_result().unwrap_err().is_canceled());
}

#[test]
fn pooled_state_is_reused_across_frames() {
    let scheduler = PhaseScheduler::new();
    scheduler.initialize();

    for _ in 0..32 {
        let handle = scheduler.spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler.yield_with(Phase::Update, Cancellation::none()).await?;
                scheduler.delay(Duration::ZERO, Cancellation::none()).await
            }
        });
        run_frame(&scheduler);
        run_frame(&scheduler);
        handle.take_result().unwrap();
    }

    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn forgotten_computations_report_their_failures() {
    let (sink, failures) = collecting_sink();
    let scheduler = PhaseScheduler::builder().failure_sink(sink).build();

    let handle = scheduler.spawn({
        let scheduler = scheduler.clone();
        async move {
            scheduler.yield_now(Phase::Render).await;
            Err::<(), _>(TaskError::msg("render failed"))
        }
    });
    scheduler.forget(handle);

    scheduler.advance_update(FRAME);
    assert!(failures.lock().unwrap().is_empty());

    // completes during Render, reported on the next drain
    scheduler.advance_render();
    assert_eq!(failures.lock().unwrap().len(), 1);
}
