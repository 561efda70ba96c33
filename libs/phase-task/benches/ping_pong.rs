// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;
use criterion::{Criterion, criterion_group, criterion_main};
use phase_task::{Cancellation, Phase, PhaseScheduler};

const PINGS: usize = 10_000;

fn drain_until_done(scheduler: &PhaseScheduler, done: impl Fn() -> bool) {
    while !done() {
        scheduler.advance_update(Duration::from_millis(1));
        scheduler.advance_render();
    }
}

fn ping_ping_10k_yield(c: &mut Criterion) {
    let scheduler = PhaseScheduler::new();
    scheduler.initialize();

    c.bench_function("ping_ping_10k_yield", |b| {
        b.iter(|| {
            let h = scheduler.spawn({
                let scheduler = scheduler.clone();
                async move {
                    for _ in 0..PINGS {
                        scheduler.yield_now(Phase::Update).await;
                    }
                    Ok(())
                }
            });
            drain_until_done(&scheduler, || h.is_completed());
            h.take_result().unwrap();
        });
    });
}

fn ping_pong_10k_pooled(c: &mut Criterion) {
    let scheduler = PhaseScheduler::new();
    scheduler.initialize();

    c.bench_function("ping_pong_10k_pooled", |b| {
        b.iter(|| {
            let spawn = || {
                let task = scheduler.clone();
                scheduler.spawn(async move {
                    for _ in 0..PINGS {
                        task.yield_with(Phase::Update, Cancellation::none())
                            .await?;
                    }
                    Ok(())
                })
            };
            let h1 = spawn();
            let h2 = spawn();

            drain_until_done(&scheduler, || h1.is_completed() && h2.is_completed());
            h1.take_result().unwrap();
            h2.take_result().unwrap();
        });
    });
}

fn manual_fan_out_10k(c: &mut Criterion) {
    let scheduler = PhaseScheduler::new();

    c.bench_function("manual_fan_out_10k", |b| {
        b.iter(|| {
            let source = scheduler.manual_source::<u32>();
            let handles: Vec<_> = (0..PINGS)
                .map(|_| {
                    let handle = source.handle();
                    scheduler.spawn(handle)
                })
                .collect();

            source.try_set_result(1);
            for handle in handles {
                handle.take_result().unwrap();
            }
        });
    });
}

criterion_group!(
    ping_pong,
    ping_ping_10k_yield,
    ping_pong_10k_pooled,
    manual_fan_out_10k,
);
criterion_main!(ping_pong);
