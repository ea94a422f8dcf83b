// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use scx_inputboost::battery::StaticSaver;
use scx_inputboost::boost::BoostDrv;
use scx_inputboost::clock::MonotonicClock;
use scx_inputboost::cpufreq::{ClusterClass, Policy};
use scx_inputboost::policy::min_freq;
use scx_inputboost::state::BoostFlags;
use scx_inputboost::tunables::Tunables;

fn policy() -> Policy {
    Policy {
        cpu: 4,
        class: ClusterClass::Performance,
        cpuinfo_min_freq: 400_000,
        cpuinfo_max_freq: 2_800_000,
        max: 2_800_000,
        min: 400_000,
    }
}

fn bench_min_freq(c: &mut Criterion) {
    let tun = Tunables::default();
    let p = policy();
    c.bench_function("min_freq", |b| {
        b.iter(|| {
            for bits in 0..16u32 {
                black_box(min_freq(
                    BoostFlags::from_bits_truncate(black_box(bits)),
                    &p,
                    false,
                    &tun,
                ));
            }
        })
    });
}

fn bench_kick_input(c: &mut Criterion) {
    let drv = BoostDrv::new(
        Arc::new(MonotonicClock::new()),
        Arc::new(Tunables::default()),
        Arc::new(StaticSaver::new(false)),
    );
    c.bench_function("kick_input", |b| b.iter(|| drv.kick_input()));
}

criterion_group!(benches, bench_min_freq, bench_kick_input);
criterion_main!(benches);
