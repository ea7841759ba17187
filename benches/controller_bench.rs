use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use brew_engine::control::bank::ControlUnit;
use brew_engine::control::gains::ControlGains;
use brew_engine::profile::Algorithm;

fn control_unit_bench(c: &mut Criterion) {
    let gains = ControlGains::default();

    c.bench_function("pid_command", |b| {
        let mut unit = ControlUnit::for_phase(Algorithm::Pid, &gains, 9.0);
        let mut actual = 0.0;
        b.iter(|| {
            let cmd = unit.command(black_box(9.0), black_box(actual), black_box(0.05));
            actual += (cmd - 0.3) * 0.1;
            cmd
        })
    });

    c.bench_function("fuzzy_command", |b| {
        let mut unit = ControlUnit::for_phase(Algorithm::Fuzzy, &gains, 9.0);
        let mut actual = 0.0;
        b.iter(|| {
            let cmd = unit.command(black_box(9.0), black_box(actual), black_box(0.05));
            actual += (cmd - 0.3) * 0.1;
            cmd
        })
    });

    c.bench_function("adaptive_command", |b| {
        let mut unit = ControlUnit::for_phase(Algorithm::Adaptive, &gains, 9.0);
        let mut actual = 0.0;
        b.iter(|| {
            let cmd = unit.command(black_box(9.0), black_box(actual), black_box(0.05));
            actual += (cmd - 0.3) * 0.1;
            cmd
        })
    });
}

criterion_group!(benches, control_unit_bench);
criterion_main!(benches);
