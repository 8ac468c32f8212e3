//! # Impulse Generation Benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use motor_lib::gpio::MicrostepResolution;
use motor_lib::hw_prog::{interp::ShiftModel, HardwareTimingProgram, HwProgParams};
use motor_lib::impulse::{impulse_durations, ImpulseCache, StepGeometry, StopRule};

fn impulse_benchmark(c: &mut Criterion) {
    let geometry = StepGeometry::default();
    let res = MicrostepResolution::Sixteenth;

    // A half turn of the platform in one second at 1/16 step, a few thousand impulses
    let k = geometry.k(2.0 * std::f64::consts::PI, res);

    c.bench_function("impulse_durations 1 s", |b| {
        b.iter(|| {
            impulse_durations(
                black_box(k),
                black_box(1.0 / 300.0),
                StopRule::Duration(1.0),
            )
        })
    });

    let cache = ImpulseCache::new();
    c.bench_function("impulse cache hit", |b| {
        b.iter(|| cache.get_or_generate(black_box(k), 1.0 / 300.0, StopRule::Duration(1.0)))
    });
}

fn interpreter_benchmark(c: &mut Criterion) {
    let program = HardwareTimingProgram::new().unwrap();
    let k = StepGeometry::default().k(0.5, MicrostepResolution::Sixteenth);
    let params = HwProgParams::new(300.0, k, 0.5, 24).unwrap();

    c.bench_function("hw program simulate 0.5 s", |b| {
        b.iter(|| program.simulate(black_box(&params), ShiftModel::SignedShift))
    });
}

criterion_group!(benches, impulse_benchmark, interpreter_benchmark);
criterion_main!(benches);
