//! Frame synthesis benchmarks across the three generator modes.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use checkflicker::config::{Margins, RandMode, StimConfig, SubFrameMode};
use checkflicker::context::PipelineContext;
use checkflicker::synth::FrameSynthesizer;

fn config(mode: RandMode) -> StimConfig {
    StimConfig {
        display_width: 800,
        display_height: 600,
        stixel_width: 10,
        stixel_height: 10,
        rand_mode: mode,
        contrast: 0.9,
        background: 0.5,
        margins: Margins::default(),
        displacement_x: 0,
        displacement_y: 0,
        sub_frame: SubFrameMode::Triple,
        color_table_size: 1 << 15,
        cache_depth: 30,
        cores: 1,
        seed: 10_000,
        frame_track: Default::default(),
    }
}

fn bench_synthesize(c: &mut Criterion) {
    let mut group = c.benchmark_group("synth_frame");
    group.sample_size(50);

    for (label, mode) in [
        ("uniform_80x60", RandMode::Uniform),
        ("binary_80x60", RandMode::Binary),
        ("gaussian_80x60", RandMode::Gaussian),
    ] {
        let ctx = PipelineContext::new(config(mode)).expect("config should validate");
        let mut synth = FrameSynthesizer::new(ctx);
        group.bench_function(label, |b| {
            b.iter(|| black_box(synth.synthesize().pixels.len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_synthesize);
criterion_main!(benches);
