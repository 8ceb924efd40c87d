//! Partitioned convolver benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sf_dsp::conv::{Input, Output, Partitions};

fn bench_convolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("convolver");

    for &(block_size, ir_len) in &[(256usize, 4096usize), (512, 16384)] {
        let ir: Vec<f32> = (0..ir_len).map(|i| (i as f32 * 0.37).sin() / 64.0).collect();
        let filter = Partitions::from_time_domain(block_size, &ir).unwrap();

        let mut input = Input::new(block_size, (ir_len + block_size - 1) / block_size).unwrap();
        let mut output = Output::new(&input);
        let block: Vec<f32> = (0..block_size).map(|i| (i as f32 * 0.11).cos()).collect();

        group.bench_function(format!("{block_size}x{ir_len}"), |b| {
            b.iter(|| {
                input.add_block(black_box(&block));
                black_box(output.convolve(&input, &filter, 1.0));
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_convolve);
criterion_main!(benches);
