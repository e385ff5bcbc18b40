use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{DoubleConv, DoubleConvConfig, DownBlock};

fn bench_double_conv(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 2usize;
    let extents = &[32usize, 64, 128];
    let widths = &[16usize, 32];

    for &width in widths {
        let mut group = c.benchmark_group(format!("double_conv/c{width}"));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = DoubleConv::new(DoubleConvConfig::new(width, width), vb).expect("block");

        for &extent in extents {
            let input =
                Tensor::randn(0f32, 1.0, (batch, width, extent, extent), &device).expect("input");
            group.throughput(Throughput::Elements((batch * width * extent * extent) as u64));
            for train in [true, false] {
                let label = if train { "train" } else { "eval" };
                group.bench_with_input(
                    BenchmarkId::new(label, extent),
                    &(block.clone(), input.clone()),
                    |b, (block, input)| {
                        b.iter(|| {
                            let out = block.forward_t(black_box(input), train).expect("forward");
                            black_box(out);
                        });
                    },
                );
            }
        }
        group.finish();
    }
}

fn bench_down_block(c: &mut Criterion) {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let down = DownBlock::new(16, 32, vb).expect("down block");

    let mut group = c.benchmark_group("down_block");
    for &extent in &[64usize, 128] {
        let input = Tensor::randn(0f32, 1.0, (2, 16, extent, extent), &device).expect("input");
        group.bench_with_input(BenchmarkId::from_parameter(extent), &input, |b, input| {
            b.iter(|| {
                let out = down.forward_t(black_box(input), false).expect("forward");
                black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_double_conv, bench_down_block);
criterion_main!(benches);
