use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    conv::{Conv1d, Conv1dConfig},
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

fn bench_linear(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 32usize;
    let seq = 96usize;
    // (series, d_model) projections seen in forecasting configs.
    let shapes = &[(8usize, 128usize), (128, 512), (512, 512)];

    for &dtype in &[DType::F32, DType::BF16] {
        let mut group = c.benchmark_group(format!("linear/{dtype:?}"));
        for &(input_dim, output_dim) in shapes {
            let linear = Linear::with_init(
                LinearConfig::new(input_dim, output_dim),
                &LinearInit::XavierNormal,
                &device,
                dtype,
            )
            .expect("linear init");
            let input = Tensor::randn(0f32, 1.0, (batch, seq, input_dim), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            group.throughput(Throughput::Elements((batch * seq * input_dim * output_dim) as u64));
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{input_dim}x{output_dim}")),
                &(linear, input, policy),
                |b, (linear, input, policy)| {
                    b.iter(|| black_box(linear.forward(black_box(input), policy).expect("forward")));
                },
            );
        }
        group.finish();
    }
}

fn bench_circular_conv(c: &mut Criterion) {
    let device = Device::Cpu;
    let policy = PrecisionPolicy::default();
    let mut group = c.benchmark_group("conv1d/circular");
    for &(channels, seq) in &[(8usize, 96usize), (512, 48)] {
        let conv = Conv1d::with_init(
            Conv1dConfig::circular(channels, 512, 3),
            &LinearInit::KaimingNormal { negative_slope: 0.01 },
            &device,
            DType::F32,
        )
        .expect("conv init");
        let input = Tensor::randn(0f32, 1.0, (16, channels, seq), &device).expect("input");
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{channels}ch_{seq}")),
            &(conv, input),
            |b, (conv, input)| {
                b.iter(|| black_box(conv.forward(black_box(input), &policy).expect("forward")));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_linear, bench_circular_conv);
criterion_main!(benches);
