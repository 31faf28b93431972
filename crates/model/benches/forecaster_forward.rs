use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use model::{registry::calendar_marks, AttentionForecaster, ForecasterConfig, Informer, InformerConfig};

fn bench_forecaster(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("forecaster/forward");
    for &(seq_len, horizon) in &[(10usize, None), (96, Some(24usize))] {
        let config = ForecasterConfig {
            seq_len,
            output_seq_len: horizon,
            ..ForecasterConfig::new(8)
        };
        let model = AttentionForecaster::new(config, &device, DType::F32).expect("forecaster");
        model.set_training(false);
        let input = Tensor::randn(0f32, 1.0, (32, seq_len, 8), &device).expect("input");
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("seq{seq_len}")),
            &(model, input),
            |b, (model, input)| {
                b.iter(|| black_box(model.forward(black_box(input), None).expect("forward")));
            },
        );
    }
    group.finish();
}

fn bench_informer(c: &mut Criterion) {
    let device = Device::Cpu;
    let config = InformerConfig {
        d_model: 64,
        d_ff: 64,
        n_heads: 4,
        ..InformerConfig::new(7, 7, 1, 96, 48, 24)
    };
    let dec_len = config.decoder_len();
    let model = Informer::new(config, &device, DType::F32).expect("informer");
    model.set_training(false);
    let x_enc = Tensor::randn(0f32, 1.0, (8, 96, 7), &device).expect("x_enc");
    let x_dec = Tensor::randn(0f32, 1.0, (8, dec_len, 7), &device).expect("x_dec");
    let marks_enc = calendar_marks(8, 96, 4, &device).expect("marks");
    let marks_dec = calendar_marks(8, dec_len, 4, &device).expect("marks");
    c.bench_function("informer/forward/prob", |b| {
        b.iter(|| {
            black_box(
                model
                    .forward(&x_enc, &marks_enc, &x_dec, &marks_dec)
                    .expect("forward"),
            )
        })
    });
}

criterion_group!(benches, bench_forecaster, bench_informer);
criterion_main!(benches);
