//! Benchmarks for MPower fitting and cross-validation

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mpower::{evaluate, fit_power_model, simulate_soc, EvalMode, ModelConfig, ThermalModelKind};
use mpower_testdata::{generate_dataset, standard_suite, GeneratorConfig};

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit");

    let dataset = generate_dataset(&GeneratorConfig::new().with_seed(1), &standard_suite(2));
    group.throughput(Throughput::Elements(dataset.sample_count() as u64));

    let one_state = ModelConfig::default();
    group.bench_function("power_model_1state", |b| {
        b.iter(|| black_box(fit_power_model(&dataset, &one_state).unwrap()))
    });

    let mut two_state = ModelConfig::default();
    two_state.thermal.model = ThermalModelKind::TwoState;
    group.bench_function("power_model_2state", |b| {
        b.iter(|| black_box(fit_power_model(&dataset, &two_state).unwrap()))
    });

    group.finish();
}

fn bench_simulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulate");

    let dataset = generate_dataset(&GeneratorConfig::new().with_seed(2), &standard_suite(1));
    let config = ModelConfig::default();
    let fit = fit_power_model(&dataset, &config).unwrap();
    let params = fit.params();
    let predictions: Vec<Vec<f64>> = fit.runs.iter().map(|r| r.predict(&params)).collect();

    group.throughput(Throughput::Elements(dataset.sample_count() as u64));
    group.bench_function("soc_suite", |b| {
        b.iter(|| {
            for (run, power) in fit.runs.iter().zip(&predictions) {
                black_box(simulate_soc(&run.signals, power, &config.battery));
            }
        })
    });

    group.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    group.sample_size(10);

    let dataset = generate_dataset(&GeneratorConfig::new().with_seed(3), &standard_suite(2));
    for (name, mode) in [
        ("loso", EvalMode::LeaveOneScenarioOut),
        ("loro", EvalMode::LeaveOneRunOut),
    ] {
        let mut config = ModelConfig::default();
        config.eval.mode = mode;
        group.bench_function(name, |b| {
            b.iter(|| black_box(evaluate(&dataset, &config).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fit, bench_simulate, bench_evaluate);
criterion_main!(benches);
