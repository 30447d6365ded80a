//! Stress tests for MPower
//!
//! Run with: cargo test --release stress -- --ignored

use mpower::*;
use mpower_testdata::{generate_dataset, standard_suite, GeneratorConfig};
use std::time::Instant;

#[test]
#[ignore] // Run manually with --ignored
fn stress_test_full_evaluation() {
    let dataset = generate_dataset(&GeneratorConfig::new().with_seed(2025), &standard_suite(20));
    let samples = dataset.sample_count();

    let mut config = ModelConfig::default();
    config.eval.mode = EvalMode::All;

    let start = Instant::now();
    let evaluation = evaluate(&dataset, &config).unwrap();
    let elapsed = start.elapsed();

    println!(
        "Evaluated {} folds over {} runs ({} samples) in {:?}",
        evaluation.folds.len(),
        dataset.len(),
        samples,
        elapsed
    );

    // Holdout (S2-*) + one per run + one per scenario.
    assert_eq!(evaluation.folds.len(), 3 + 200 + 10);
    assert!(evaluation
        .folds
        .iter()
        .all(|f| f.summary.power_sample_mae_mw.is_finite()));
}

#[test]
#[ignore]
fn stress_test_long_run_soc() {
    let dataset = generate_dataset(&GeneratorConfig::new().with_seed(7), &standard_suite(1));
    let config = ModelConfig::default();
    let fit = fit_power_model(&dataset, &config).unwrap();
    let params = fit.params();

    let iterations = 1_000;
    let start = Instant::now();
    for _ in 0..iterations {
        for run in &fit.runs {
            let soc = simulate_soc(&run.signals, &run.predict(&params), &config.battery);
            assert!(soc.soc.iter().all(|s| (0.0..=1.0).contains(s)));
        }
    }
    let elapsed = start.elapsed();
    let rate = (iterations * fit.runs.len()) as f64 / elapsed.as_secs_f64();

    println!("Simulated {} runs in {:?}", iterations * fit.runs.len(), elapsed);
    println!("Rate: {:.0} runs/second", rate);
}
