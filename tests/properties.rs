// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! End-to-end invariants of the fit, simulate and correct chain on synthetic
//! telemetry.

use mpower::correction::{ancova::AncovaCorrection, i2r::I2rCorrection, leak_bg::LeakBackgroundCorrection};
use mpower::eval::RunPrediction;
use mpower::power::{fitting_view, PreparedRun};
use mpower::*;
use mpower_testdata::{generate_dataset, standard_suite, GeneratorConfig};
use std::collections::BTreeSet;
use tempfile::tempdir;

fn suite_dataset(seed: u64, repeats: usize) -> Dataset {
    generate_dataset(&GeneratorConfig::new().with_seed(seed), &standard_suite(repeats))
}

fn two_state() -> ModelConfig {
    let mut config = ModelConfig::default();
    config.thermal.model = ThermalModelKind::TwoState;
    config
}

#[test]
fn test_soc_stays_in_unit_interval() {
    let dataset = suite_dataset(1, 1);
    for mut config in [ModelConfig::default(), two_state()] {
        // A tiny battery drains to empty and exercises the clamp.
        config.battery.c_eff_mah = 5.0;
        let validation = validate(&dataset, &config).unwrap();
        let mut hit_empty = false;
        for p in &validation.predictions {
            assert!(p.soc.soc.iter().all(|s| (0.0..=1.0).contains(s)));
            hit_empty |= p.soc.last() == Some(0.0);
        }
        assert!(hit_empty);
    }
}

#[test]
fn test_thermal_sign_constraints() {
    let dataset = suite_dataset(2, 1);
    for config in [ModelConfig::default(), two_state()] {
        let fit = fit_power_model(&dataset, &config).unwrap();
        for run in &fit.runs {
            match run.thermal_params() {
                ThermalParams::OneState(p) => {
                    assert!(p.a_per_s <= 0.0, "{}: a={}", run.name, p.a_per_s);
                    assert!(p.b_c_per_j >= 0.0);
                }
                ThermalParams::TwoState(p) => {
                    assert!(p.a_cpu_per_s <= 0.0 && p.a_batt_per_s <= 0.0);
                    assert!(p.b_cpu_c_per_j >= 0.0 && p.b_couple_per_s >= 0.0);
                }
            }
        }
    }
}

#[test]
fn test_refit_is_idempotent() {
    let dataset = suite_dataset(3, 1);
    let config = two_state();
    let a = fit_power_model(&dataset, &config).unwrap();
    let b = fit_power_model(&dataset, &config).unwrap();

    assert_eq!(a.params(), b.params());
    assert_eq!(a.calibrations, b.calibrations);
    for (ra, rb) in a.runs.iter().zip(&b.runs) {
        assert_eq!(ra.thermal_params(), rb.thermal_params());
    }
}

#[test]
fn test_artifact_file_replays_bit_for_bit() {
    let dataset = suite_dataset(4, 1);
    let config = two_state();
    let fit = fit_power_model(&dataset, &config).unwrap();
    let params = fit.params();

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.json");
    ModelArtifact::from_fit(&fit, &config).save(&path).unwrap();
    let loaded = ModelArtifact::load(&path).unwrap();
    let loaded_params = loaded.power_params().unwrap();
    assert_eq!(loaded_params, params);

    for prepared in &fit.runs {
        let original = RunPrediction::new(prepared.clone(), &params, &config.battery);
        let run = dataset.runs().iter().find(|r| r.name() == prepared.name).unwrap();
        let thermal = loaded.thermal_params(&prepared.name).unwrap().unwrap();
        let replay = RunPrediction::new(
            PreparedRun::with_thermal(&fitting_view(run), thermal, &config),
            &loaded_params,
            &config.battery,
        );
        assert_eq!(original.power_mw, replay.power_mw);
        assert_eq!(original.soc, replay.soc);
    }
}

#[test]
fn test_loss_term_coefficients_nonnegative() {
    let dataset = suite_dataset(5, 2);
    let mut config = ModelConfig::default();
    config.eval.mode = EvalMode::LeaveOneScenarioOut;
    config.correction.fit_scale = true;
    let evaluation = evaluate(&dataset, &config).unwrap();
    let records = run_records(&dataset, &evaluation.run_metrics(), &config);
    assert_eq!(records.len(), dataset.len());

    let i2r = I2rCorrection::new(&config.correction);
    let leak_bg = LeakBackgroundCorrection::new(&config.correction);
    let models: [&dyn CorrectionModel; 2] = [&i2r, &leak_bg];
    let scenarios: BTreeSet<&str> = records.iter().map(|r| r.scenario.as_str()).collect();

    for model in models {
        for scenario in &scenarios {
            let train: Vec<&RunRecord> = records
                .iter()
                .filter(|r| r.scenario != *scenario && model.usable(r))
                .collect();
            if let Some(fold) = model.fit_fold(&train) {
                for (name, coef) in fold.coefficients() {
                    assert!(coef >= 0.0, "{} {}: {}={}", model.name(), scenario, name, coef);
                }
                assert!(fold.scale() >= 0.0);
            }
        }
        let report = evaluate_loso(model, &records, 0.0);
        assert_eq!(report.folds.len(), scenarios.len());
    }
}

#[test]
fn test_ancova_loso_runs_on_every_scenario() {
    let dataset = suite_dataset(6, 2);
    let mut config = ModelConfig::default();
    config.eval.mode = EvalMode::LeaveOneScenarioOut;
    let evaluation = evaluate(&dataset, &config).unwrap();
    let records = run_records(&dataset, &evaluation.run_metrics(), &config);

    let model = AncovaCorrection::new(&config.correction, &records);
    let report = evaluate_loso(&model, &records, 0.5);
    assert_eq!(report.runs.len(), records.len());
    assert_eq!(report.base.n, records.len());
    for run in &report.runs {
        assert!(run.correction_mw.is_finite());
        assert!(run.correction_mw <= 0.5 * run.p_meas_mean_mw + 1e-9);
    }
}
