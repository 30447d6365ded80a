// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Evaluation harness
//!
//! Repeats the thermal + power fit on a training partition and scores the
//! held-out runs. Each fold refits the power model on its own training runs;
//! thermal parameters of a held-out run come from that run's own signal.
//! Folds are independent and a degenerate fold is scored on its fallback
//! parameters rather than aborting the evaluation.

use crate::artifact::FlatParams;
use crate::config::{BatteryConfig, EvalMode, ModelConfig};
use crate::error::{MpowerError, Result};
use crate::metrics::{finite_mean, ErrorSummary};
use crate::power::{fit_power_model, PowerFit, PowerModelParams, PreparedRun};
use crate::sample::{Dataset, Run};
use crate::simulate::{simulate_soc, soc_mape_pct, soc_rmse_pct, SocTrajectory};
use crate::table::{write_rows, write_table};
use crate::thermal::ThermalReport;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// A named held-out partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSpec {
    pub name: String,
    pub test_runs: BTreeSet<String>,
}

/// Folds of a partitioning mode over a dataset, in deterministic order.
pub fn partition(dataset: &Dataset, mode: EvalMode, holdout_prefix: &str) -> Vec<FoldSpec> {
    let by_scenario = |scenario: &str| FoldSpec {
        name: String::new(),
        test_runs: dataset
            .runs()
            .iter()
            .filter(|r| r.scenario() == scenario)
            .map(|r| r.name().to_string())
            .collect(),
    };

    let holdout = || {
        dataset
            .scenarios()
            .into_iter()
            .filter(|s| s.starts_with(holdout_prefix))
            .map(|s| FoldSpec {
                name: format!("{}_HOLDOUT:{}", holdout_prefix, s),
                ..by_scenario(&s)
            })
            .collect::<Vec<_>>()
    };
    let loro = || {
        dataset
            .runs()
            .iter()
            .map(|r| FoldSpec {
                name: format!("LORO:{}", r.name()),
                test_runs: std::iter::once(r.name().to_string()).collect(),
            })
            .collect::<Vec<_>>()
    };
    let loso = || {
        dataset
            .scenarios()
            .into_iter()
            .map(|s| FoldSpec {
                name: format!("LOSO:{}", s),
                ..by_scenario(&s)
            })
            .collect::<Vec<_>>()
    };

    match mode {
        EvalMode::ScenarioHoldout => holdout(),
        EvalMode::LeaveOneRunOut => loro(),
        EvalMode::LeaveOneScenarioOut => loso(),
        EvalMode::All => {
            let mut folds = holdout();
            folds.extend(loro());
            folds.extend(loso());
            folds
        }
    }
}

/// Held-out run metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub split: String,
    pub run_name: String,
    pub scenario: String,
    pub n_samples: usize,
    pub p_meas_mean_mw: f64,
    pub p_pred_mean_mw: f64,
    pub p_rel_err_pct: f64,
    pub rmse_soc_pct: f64,
}

/// One fold's summary row.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldSummary {
    pub split: String,
    pub n_train_runs: usize,
    pub n_train_samples: usize,
    pub n_test_samples: usize,
    pub n_test_runs: usize,
    pub power_sample_mae_mw: f64,
    /// True when the fold's power model is a fallback.
    pub degenerate: bool,
    pub params: PowerModelParams,
}

/// A completed fold.
#[derive(Debug, Clone)]
pub struct EvaluationFold {
    pub spec: FoldSpec,
    pub train_runs: Vec<String>,
    pub summary: FoldSummary,
    pub runs: Vec<RunMetrics>,
}

/// Predicted power and simulated SOC of one run.
#[derive(Debug, Clone)]
pub struct RunPrediction {
    pub prepared: PreparedRun,
    /// Base prediction, all subsystems ON.
    pub base_mw: Vec<f64>,
    pub power_mw: Vec<f64>,
    pub soc: SocTrajectory,
}

impl RunPrediction {
    pub fn new(prepared: PreparedRun, params: &PowerModelParams, battery: &BatteryConfig) -> Self {
        let rows = prepared.rows();
        let base_mw = rows.iter().map(|r| params.base_power(r)).collect();
        let power_mw: Vec<f64> = rows.iter().map(|r| params.predict(r)).collect();
        let battery = BatteryConfig {
            c_eff_mah: params.c_eff_mah,
            ..battery.clone()
        };
        let soc = simulate_soc(&prepared.signals, &power_mw, &battery);
        Self {
            prepared,
            base_mw,
            power_mw,
            soc,
        }
    }

    /// Fit the run's own thermal model, then predict.
    pub fn for_run(run: &Run, params: &PowerModelParams, config: &ModelConfig) -> Self {
        Self::new(PreparedRun::new(run, config), params, &config.battery)
    }

    /// `measured - predicted` per sample; `None` where power is unmeasured.
    pub fn residuals(&self) -> Vec<Option<f64>> {
        self.prepared
            .signals
            .power_total_mw
            .iter()
            .zip(&self.power_mw)
            .map(|(m, p)| m.map(|m| m - p))
            .collect()
    }

    pub fn measured_mean_mw(&self) -> f64 {
        let m: Vec<f64> = self.prepared.signals.power_total_mw.iter().flatten().copied().collect();
        finite_mean(&m)
    }

    pub fn predicted_mean_mw(&self) -> f64 {
        finite_mean(&self.power_mw)
    }

    pub fn metrics(&self, split: &str) -> RunMetrics {
        let p_meas = self.measured_mean_mw();
        let p_pred = self.predicted_mean_mw();
        let p_rel_err_pct = if p_meas.is_finite() && p_meas != 0.0 {
            (p_pred - p_meas) / p_meas * 100.0
        } else {
            f64::NAN
        };
        RunMetrics {
            split: split.to_string(),
            run_name: self.prepared.name.clone(),
            scenario: self.prepared.scenario.clone(),
            n_samples: self.prepared.len(),
            p_meas_mean_mw: p_meas,
            p_pred_mean_mw: p_pred,
            p_rel_err_pct,
            rmse_soc_pct: soc_rmse_pct(&self.prepared.signals, &self.soc),
        }
    }

    /// Per-sample dump rows.
    pub fn sample_rows(&self) -> Vec<SampleDump> {
        let s = &self.prepared.signals;
        let t = &self.prepared.temperature;
        (0..s.len())
            .map(|i| SampleDump {
                run_name: self.prepared.name.clone(),
                t_s: s.t_s[i],
                dt_s: s.dt_s[i],
                soc_pct: s.soc_meas[i].map(|f| f * 100.0),
                soc_sim_pct: self.soc.soc[i] * 100.0,
                temp_cpu_hat_c: t.cpu_c[i],
                temp_batt_hat_c: t.batt_c.as_ref().map(|b| b[i]),
                temp_leak_hat_c: t.leak_c[i],
                power_total_mw: s.power_total_mw[i],
                p0_pred_mw: self.base_mw[i],
                power_pred_mw: self.power_mw[i],
                resid0_mw: s.power_total_mw[i].map(|m| m - self.base_mw[i]),
                is_gps_on: s.gps_on[i],
                cellular_on: s.cellular_on[i],
            })
            .collect()
    }
}

/// One row of the per-sample prediction dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleDump {
    pub run_name: String,
    pub t_s: f64,
    pub dt_s: f64,
    pub soc_pct: Option<f64>,
    pub soc_sim_pct: f64,
    pub temp_cpu_hat_c: f64,
    pub temp_batt_hat_c: Option<f64>,
    pub temp_leak_hat_c: f64,
    pub power_total_mw: Option<f64>,
    pub p0_pred_mw: f64,
    pub power_pred_mw: f64,
    pub resid0_mw: Option<f64>,
    pub is_gps_on: bool,
    pub cellular_on: bool,
}

/// Fit on everything outside `spec` and score the runs inside it.
pub fn evaluate_fold(dataset: &Dataset, spec: &FoldSpec, config: &ModelConfig) -> EvaluationFold {
    let train = dataset.select(|r| !spec.test_runs.contains(r.name()));
    let test = dataset.select(|r| spec.test_runs.contains(r.name()));

    let (params, degenerate) = match fit_power_model(&train, config) {
        Ok(fit) => (fit.params(), fit.is_degenerate()),
        Err(e) => {
            warn!("{}: no training fit ({}); scoring a zero model", spec.name, e);
            (PowerModelParams::constant(0.0, config), true)
        }
    };

    let predictions: Vec<RunPrediction> = test
        .runs()
        .iter()
        .map(|r| RunPrediction::for_run(r, &params, config))
        .collect();

    let errors: Vec<f64> = predictions
        .iter()
        .flat_map(|p| p.residuals().into_iter().flatten())
        .collect();
    let mae = ErrorSummary::from_residuals(&errors).mae;
    let runs: Vec<RunMetrics> = predictions.iter().map(|p| p.metrics(&spec.name)).collect();

    debug!(
        "{}: {} train runs, {} test runs, mae={:.1} mW",
        spec.name,
        train.len(),
        test.len(),
        mae
    );

    EvaluationFold {
        spec: spec.clone(),
        train_runs: train.runs().iter().map(|r| r.name().to_string()).collect(),
        summary: FoldSummary {
            split: spec.name.clone(),
            n_train_runs: train.len(),
            n_train_samples: train.sample_count(),
            n_test_samples: test.sample_count(),
            n_test_runs: test.len(),
            power_sample_mae_mw: mae,
            degenerate,
            params,
        },
        runs,
    }
}

/// Results of a cross-validation.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub folds: Vec<EvaluationFold>,
}

impl Evaluation {
    pub fn run_metrics(&self) -> Vec<RunMetrics> {
        self.folds.iter().flat_map(|f| f.runs.iter().cloned()).collect()
    }

    /// Write one summary row per fold with the flattened parameters.
    pub fn write_summary(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut header: Vec<String> = [
            "split",
            "n_train_runs",
            "n_train_samples",
            "n_test_samples",
            "n_test_runs",
            "power_sample_mae_mW",
            "degenerate",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let param_keys: Vec<String> = match self.folds.first() {
            Some(f) => f.summary.params.to_record().keys().cloned().collect(),
            None => Vec::new(),
        };
        header.extend(param_keys.iter().map(|k| format!("param_{}", k)));

        let rows: Vec<Vec<String>> = self
            .folds
            .iter()
            .map(|f| {
                let s = &f.summary;
                let record = s.params.to_record();
                let mut row = vec![
                    s.split.clone(),
                    s.n_train_runs.to_string(),
                    s.n_train_samples.to_string(),
                    s.n_test_samples.to_string(),
                    s.n_test_runs.to_string(),
                    s.power_sample_mae_mw.to_string(),
                    s.degenerate.to_string(),
                ];
                row.extend(param_keys.iter().map(|k| record[k].to_string()));
                row
            })
            .collect();
        write_table(path, &header, &rows)
    }

    pub fn write_run_metrics(&self, path: impl AsRef<Path>) -> Result<()> {
        write_rows(path, &self.run_metrics())
    }
}

/// Cross-validate the model over the configured partitioning.
pub fn evaluate(dataset: &Dataset, config: &ModelConfig) -> Result<Evaluation> {
    let eval_set = dataset.for_evaluation(config.eval.min_run_samples);
    if eval_set.is_empty() {
        return Err(MpowerError::EmptyDataset(format!(
            "no run has at least {} samples with measured power",
            config.eval.min_run_samples
        )));
    }
    let specs = partition(&eval_set, config.eval.mode, &config.eval.holdout_prefix);
    info!(
        "evaluating {} folds over {} runs ({:?})",
        specs.len(),
        eval_set.len(),
        config.eval.mode
    );

    let folds = specs
        .iter()
        .map(|spec| evaluate_fold(&eval_set, spec, config))
        .collect();
    Ok(Evaluation { folds })
}

/// Full-data validation row of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunValidation {
    pub run_name: String,
    pub scenario: String,
    pub n_samples: usize,
    pub duration_s: f64,
    pub soc_initial_pct: f64,
    pub soc_final_meas_pct: f64,
    pub soc_final_sim_pct: f64,
    pub rmse_soc_pct: f64,
    pub mape_soc_pct: f64,
    pub p_meas_mean_mw: f64,
    pub p_pred_mean_mw: f64,
}

/// Full-data fit together with its in-sample validation.
#[derive(Debug, Clone)]
pub struct Validation {
    pub fit: PowerFit,
    pub predictions: Vec<RunPrediction>,
    pub runs: Vec<RunValidation>,
}

impl Validation {
    pub fn thermal_reports(&self, config: &ModelConfig) -> Vec<ThermalReport> {
        self.fit.thermal_reports(&config.thermal)
    }

    pub fn sample_rows(&self) -> Vec<SampleDump> {
        self.predictions.iter().flat_map(RunPrediction::sample_rows).collect()
    }
}

/// Fit on the whole dataset and validate every fitted run in-sample. Runs
/// without SOC readings are predicted but get no validation row.
pub fn validate(dataset: &Dataset, config: &ModelConfig) -> Result<Validation> {
    let fit = fit_power_model(dataset, config)?;
    let params = fit.params();

    let predictions: Vec<RunPrediction> = fit
        .runs
        .iter()
        .cloned()
        .map(|r| RunPrediction::new(r, &params, &config.battery))
        .collect();

    let runs = predictions
        .iter()
        .filter_map(|p| {
            let signals = &p.prepared.signals;
            let meas: Vec<f64> = signals.soc_meas.iter().flatten().copied().collect();
            let first = *meas.first()?;
            let last = *meas.last()?;
            Some(RunValidation {
                run_name: p.prepared.name.clone(),
                scenario: p.prepared.scenario.clone(),
                n_samples: p.prepared.len(),
                duration_s: signals
                    .dt_s
                    .iter()
                    .filter(|dt| dt.is_finite() && **dt > 0.0)
                    .sum(),
                soc_initial_pct: first * 100.0,
                soc_final_meas_pct: last * 100.0,
                soc_final_sim_pct: p.soc.last().unwrap_or(f64::NAN) * 100.0,
                rmse_soc_pct: soc_rmse_pct(signals, &p.soc),
                mape_soc_pct: soc_mape_pct(signals, &p.soc),
                p_meas_mean_mw: p.measured_mean_mw(),
                p_pred_mean_mw: p.predicted_mean_mw(),
            })
        })
        .collect();

    Ok(Validation {
        fit,
        predictions,
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;

    fn run(name: &str, scenario: &str, n: usize, level: f64) -> Run {
        let samples = (0..n)
            .map(|i| Sample {
                t_s: i as f64,
                dt_s: 1.0,
                soc_pct: Some(80.0),
                voltage_mv: Some(3900.0),
                temperature_cpu_c: Some(35.0),
                power_screen_mw: Some(level),
                power_cpu_mw: Some(((i % 5) * 100) as f64),
                power_total_mw: Some(400.0 + level + ((i % 5) * 50) as f64),
                is_gps_on: Some(true),
                cellular_on: Some(true),
                ..Default::default()
            })
            .collect();
        Run::new(name, scenario, samples)
    }

    fn dataset() -> Dataset {
        Dataset::new(vec![
            run("r1", "S1", 40, 100.0),
            run("r2", "S2-25", 40, 200.0),
            run("r3", "S2-50", 40, 300.0),
            run("r4", "S2-50", 40, 310.0),
            run("r5", "S3", 40, 150.0),
        ])
    }

    #[test]
    fn test_partition_modes() {
        let ds = dataset();
        let holdout = partition(&ds, EvalMode::ScenarioHoldout, "S2");
        assert_eq!(holdout.len(), 2);
        assert_eq!(holdout[1].name, "S2_HOLDOUT:S2-50");
        assert_eq!(holdout[1].test_runs.len(), 2);

        let loso = partition(&ds, EvalMode::LeaveOneScenarioOut, "S2");
        assert_eq!(loso.len(), 4);

        let all = partition(&ds, EvalMode::All, "S2");
        assert_eq!(all.len(), 2 + 5 + 4);
    }

    #[test]
    fn test_loro_folds_are_disjoint() {
        let mut config = ModelConfig::default();
        config.eval.mode = EvalMode::LeaveOneRunOut;
        let eval = evaluate(&dataset(), &config).unwrap();
        assert_eq!(eval.folds.len(), 5);
        for fold in &eval.folds {
            assert_eq!(fold.spec.test_runs.len(), 1);
            assert_eq!(fold.train_runs.len(), 4);
            let test = fold.spec.test_runs.iter().next().unwrap();
            assert!(!fold.train_runs.contains(test));
            assert_eq!(fold.runs.len(), 1);
        }
    }

    #[test]
    fn test_single_scenario_loso_is_degenerate_not_error() {
        let ds = Dataset::new(vec![run("a", "S1", 40, 100.0), run("b", "S1", 40, 120.0)]);
        let mut config = ModelConfig::default();
        config.eval.mode = EvalMode::LeaveOneScenarioOut;
        let eval = evaluate(&ds, &config).unwrap();
        assert_eq!(eval.folds.len(), 1);
        assert!(eval.folds[0].summary.degenerate);
        assert_eq!(eval.folds[0].summary.n_train_runs, 0);
    }

    #[test]
    fn test_short_runs_dropped() {
        let ds = Dataset::new(vec![run("a", "S1", 10, 100.0)]);
        assert!(matches!(
            evaluate(&ds, &ModelConfig::default()),
            Err(MpowerError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_validation_rows() {
        let v = validate(&dataset(), &ModelConfig::default()).unwrap();
        assert_eq!(v.runs.len(), 5);
        let r = &v.runs[0];
        assert_eq!(r.n_samples, 40);
        assert_eq!(r.duration_s, 40.0);
        assert_eq!(r.soc_initial_pct, 80.0);
        assert!(r.soc_final_sim_pct < 80.0);
        assert_eq!(v.sample_rows().len(), 200);
        assert_eq!(v.thermal_reports(&ModelConfig::default()).len(), 5);
    }

    #[test]
    fn test_summary_table_written() {
        let mut config = ModelConfig::default();
        config.eval.mode = EvalMode::LeaveOneScenarioOut;
        let eval = evaluate(&dataset(), &config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        eval.write_summary(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.starts_with("split,n_train_runs"));
        assert!(header.contains("param_k_gps_off_mW"));
        assert_eq!(text.lines().count(), 5);

        let runs_path = dir.path().join("runs.csv");
        eval.write_run_metrics(&runs_path).unwrap();
        assert_eq!(std::fs::read_to_string(&runs_path).unwrap().lines().count(), 6);
    }
}
