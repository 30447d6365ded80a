// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Secondary correction-term experiments
//!
//! Run-level experiments on top of an evaluation: each variant learns an
//! additive correction to the predicted mean power of a run from the runs of
//! the other scenarios, and is scored leave-one-scenario-out. The acceptance
//! signal is the residual error and the residual-covariate correlation before
//! and after correction, not a hard pass/fail.
//!
//! Variants:
//!
//! - [`i2r`]: I²R conduction loss with a parametric internal resistance
//! - [`leak_bg`]: voltage-scaled leakage and constant background draw
//! - [`ancova`]: scenario dummies plus start-state covariates, and the
//!   full-data adjusted-means report
//! - [`covariate`]: signed residual on start-state covariates

pub mod ancova;
pub mod covariate;
pub mod i2r;
pub mod leak_bg;

use crate::config::{CorrectionConfig, ModelConfig, TempSource};
use crate::error::Result;
use crate::eval::RunMetrics;
use crate::features::FeatureSet;
use crate::metrics::{finite_mean, CovariateCorrelation, ErrorSummary};
use crate::regression::{clamp_nonnegative, fit_nonnegative_scale, ridge_solve};
use crate::sample::{Dataset, Run, RunSignals};
use crate::table::write_rows;
use log::{debug, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Below this squared current (A²) a run is treated as not discharging.
pub const MIN_CURRENT_SQ: f64 = 1e-8;

/// One evaluated run reduced to its means and start-state covariates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_name: String,
    pub scenario: String,
    pub p_meas_mean_mw: f64,
    pub p_pred_mean_mw: f64,
    /// Initial SOC fraction; NaN when never reported.
    pub soc0: f64,
    pub voltage_mean_v: f64,
    /// Mean discharge current derived from measured power and voltage.
    pub current_mean_a: f64,
    pub temp_cpu_c: f64,
    pub temp_batt_c: f64,
}

impl RunRecord {
    /// Reduce a run. Temperatures follow `temp_source`; absent signals are NaN.
    pub fn from_run(
        run: &Run,
        p_meas_mean_mw: f64,
        p_pred_mean_mw: f64,
        temp_source: TempSource,
        nominal_voltage_v: f64,
    ) -> Self {
        let s = RunSignals::from_run(run, nominal_voltage_v);
        let temp = |series: &Option<Vec<f64>>| match (series, temp_source) {
            (Some(v), TempSource::Start) => v.first().copied().unwrap_or(f64::NAN),
            (Some(v), TempSource::Mean) => finite_mean(v),
            (None, _) => f64::NAN,
        };
        let currents: Vec<f64> = s
            .power_total_mw
            .iter()
            .zip(&s.voltage_v)
            .filter_map(|(p, v)| p.map(|p| (p / 1000.0 / v).abs()))
            .collect();
        Self {
            run_name: run.name().to_string(),
            scenario: run.scenario().to_string(),
            p_meas_mean_mw,
            p_pred_mean_mw,
            soc0: s.initial_soc().unwrap_or(f64::NAN),
            voltage_mean_v: finite_mean(&s.voltage_v),
            current_mean_a: finite_mean(&currents),
            temp_cpu_c: temp(&s.temp_cpu_c),
            temp_batt_c: temp(&s.temp_batt_c),
        }
    }

    /// `measured - predicted` mean power (mW).
    pub fn resid_mw(&self) -> f64 {
        self.p_meas_mean_mw - self.p_pred_mean_mw
    }

    /// Target of the loss-term fits: the positive part of the residual, in W.
    pub fn positive_resid_w(&self) -> f64 {
        (self.resid_mw() / 1000.0).max(0.0)
    }

    pub fn current_sq(&self) -> f64 {
        self.current_mean_a * self.current_mean_a
    }

    /// Discharging with the loss-term inputs present.
    pub fn discharging(&self) -> bool {
        self.resid_mw().is_finite() && self.current_sq().is_finite() && self.current_sq() > MIN_CURRENT_SQ
    }
}

/// Build run records from held-out run metrics. A run scored by several
/// folds keeps its first prediction.
pub fn run_records(dataset: &Dataset, metrics: &[RunMetrics], config: &ModelConfig) -> Vec<RunRecord> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for m in metrics {
        if !seen.insert(m.run_name.as_str()) {
            continue;
        }
        match dataset.get(&m.run_name) {
            Some(run) => out.push(RunRecord::from_run(
                run,
                m.p_meas_mean_mw,
                m.p_pred_mean_mw,
                config.correction.temp_source,
                config.battery.nominal_voltage_v,
            )),
            None => warn!("run {} has metrics but no samples; skipped", m.run_name),
        }
    }
    out
}

/// Start-state covariates shared by the residual analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    SocPct,
    VoltageV,
    TempCpuC,
    TempBattC,
    CurrentA,
}

impl Covariate {
    /// Regression covariates of the ANCOVA and covariate-correction variants.
    pub const START_STATE: [Covariate; 4] = [
        Covariate::SocPct,
        Covariate::VoltageV,
        Covariate::TempCpuC,
        Covariate::TempBattC,
    ];

    pub const ALL: [Covariate; 5] = [
        Covariate::TempCpuC,
        Covariate::TempBattC,
        Covariate::SocPct,
        Covariate::VoltageV,
        Covariate::CurrentA,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Covariate::SocPct => "soc0_pct",
            Covariate::VoltageV => "voltage_V",
            Covariate::TempCpuC => "thermal_cpu_C",
            Covariate::TempBattC => "thermal_batt_C",
            Covariate::CurrentA => "current_A",
        }
    }

    pub fn value(&self, r: &RunRecord) -> f64 {
        match self {
            Covariate::SocPct => r.soc0 * 100.0,
            Covariate::VoltageV => r.voltage_mean_v,
            Covariate::TempCpuC => r.temp_cpu_c,
            Covariate::TempBattC => r.temp_batt_c,
            Covariate::CurrentA => r.current_mean_a,
        }
    }

    /// Candidates that are finite in every record. A covariate missing from
    /// any run is dropped rather than excluding that run.
    pub fn available(records: &[RunRecord], candidates: &[Covariate]) -> Vec<Covariate> {
        candidates
            .iter()
            .copied()
            .filter(|c| {
                let ok = !records.is_empty() && records.iter().all(|r| c.value(r).is_finite());
                if !ok {
                    debug!("covariate {} not available for every run; dropped", c.name());
                }
                ok
            })
            .collect()
    }
}

/// A correction learned on one training fold.
pub struct FoldModel {
    features: FeatureSet<'static, RunRecord>,
    beta: DVector<f64>,
    /// Added to the linear prediction before scaling.
    offset: f64,
    scale: f64,
    nonnegative: bool,
    /// Unit conversion of the fitted target to mW.
    to_mw: f64,
    pub gamma: Option<f64>,
    pub n_train: usize,
    pub train_rmse_mw: f64,
}

impl FoldModel {
    /// Correction to add to the predicted mean power (mW).
    pub fn predict_mw(&self, r: &RunRecord) -> f64 {
        let raw = (self.features.predict(r, &self.beta) + self.offset) * self.scale;
        let raw = if self.nonnegative { raw.max(0.0) } else { raw };
        raw * self.to_mw
    }

    pub fn coefficients(&self) -> Vec<(String, f64)> {
        self.features
            .names()
            .into_iter()
            .map(str::to_string)
            .zip(self.beta.iter().copied())
            .collect()
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = Some(gamma);
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

/// How a fold solve treats its coefficients and target.
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub ridge: f64,
    /// Clamp coefficients to ≥ 0 and predictions to ≥ 0.
    pub loss_terms: bool,
    /// Rescale the prediction against the unclipped residual.
    pub fit_scale: bool,
}

/// Target of a fold solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// `max(0, resid)` in W.
    PositiveResidualW,
    /// Signed residual in mW.
    ResidualMw,
}

impl Target {
    fn value(&self, r: &RunRecord) -> f64 {
        match self {
            Target::PositiveResidualW => r.positive_resid_w(),
            Target::ResidualMw => r.resid_mw(),
        }
    }

    fn to_mw(&self) -> f64 {
        match self {
            Target::PositiveResidualW => 1000.0,
            Target::ResidualMw => 1.0,
        }
    }
}

/// Solve one fold. `None` when there are fewer than `p + 1` training rows
/// or the system stays singular.
pub fn solve_fold(
    features: FeatureSet<'static, RunRecord>,
    train: &[&RunRecord],
    target: Target,
    options: SolveOptions,
) -> Option<FoldModel> {
    let p = features.len();
    if p == 0 || train.len() < p + 1 {
        return None;
    }
    let x = features.design(train.iter().copied());
    let y = DVector::from_iterator(train.len(), train.iter().map(|r| target.value(r)));
    let mut beta = match ridge_solve(&x, &y, options.ridge) {
        Ok(b) => b,
        Err(e) => {
            warn!("correction fold solve failed: {}", e);
            return None;
        }
    };
    if options.loss_terms {
        clamp_nonnegative(&mut beta);
    }

    let fitted = &x * &beta;
    let train_rmse_mw = ErrorSummary::from_residuals(
        &(&y - &fitted).iter().map(|r| r * target.to_mw()).collect::<Vec<_>>(),
    )
    .rmse;

    let scale = if options.fit_scale {
        // Against the unclipped residual, so over-correction is pulled back.
        let resid: Vec<f64> = train.iter().map(|r| r.resid_mw() / target.to_mw()).collect();
        fit_nonnegative_scale(fitted.as_slice(), &resid)
    } else {
        1.0
    };

    Some(FoldModel {
        features,
        beta,
        offset: 0.0,
        scale,
        nonnegative: options.loss_terms,
        to_mw: target.to_mw(),
        gamma: None,
        n_train: train.len(),
        train_rmse_mw,
    })
}

/// A correction variant evaluated leave-one-scenario-out.
pub trait CorrectionModel {
    /// Label used in reports.
    fn name(&self) -> &'static str;

    /// Whether a run can take part in fitting and receive a correction.
    fn usable(&self, record: &RunRecord) -> bool;

    /// Learn the correction from the training runs.
    fn fit_fold(&self, train: &[&RunRecord]) -> Option<FoldModel>;
}

/// Selectable correction variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionVariant {
    I2r,
    LeakBackground,
    Ancova,
    Covariate,
}

impl CorrectionVariant {
    pub const ALL: [CorrectionVariant; 4] = [
        CorrectionVariant::I2r,
        CorrectionVariant::LeakBackground,
        CorrectionVariant::Ancova,
        CorrectionVariant::Covariate,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i2r" => Some(CorrectionVariant::I2r),
            "leak_bg" | "leak" | "background" => Some(CorrectionVariant::LeakBackground),
            "ancova" => Some(CorrectionVariant::Ancova),
            "covariate" | "cov" => Some(CorrectionVariant::Covariate),
            _ => None,
        }
    }

    /// Instantiate the variant. Covariate-based variants keep only the
    /// covariates every record carries.
    pub fn build(&self, config: &CorrectionConfig, records: &[RunRecord]) -> Box<dyn CorrectionModel> {
        match self {
            CorrectionVariant::I2r => Box::new(i2r::I2rCorrection::new(config)),
            CorrectionVariant::LeakBackground => Box::new(leak_bg::LeakBackgroundCorrection::new(config)),
            CorrectionVariant::Ancova => Box::new(ancova::AncovaCorrection::new(config, records)),
            CorrectionVariant::Covariate => Box::new(covariate::CovariateCorrection::new(config, records)),
        }
    }
}

/// Fold parameters of one held-out scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldParams {
    pub heldout_scenario: String,
    pub fitted: bool,
    pub n_train: usize,
    pub gamma: Option<f64>,
    pub scale: Option<f64>,
    pub train_rmse_mw: Option<f64>,
    /// `name=value` pairs separated by `;`.
    pub coefficients: String,
}

/// One run before and after correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectedRun {
    pub run_name: String,
    pub scenario: String,
    pub p_meas_mean_mw: f64,
    pub p_pred_mean_mw: f64,
    pub correction_mw: f64,
    pub p_pred_corr_mw: f64,
    pub resid_mw: f64,
    pub resid_corr_mw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct SummaryRow {
    metric: String,
    n: usize,
    mae_mw: f64,
    rmse_mw: f64,
    bias_mw: f64,
}

impl SummaryRow {
    fn new(metric: &str, s: &ErrorSummary) -> Self {
        Self {
            metric: metric.to_string(),
            n: s.n,
            mae_mw: s.mae,
            rmse_mw: s.rmse,
            bias_mw: s.bias,
        }
    }
}

/// Outcome of one correction experiment.
#[derive(Debug, Clone)]
pub struct CorrectionReport {
    pub variant: String,
    pub base: ErrorSummary,
    pub corrected: ErrorSummary,
    pub runs: Vec<CorrectedRun>,
    pub folds: Vec<FoldParams>,
    pub correlations: Vec<CovariateCorrelation>,
}

impl CorrectionReport {
    pub fn write_runs(&self, path: impl AsRef<Path>) -> Result<()> {
        write_rows(path, &self.runs)
    }

    pub fn write_summary(&self, path: impl AsRef<Path>) -> Result<()> {
        write_rows(
            path,
            &[
                SummaryRow::new("base", &self.base),
                SummaryRow::new(&format!("{}_corrected", self.variant), &self.corrected),
            ],
        )
    }

    pub fn write_folds(&self, path: impl AsRef<Path>) -> Result<()> {
        write_rows(path, &self.folds)
    }

    pub fn write_correlations(&self, path: impl AsRef<Path>) -> Result<()> {
        write_rows(path, &self.correlations)
    }

    /// Write every table into `dir` as `<variant>_<table>.csv`.
    pub fn write_all(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.write_runs(dir.join(format!("{}_runs.csv", self.variant)))?;
        self.write_summary(dir.join(format!("{}_summary.csv", self.variant)))?;
        self.write_folds(dir.join(format!("{}_folds.csv", self.variant)))?;
        self.write_correlations(dir.join(format!("{}_correlations.csv", self.variant)))
    }
}

/// Evaluate a variant leave-one-scenario-out. Runs the variant cannot use, and
/// held-out scenarios whose fold could not be fit, get a zero correction.
/// With `clip_frac > 0` each correction is capped at `clip_frac · p_meas`.
pub fn evaluate_loso<M: CorrectionModel + ?Sized>(
    model: &M,
    records: &[RunRecord],
    clip_frac: f64,
) -> CorrectionReport {
    let scenarios: BTreeSet<&str> = records.iter().map(|r| r.scenario.as_str()).collect();
    let mut corrections = vec![0.0; records.len()];
    let mut folds = Vec::new();

    for scenario in scenarios {
        let train: Vec<&RunRecord> = records
            .iter()
            .filter(|r| r.scenario != scenario && model.usable(r))
            .collect();
        let fold = model.fit_fold(&train);

        for (i, r) in records.iter().enumerate() {
            if r.scenario != scenario || !model.usable(r) {
                continue;
            }
            let mut c = fold.as_ref().map_or(0.0, |f| f.predict_mw(r));
            if clip_frac > 0.0 {
                c = c.min((clip_frac * r.p_meas_mean_mw).max(0.0));
            }
            corrections[i] = if c.is_finite() { c } else { 0.0 };
        }

        folds.push(match &fold {
            Some(f) => FoldParams {
                heldout_scenario: scenario.to_string(),
                fitted: true,
                n_train: f.n_train,
                gamma: f.gamma,
                scale: Some(f.scale()),
                train_rmse_mw: Some(f.train_rmse_mw),
                coefficients: f
                    .coefficients()
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(";"),
            },
            None => {
                debug!("{}: no fold fit for {}; zero correction", model.name(), scenario);
                FoldParams {
                    heldout_scenario: scenario.to_string(),
                    fitted: false,
                    n_train: train.len(),
                    gamma: None,
                    scale: None,
                    train_rmse_mw: None,
                    coefficients: String::new(),
                }
            }
        });
    }

    let runs: Vec<CorrectedRun> = records
        .iter()
        .zip(&corrections)
        .map(|(r, c)| {
            let p_pred_corr_mw = r.p_pred_mean_mw + c;
            CorrectedRun {
                run_name: r.run_name.clone(),
                scenario: r.scenario.clone(),
                p_meas_mean_mw: r.p_meas_mean_mw,
                p_pred_mean_mw: r.p_pred_mean_mw,
                correction_mw: *c,
                p_pred_corr_mw,
                resid_mw: r.resid_mw(),
                resid_corr_mw: r.p_meas_mean_mw - p_pred_corr_mw,
            }
        })
        .collect();

    let before: Vec<f64> = runs.iter().map(|r| r.resid_mw).collect();
    let after: Vec<f64> = runs.iter().map(|r| r.resid_corr_mw).collect();
    let correlations = Covariate::ALL
        .iter()
        .map(|c| {
            let values: Vec<f64> = records.iter().map(|r| c.value(r)).collect();
            CovariateCorrelation::compute(c.name(), &values, &before, &after)
        })
        .collect();

    let base = ErrorSummary::from_residuals(&before);
    let corrected = ErrorSummary::from_residuals(&after);
    info!("{}", base.report(&format!("{} base", model.name())));
    info!("{}", corrected.report(&format!("{} corrected", model.name())));

    CorrectionReport {
        variant: model.name().to_string(),
        base,
        corrected,
        runs,
        folds,
        correlations,
    }
}
