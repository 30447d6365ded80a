// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Power model fitter
//!
//! Two stages:
//!
//! 1. Per run, fit the thermal model and simulate the leak temperature.
//! 2. Pool the runs and fit `P = p_base + k_screen·screen + k_cpu·cpu +
//!    k_leak·exp(γ (T_leak - T_ref))` by Huber IRLS on samples where every
//!    optional subsystem is ON.
//!
//! Subsystem OFF offsets are not regressed. Each is the mean residual of a
//! run with the subsystem OFF minus that of its paired ON run, clamped to
//! ≤ 0. A missing pair leaves the offset at zero.

use crate::config::{ModelConfig, ThermalConfig};
use crate::error::{DegenerateFit, DegenerateReason, FitOutcome, FitResult, MpowerError, Result};
use crate::features::FeatureSet;
use crate::regression::HuberIrls;
use crate::sample::{median, scenario_family, Dataset, Run, RunSignals, Subsystem, DEFAULT_TEMPERATURE_C};
use crate::simulate::{simulate_temperature, TemperatureTrajectory};
use crate::thermal::{fit_thermal_logged, ThermalParams, ThermalReport};
use log::{debug, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fitted global power model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerModelParams {
    pub p_base_mw: f64,
    pub k_screen: f64,
    pub k_cpu: f64,
    pub k_leak_mw: f64,
    /// Fixed prior, not fit.
    pub leak_gamma_per_c: f64,
    pub leak_tref_c: f64,
    /// Applied when GPS is OFF; ≤ 0.
    pub k_gps_off_mw: f64,
    /// Applied when cellular is OFF; ≤ 0.
    pub k_cellular_off_mw: f64,
    pub c_eff_mah: f64,
}

impl PowerModelParams {
    /// Constant model predicting `p_base_mw` everywhere.
    pub fn constant(p_base_mw: f64, config: &ModelConfig) -> Self {
        Self {
            p_base_mw,
            k_screen: 0.0,
            k_cpu: 0.0,
            k_leak_mw: 0.0,
            leak_gamma_per_c: config.power.leak_gamma_per_c(),
            leak_tref_c: DEFAULT_TEMPERATURE_C,
            k_gps_off_mw: 0.0,
            k_cellular_off_mw: 0.0,
            c_eff_mah: config.battery.c_eff_mah,
        }
    }

    pub fn leak_feature(&self, leak_temp_c: f64) -> f64 {
        (self.leak_gamma_per_c * (leak_temp_c - self.leak_tref_c)).exp()
    }

    pub fn offset(&self, subsystem: Subsystem) -> f64 {
        match subsystem {
            Subsystem::Gps => self.k_gps_off_mw,
            Subsystem::Cellular => self.k_cellular_off_mw,
        }
    }

    fn set_offset(&mut self, subsystem: Subsystem, value: f64) {
        match subsystem {
            Subsystem::Gps => self.k_gps_off_mw = value,
            Subsystem::Cellular => self.k_cellular_off_mw = value,
        }
    }

    /// Coefficients in [`power_features`] order.
    pub fn base_coefficients(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.p_base_mw, self.k_screen, self.k_cpu, self.k_leak_mw])
    }

    /// Base prediction (all subsystems ON).
    pub fn base_power(&self, row: &PowerRow) -> f64 {
        self.p_base_mw
            + self.k_screen * row.screen_mw
            + self.k_cpu * row.cpu_mw
            + self.k_leak_mw * self.leak_feature(row.leak_temp_c)
    }

    /// Base prediction plus the offsets of subsystems that are OFF.
    pub fn predict(&self, row: &PowerRow) -> f64 {
        let mut p = self.base_power(row);
        if !row.gps_on {
            p += self.k_gps_off_mw;
        }
        if !row.cellular_on {
            p += self.k_cellular_off_mw;
        }
        p
    }
}

/// One sample as seen by the power model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerRow {
    pub screen_mw: f64,
    pub cpu_mw: f64,
    pub leak_temp_c: f64,
    pub gps_on: bool,
    pub cellular_on: bool,
    pub measured_mw: Option<f64>,
}

impl PowerRow {
    pub fn all_on(&self) -> bool {
        self.gps_on && self.cellular_on
    }

    pub fn subsystem_on(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Gps => self.gps_on,
            Subsystem::Cellular => self.cellular_on,
        }
    }
}

/// Base feature set: intercept, screen, CPU and the leakage exponential.
pub fn power_features<'a>(gamma_per_c: f64, tref_c: f64) -> FeatureSet<'a, PowerRow> {
    FeatureSet::new()
        .with_intercept()
        .with("power_screen_mW", |r: &PowerRow| r.screen_mw)
        .with("power_cpu_mW", |r: &PowerRow| r.cpu_mw)
        .with("leak_feat", move |r: &PowerRow| {
            (gamma_per_c * (r.leak_temp_c - tref_c)).exp()
        })
}

/// A run with its cleaned signals, thermal fit and simulated temperatures.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub name: String,
    pub scenario: String,
    pub signals: RunSignals,
    pub thermal: FitResult<ThermalParams>,
    pub temperature: TemperatureTrajectory,
}

impl PreparedRun {
    /// Fit the run's own thermal model and simulate it.
    pub fn new(run: &Run, config: &ModelConfig) -> Self {
        let signals = RunSignals::from_run(run, config.battery.nominal_voltage_v);
        let (params, thermal) = fit_thermal_logged(run.name(), &signals, &config.thermal);
        let temperature = simulate_temperature(&signals, &params, config.thermal.leak_temp_mix);
        Self {
            name: run.name().to_string(),
            scenario: run.scenario().to_string(),
            signals,
            thermal,
            temperature,
        }
    }

    /// Use known thermal parameters instead of fitting.
    pub fn with_thermal(run: &Run, params: ThermalParams, config: &ModelConfig) -> Self {
        let signals = RunSignals::from_run(run, config.battery.nominal_voltage_v);
        let temperature = simulate_temperature(&signals, &params, config.thermal.leak_temp_mix);
        Self {
            name: run.name().to_string(),
            scenario: run.scenario().to_string(),
            signals,
            thermal: Ok(params),
            temperature,
        }
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn thermal_params(&self) -> ThermalParams {
        self.thermal.clone().resolve()
    }

    pub fn thermal_report(&self, thermal: &ThermalConfig) -> ThermalReport {
        ThermalReport::new(&self.name, &self.thermal, thermal.leak_temp_mix)
    }

    pub fn rows(&self) -> Vec<PowerRow> {
        let s = &self.signals;
        (0..s.len())
            .map(|i| PowerRow {
                screen_mw: s.power_screen_mw[i],
                cpu_mw: s.power_cpu_mw[i],
                leak_temp_c: self.temperature.leak_c[i],
                gps_on: s.gps_on[i],
                cellular_on: s.cellular_on[i],
                measured_mw: s.power_total_mw[i],
            })
            .collect()
    }

    /// True when every sample has the subsystem in the given state.
    pub fn subsystem_uniform(&self, subsystem: Subsystem, on: bool) -> bool {
        !self.is_empty() && (0..self.len()).all(|i| self.signals.subsystem_on(subsystem, i) == on)
    }

    /// Mean of `measured - base prediction` over measured samples.
    pub fn mean_base_residual(&self, params: &PowerModelParams) -> Option<f64> {
        let resid: Vec<f64> = self
            .rows()
            .iter()
            .filter_map(|r| r.measured_mw.map(|m| m - params.base_power(r)))
            .collect();
        if resid.is_empty() {
            None
        } else {
            Some(resid.iter().sum::<f64>() / resid.len() as f64)
        }
    }

    /// Per-sample predicted power.
    pub fn predict(&self, params: &PowerModelParams) -> Vec<f64> {
        self.rows().iter().map(|r| params.predict(r)).collect()
    }
}

/// Samples usable for fitting: positive finite interval and measured power.
pub fn fitting_view(run: &Run) -> Run {
    run.filtered(|s| {
        s.dt_s.is_finite() && s.dt_s > 0.0 && s.power_total_mw.map_or(false, f64::is_finite)
    })
}

/// How one subsystem offset was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetCalibration {
    pub subsystem: Subsystem,
    pub off_run: Option<String>,
    pub on_run: Option<String>,
    pub offset_mw: f64,
    /// `explicit`, `family:<name>` or `none`.
    pub source: String,
}

/// Outcome of a power model fit.
#[derive(Debug, Clone)]
pub struct PowerFit {
    pub outcome: FitResult<PowerModelParams>,
    pub runs: Vec<PreparedRun>,
    pub calibrations: Vec<OffsetCalibration>,
    pub n_rows: usize,
    pub n_base_rows: usize,
    pub irls_iterations: usize,
    pub irls_converged: bool,
}

impl PowerFit {
    pub fn params(&self) -> PowerModelParams {
        self.outcome.clone().resolve()
    }

    pub fn is_degenerate(&self) -> bool {
        self.outcome.is_degenerate()
    }

    pub fn thermal_reports(&self, thermal: &ThermalConfig) -> Vec<ThermalReport> {
        self.runs.iter().map(|r| r.thermal_report(thermal)).collect()
    }
}

/// Fit the power model on a set of runs.
pub fn fit_power_model(dataset: &Dataset, config: &ModelConfig) -> Result<PowerFit> {
    let runs: Vec<PreparedRun> = dataset
        .runs()
        .iter()
        .map(fitting_view)
        .filter(|r| !r.is_empty())
        .map(|r| PreparedRun::new(&r, config))
        .collect();
    if runs.is_empty() {
        return Err(MpowerError::EmptyDataset(
            "no samples with positive dt_s and measured power".into(),
        ));
    }

    let leak_temps: Vec<f64> = runs
        .iter()
        .flat_map(|r| r.temperature.leak_c.iter().copied())
        .collect();
    let tref_c = median(&leak_temps).unwrap_or(DEFAULT_TEMPERATURE_C);
    let gamma = config.power.leak_gamma_per_c();

    let rows: Vec<PowerRow> = runs.iter().flat_map(PreparedRun::rows).collect();
    let base_rows: Vec<&PowerRow> = rows.iter().filter(|r| r.all_on()).collect();
    let measured: Vec<f64> = rows.iter().filter_map(|r| r.measured_mw).collect();

    let features = power_features(gamma, tref_c);
    let mut fallback = PowerModelParams::constant(
        measured.iter().sum::<f64>() / measured.len().max(1) as f64,
        config,
    );
    fallback.leak_tref_c = tref_c;

    let mut irls_iterations = 0;
    let mut irls_converged = false;
    let base: FitResult<PowerModelParams> = if base_rows.len() < features.len() {
        Err(DegenerateFit::new(
            DegenerateReason::InsufficientData {
                usable: base_rows.len(),
                required: features.len(),
            },
            fallback,
        ))
    } else {
        let x = features.design(base_rows.iter().copied());
        let y = DVector::from_iterator(
            base_rows.len(),
            base_rows.iter().map(|r| r.measured_mw.unwrap_or(0.0)),
        );
        match HuberIrls::new(&config.power.huber, config.power.ridge).fit(&x, &y) {
            Ok(fit) => {
                irls_iterations = fit.iterations;
                irls_converged = fit.converged;
                Ok(PowerModelParams {
                    p_base_mw: fit.beta[0],
                    k_screen: fit.beta[1],
                    k_cpu: fit.beta[2],
                    k_leak_mw: fit.beta[3],
                    ..fallback
                })
            }
            Err(e) => {
                warn!("power base fit failed ({}), using constant model", e);
                Err(DegenerateFit::new(DegenerateReason::Singular, fallback))
            }
        }
    };

    let (mut params, reason) = match base {
        Ok(p) => (p, None),
        Err(d) => (d.fallback, Some(d.reason)),
    };
    let calibrations = calibrate_offsets(&runs, &params, config);
    for c in &calibrations {
        params.set_offset(c.subsystem, c.offset_mw);
    }

    info!(
        "power model fit on {} runs ({} rows, {} base rows): p_base={:.1} k_screen={:.4} k_cpu={:.4} k_leak={:.1}",
        runs.len(),
        rows.len(),
        base_rows.len(),
        params.p_base_mw,
        params.k_screen,
        params.k_cpu,
        params.k_leak_mw
    );

    Ok(PowerFit {
        outcome: match reason {
            None => Ok(params),
            Some(r) => Err(DegenerateFit::new(r, params)),
        },
        n_rows: rows.len(),
        n_base_rows: base_rows.len(),
        runs,
        calibrations,
        irls_iterations,
        irls_converged,
    })
}

/// Resolve the OFF/ON pair of each subsystem and compute its offset.
fn calibrate_offsets(
    runs: &[PreparedRun],
    params: &PowerModelParams,
    config: &ModelConfig,
) -> Vec<OffsetCalibration> {
    let by_name: BTreeMap<&str, &PreparedRun> = runs.iter().map(|r| (r.name.as_str(), r)).collect();

    Subsystem::ALL
        .iter()
        .map(|&subsystem| {
            let explicit = config
                .power
                .calibration
                .iter()
                .find(|p| p.subsystem == subsystem);
            let (pair, source) = match explicit {
                Some(p) => (
                    Some((p.off_run.clone(), p.on_run.clone())),
                    "explicit".to_string(),
                ),
                None => match discover_pair(runs, subsystem) {
                    Some((family, off, on)) => (Some((off, on)), format!("family:{}", family)),
                    None => (None, "none".to_string()),
                },
            };

            let residuals = pair.as_ref().and_then(|(off, on)| {
                let r_off = by_name.get(off.as_str())?.mean_base_residual(params)?;
                let r_on = by_name.get(on.as_str())?.mean_base_residual(params)?;
                Some((r_off, r_on))
            });

            match residuals {
                Some((r_off, r_on)) => {
                    let offset_mw = (r_off - r_on).min(0.0);
                    debug!(
                        "{} offset {:.1} mW from {} ({:?})",
                        subsystem.as_str(),
                        offset_mw,
                        source,
                        pair
                    );
                    let (off_run, on_run) = pair.unzip();
                    OffsetCalibration {
                        subsystem,
                        off_run,
                        on_run,
                        offset_mw,
                        source,
                    }
                }
                None => {
                    warn!(
                        "no calibration pair for {} offset; no correction applied",
                        subsystem.as_str()
                    );
                    OffsetCalibration {
                        subsystem,
                        off_run: None,
                        on_run: None,
                        offset_mw: 0.0,
                        source: "none".to_string(),
                    }
                }
            }
        })
        .collect()
}

/// First scenario family holding both a run with the subsystem OFF throughout
/// and one with it ON throughout. Returns `(family, off_run, on_run)`.
pub fn discover_pair(runs: &[PreparedRun], subsystem: Subsystem) -> Option<(String, String, String)> {
    let mut families: BTreeMap<&str, Vec<&PreparedRun>> = BTreeMap::new();
    for r in runs {
        families.entry(scenario_family(&r.scenario)).or_default().push(r);
    }
    families.into_iter().find_map(|(family, mut members)| {
        members.sort_by(|a, b| a.name.cmp(&b.name));
        let off = members.iter().find(|r| r.subsystem_uniform(subsystem, false))?;
        let on = members.iter().find(|r| r.subsystem_uniform(subsystem, true))?;
        Some((family.to_string(), off.name.clone(), on.name.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationPair;
    use crate::sample::Sample;
    use approx::assert_relative_eq;

    fn run(name: &str, scenario: &str, n: usize, gps: bool, f: impl Fn(usize) -> (f64, f64)) -> Run {
        let samples = (0..n)
            .map(|i| {
                let (screen, cpu) = f(i);
                Sample {
                    t_s: i as f64,
                    dt_s: 1.0,
                    soc_pct: Some(90.0),
                    voltage_mv: Some(4000.0),
                    temperature_cpu_c: Some(35.0),
                    power_screen_mw: Some(screen),
                    power_cpu_mw: Some(cpu),
                    power_total_mw: Some(500.0 + 2.0 * screen + 0.5 * cpu + if gps { 0.0 } else { -80.0 }),
                    is_gps_on: Some(gps),
                    cellular_on: Some(true),
                    ..Default::default()
                }
            })
            .collect();
        Run::new(name, scenario, samples)
    }

    fn config() -> ModelConfig {
        let mut c = ModelConfig::default();
        c.power.ridge = 1e-6;
        c
    }

    #[test]
    fn test_fit_recovers_linear_power() {
        let ds = Dataset::new(vec![
            run("a", "S1", 60, true, |i| ((i % 7) as f64 * 100.0, (i % 5) as f64 * 300.0)),
            run("b", "S2", 60, true, |i| ((i % 3) as f64 * 150.0, (i % 4) as f64 * 200.0)),
        ]);
        let fit = fit_power_model(&ds, &config()).unwrap();
        let p = fit.params();
        assert!(!fit.is_degenerate());
        assert_relative_eq!(p.k_screen, 2.0, epsilon = 1e-3);
        assert_relative_eq!(p.k_cpu, 0.5, epsilon = 1e-3);
        // Constant temperature: leak feature is collinear with the intercept.
        assert_relative_eq!(p.p_base_mw + p.k_leak_mw, 500.0, epsilon = 1e-2);
        assert_eq!(p.k_gps_off_mw, 0.0);
    }

    #[test]
    fn test_gps_offset_from_discovered_pair() {
        let pattern = |i: usize| ((i % 6) as f64 * 120.0, (i % 4) as f64 * 250.0);
        let ds = Dataset::new(vec![
            run("s4_off", "S4", 40, false, pattern),
            run("s4_on", "S4-1", 40, true, pattern),
            run("s1", "S1", 40, true, |i| ((i % 5) as f64 * 90.0, (i % 3) as f64 * 400.0)),
        ]);
        let fit = fit_power_model(&ds, &config()).unwrap();
        let p = fit.params();
        assert_relative_eq!(p.k_gps_off_mw, -80.0, epsilon = 1e-6);
        let gps = &fit.calibrations[0];
        assert_eq!(gps.source, "family:S4");
        assert_eq!(gps.off_run.as_deref(), Some("s4_off"));
        // No cellular-off run anywhere.
        assert_eq!(p.k_cellular_off_mw, 0.0);
        assert_eq!(fit.calibrations[1].source, "none");
    }

    #[test]
    fn test_offset_never_positive() {
        let pattern = |i: usize| ((i % 6) as f64 * 120.0, (i % 4) as f64 * 250.0);
        let mut off = run("off", "S4", 40, false, pattern);
        // OFF run draws more than the ON run.
        off = Run::new(
            "off",
            "S4",
            off.samples()
                .iter()
                .cloned()
                .map(|mut s| {
                    s.power_total_mw = s.power_total_mw.map(|p| p + 200.0);
                    s
                })
                .collect(),
        );
        let ds = Dataset::new(vec![off, run("on", "S4-1", 40, true, pattern)]);
        let fit = fit_power_model(&ds, &config()).unwrap();
        assert_eq!(fit.params().k_gps_off_mw, 0.0);
    }

    #[test]
    fn test_explicit_pair_missing_gives_zero() {
        let mut c = config();
        c.power.calibration.push(CalibrationPair {
            subsystem: Subsystem::Gps,
            off_run: "nope".into(),
            on_run: "a".into(),
        });
        let ds = Dataset::new(vec![run("a", "S1", 40, true, |i| (i as f64, 0.0))]);
        let fit = fit_power_model(&ds, &c).unwrap();
        assert_eq!(fit.params().k_gps_off_mw, 0.0);
        assert_eq!(fit.calibrations[0].source, "none");
    }

    #[test]
    fn test_no_base_rows_is_degenerate() {
        let ds = Dataset::new(vec![run("off", "S4", 40, false, |i| (i as f64, 0.0))]);
        let fit = fit_power_model(&ds, &config()).unwrap();
        assert!(fit.is_degenerate());
        let p = fit.params();
        assert_eq!(p.k_screen, 0.0);
        assert!(p.p_base_mw > 0.0);
    }

    #[test]
    fn test_empty_dataset_is_error() {
        let ds = Dataset::new(vec![]);
        assert!(matches!(
            fit_power_model(&ds, &config()),
            Err(MpowerError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_predict_applies_offsets() {
        let mut p = PowerModelParams::constant(1000.0, &ModelConfig::default());
        p.k_gps_off_mw = -50.0;
        p.k_cellular_off_mw = -20.0;
        let row = PowerRow {
            screen_mw: 0.0,
            cpu_mw: 0.0,
            leak_temp_c: 40.0,
            gps_on: false,
            cellular_on: false,
            measured_mw: None,
        };
        assert_eq!(p.predict(&row), 930.0);
        assert_eq!(p.predict(&PowerRow { gps_on: true, cellular_on: true, ..row }), 1000.0);
    }

    #[test]
    fn test_base_power_matches_feature_set() {
        let mut p = PowerModelParams::constant(300.0, &ModelConfig::default());
        p.k_screen = 1.5;
        p.k_cpu = 0.8;
        p.k_leak_mw = 40.0;
        let row = PowerRow {
            screen_mw: 200.0,
            cpu_mw: 900.0,
            leak_temp_c: 47.0,
            gps_on: true,
            cellular_on: true,
            measured_mw: None,
        };
        let features = power_features(p.leak_gamma_per_c, p.leak_tref_c);
        assert_relative_eq!(
            p.base_power(&row),
            features.predict(&row, &p.base_coefficients()),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_leak_feature_doubles() {
        let p = PowerModelParams::constant(0.0, &ModelConfig::default());
        assert_relative_eq!(p.leak_feature(p.leak_tref_c + 10.0), 2.0, epsilon = 1e-12);
        assert_relative_eq!(p.leak_feature(p.leak_tref_c), 1.0);
    }
}
