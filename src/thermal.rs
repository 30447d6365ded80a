// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Thermal state fitter
//!
//! Fits a lumped thermal ODE to one run by regressing finite-difference
//! derivatives on the node's excess temperature and a heat proxy:
//!
//! - one-state: `dT/dt = a (T - T_amb) + b P_heat`
//! - two-state: `dT_cpu/dt = a_cpu (T_cpu - T_batt) + b_cpu P_heat` and
//!   `dT_batt/dt = a_batt (T_batt - T_amb) + b_couple (T_cpu - T_batt)`
//!
//! Each node is a single closed-form ridge solve. Physical signs are enforced
//! afterwards; a cooling coefficient that comes out non-negative is replaced
//! by a conservative default and the fit is reported as degenerate.

use crate::config::{AmbientEstimator, ThermalConfig, ThermalModelKind};
use crate::error::{DegenerateFit, DegenerateReason, FitOutcome, FitResult};
use crate::features::FeatureSet;
use crate::regression::ridge_solve;
use crate::sample::{RunSignals, DEFAULT_TEMPERATURE_C};
use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Default one-state cooling coefficient (2000 s time constant).
pub const FALLBACK_A_PER_S: f64 = -1.0 / 2000.0;
/// Default fast-node coefficient when the two-state fit is degenerate.
pub const FALLBACK_A_CPU_PER_S: f64 = -1.0 / 200.0;
/// Replacement for a positive fitted fast-node coefficient.
pub const CLAMP_A_CPU_PER_S: f64 = -1.0 / 2000.0;
/// Default slow-node coefficient when the two-state fit is degenerate.
pub const FALLBACK_A_BATT_PER_S: f64 = -1.0 / 2000.0;
/// Replacement for a positive fitted slow-node coefficient.
pub const CLAMP_A_BATT_PER_S: f64 = -1.0 / 5000.0;

/// One-state cooling coefficients above this are not identified.
const MIN_COOLING: f64 = -1e-6;

/// Single lumped node coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OneStateParams {
    /// Cooling coefficient (1/s), ≤ 0.
    pub a_per_s: f64,
    /// Heating response (°C/J), ≥ 0.
    pub b_c_per_j: f64,
    pub t_amb_c: f64,
}

/// Fast processor node coupled to a slow case/battery node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwoStateParams {
    pub a_cpu_per_s: f64,
    pub b_cpu_c_per_j: f64,
    pub a_batt_per_s: f64,
    /// Coupling of the slow node to the fast node (1/s), ≥ 0.
    pub b_couple_per_s: f64,
    pub t_amb_c: f64,
}

/// Per-run thermal coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ThermalParams {
    OneState(OneStateParams),
    TwoState(TwoStateParams),
}

impl ThermalParams {
    pub fn kind(&self) -> ThermalModelKind {
        match self {
            ThermalParams::OneState(_) => ThermalModelKind::OneState,
            ThermalParams::TwoState(_) => ThermalModelKind::TwoState,
        }
    }

    pub fn ambient_c(&self) -> f64 {
        match self {
            ThermalParams::OneState(p) => p.t_amb_c,
            ThermalParams::TwoState(p) => p.t_amb_c,
        }
    }

    /// Cooling coefficient of the fast (or only) node.
    pub fn cooling_per_s(&self) -> f64 {
        match self {
            ThermalParams::OneState(p) => p.a_per_s,
            ThermalParams::TwoState(p) => p.a_cpu_per_s,
        }
    }

    /// Time constant of the fast (or only) node.
    pub fn tau_s(&self) -> f64 {
        tau_s(self.cooling_per_s())
    }
}

/// Time constant `-1/a`; infinite when the node does not cool.
pub fn tau_s(a_per_s: f64) -> f64 {
    if a_per_s < 0.0 {
        -1.0 / a_per_s
    } else {
        f64::INFINITY
    }
}

/// Ambient temperature of a series under the configured estimator.
pub fn estimate_ambient(temps: &[f64], estimator: AmbientEstimator) -> f64 {
    let mut finite: Vec<f64> = temps.iter().copied().filter(|t| t.is_finite()).collect();
    if finite.is_empty() {
        return match estimator {
            AmbientEstimator::Fixed(t) => t,
            _ => DEFAULT_TEMPERATURE_C,
        };
    }
    finite.sort_by(f64::total_cmp);
    match estimator {
        AmbientEstimator::RunMinimum => finite[0],
        AmbientEstimator::Fixed(t) => t,
        AmbientEstimator::Quantile(q) => {
            let pos = q.clamp(0.0, 1.0) * (finite.len() - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            finite[lo] + (finite[hi] - finite[lo]) * (pos - lo as f64)
        }
    }
}

/// One finite-difference regression row.
struct DerivativeRow {
    rate: f64,
    excess: f64,
    drive: f64,
}

/// Two-column design over derivative rows.
fn derivative_features<'a>(excess: &'static str, drive: &'static str) -> FeatureSet<'a, DerivativeRow> {
    FeatureSet::new()
        .with(excess, |r: &DerivativeRow| r.excess)
        .with(drive, |r: &DerivativeRow| r.drive)
}

fn solve_node(
    rows: &[DerivativeRow],
    features: &FeatureSet<'_, DerivativeRow>,
    ridge: f64,
) -> Option<(f64, f64)> {
    let x = features.design(rows.iter());
    let y = DVector::from_iterator(rows.len(), rows.iter().map(|r| r.rate));
    let beta = ridge_solve(&x, &y, ridge).ok()?;
    Some((beta[0], beta[1]))
}

/// Fit the configured thermal model to one run.
pub fn fit_thermal(signals: &RunSignals, config: &ThermalConfig) -> FitResult<ThermalParams> {
    match config.model {
        ThermalModelKind::OneState => lift(fit_one_state(signals, config), ThermalParams::OneState),
        ThermalModelKind::TwoState => lift(fit_two_state(signals, config), ThermalParams::TwoState),
    }
}

fn lift<P>(outcome: FitResult<P>, wrap: fn(P) -> ThermalParams) -> FitResult<ThermalParams> {
    match outcome {
        Ok(p) => Ok(wrap(p)),
        Err(d) => Err(DegenerateFit::new(d.reason, wrap(d.fallback))),
    }
}

/// One-state fit on the processor temperature.
pub fn fit_one_state(signals: &RunSignals, config: &ThermalConfig) -> FitResult<OneStateParams> {
    let fallback = |t_amb_c| OneStateParams {
        a_per_s: FALLBACK_A_PER_S,
        b_c_per_j: 0.0,
        t_amb_c,
    };

    let temps = match &signals.temp_cpu_c {
        Some(t) => t,
        None => {
            return Err(DegenerateFit::new(
                DegenerateReason::MissingSignal("temperature_cpu_C"),
                fallback(DEFAULT_TEMPERATURE_C),
            ))
        }
    };
    let t_amb_c = estimate_ambient(temps, config.ambient);

    let rows: Vec<DerivativeRow> = (0..signals.len().saturating_sub(1))
        .filter(|&i| signals.step_valid(i))
        .map(|i| DerivativeRow {
            rate: (temps[i + 1] - temps[i]) / signals.dt_s[i],
            excess: temps[i] - t_amb_c,
            drive: signals.heat_w[i],
        })
        .collect();

    if rows.len() < config.min_pairs {
        return Err(DegenerateFit::new(
            DegenerateReason::InsufficientData {
                usable: rows.len(),
                required: config.min_pairs,
            },
            fallback(t_amb_c),
        ));
    }

    let features = derivative_features("t_minus_ambient", "heat_w");
    let (a, b) = match solve_node(&rows, &features, config.ridge) {
        Some(ab) => ab,
        None => return Err(DegenerateFit::new(DegenerateReason::Singular, fallback(t_amb_c))),
    };

    let b_c_per_j = if b.is_finite() && b >= 0.0 { b } else { 0.0 };
    if !a.is_finite() || a >= MIN_COOLING {
        debug!("one-state cooling coefficient {:e} not identified", a);
        return Err(DegenerateFit::new(
            DegenerateReason::SignViolation("a_per_s"),
            OneStateParams {
                a_per_s: FALLBACK_A_PER_S,
                b_c_per_j,
                t_amb_c,
            },
        ));
    }

    Ok(OneStateParams {
        a_per_s: a,
        b_c_per_j,
        t_amb_c,
    })
}

/// Two-state fit on processor and case/battery temperatures. Ambient comes
/// from the slow node.
pub fn fit_two_state(signals: &RunSignals, config: &ThermalConfig) -> FitResult<TwoStateParams> {
    let fallback = |t_amb_c| TwoStateParams {
        a_cpu_per_s: FALLBACK_A_CPU_PER_S,
        b_cpu_c_per_j: 0.0,
        a_batt_per_s: FALLBACK_A_BATT_PER_S,
        b_couple_per_s: 0.0,
        t_amb_c,
    };

    let (cpu, batt) = match (&signals.temp_cpu_c, &signals.temp_batt_c) {
        (Some(c), Some(b)) => (c, b),
        (Some(c), None) => {
            let t_amb = crate::sample::median(c).unwrap_or(DEFAULT_TEMPERATURE_C);
            return Err(DegenerateFit::new(
                DegenerateReason::MissingSignal("temperature_C"),
                fallback(t_amb),
            ));
        }
        (None, _) => {
            return Err(DegenerateFit::new(
                DegenerateReason::MissingSignal("temperature_cpu_C"),
                fallback(DEFAULT_TEMPERATURE_C),
            ))
        }
    };
    let t_amb_c = estimate_ambient(batt, config.ambient);

    let mut fast = Vec::new();
    let mut slow = Vec::new();
    for i in 0..signals.len().saturating_sub(1) {
        if !signals.step_valid(i) {
            continue;
        }
        let dt = signals.dt_s[i];
        fast.push(DerivativeRow {
            rate: (cpu[i + 1] - cpu[i]) / dt,
            excess: cpu[i] - batt[i],
            drive: signals.heat_w[i],
        });
        slow.push(DerivativeRow {
            rate: (batt[i + 1] - batt[i]) / dt,
            excess: batt[i] - t_amb_c,
            drive: cpu[i] - batt[i],
        });
    }

    if fast.len() < config.min_pairs {
        return Err(DegenerateFit::new(
            DegenerateReason::InsufficientData {
                usable: fast.len(),
                required: config.min_pairs,
            },
            fallback(t_amb_c),
        ));
    }

    let fast_features = derivative_features("cpu_minus_batt", "heat_w");
    let slow_features = derivative_features("batt_minus_ambient", "cpu_minus_batt");
    let solved = solve_node(&fast, &fast_features, config.ridge)
        .zip(solve_node(&slow, &slow_features, config.ridge));
    let ((a_cpu, b_cpu), (a_batt, b_couple)) = match solved {
        Some(s) => s,
        None => return Err(DegenerateFit::new(DegenerateReason::Singular, fallback(t_amb_c))),
    };

    let nonneg = |v: f64| if v.is_finite() && v >= 0.0 { v } else { 0.0 };
    let mut violation = None;
    let a_cpu_per_s = if a_cpu.is_finite() && a_cpu <= 0.0 {
        a_cpu
    } else {
        violation = Some("a_cpu_per_s");
        CLAMP_A_CPU_PER_S
    };
    let a_batt_per_s = if a_batt.is_finite() && a_batt <= 0.0 {
        a_batt
    } else {
        violation = Some("a_batt_per_s");
        CLAMP_A_BATT_PER_S
    };

    let params = TwoStateParams {
        a_cpu_per_s,
        b_cpu_c_per_j: nonneg(b_cpu),
        a_batt_per_s,
        b_couple_per_s: nonneg(b_couple),
        t_amb_c,
    };
    match violation {
        Some(name) => Err(DegenerateFit::new(DegenerateReason::SignViolation(name), params)),
        None => Ok(params),
    }
}

/// Thermal fit summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalReport {
    pub run_name: String,
    pub thermal_model: String,
    pub t_amb_c: f64,
    pub a_cpu_per_s: f64,
    pub b_cpu_c_per_j: f64,
    pub a_batt_per_s: Option<f64>,
    pub b_couple_per_s: Option<f64>,
    pub tau_cpu_s: f64,
    pub tau_batt_s: Option<f64>,
    pub leak_temp_mix: Option<f64>,
    /// Fallback reason, empty when the fit was accepted.
    pub fallback: String,
}

impl ThermalReport {
    pub fn new(run_name: &str, outcome: &FitResult<ThermalParams>, leak_temp_mix: f64) -> Self {
        let (params, fallback) = match outcome {
            Ok(p) => (*p, String::new()),
            Err(d) => (d.fallback, d.reason.to_string()),
        };
        let base = Self {
            run_name: run_name.to_string(),
            thermal_model: params.kind().as_str().to_string(),
            t_amb_c: params.ambient_c(),
            a_cpu_per_s: params.cooling_per_s(),
            b_cpu_c_per_j: 0.0,
            a_batt_per_s: None,
            b_couple_per_s: None,
            tau_cpu_s: params.tau_s(),
            tau_batt_s: None,
            leak_temp_mix: None,
            fallback,
        };
        match params {
            ThermalParams::OneState(p) => Self {
                b_cpu_c_per_j: p.b_c_per_j,
                ..base
            },
            ThermalParams::TwoState(p) => Self {
                b_cpu_c_per_j: p.b_cpu_c_per_j,
                a_batt_per_s: Some(p.a_batt_per_s),
                b_couple_per_s: Some(p.b_couple_per_s),
                tau_batt_s: Some(tau_s(p.a_batt_per_s)),
                leak_temp_mix: Some(leak_temp_mix),
                ..base
            },
        }
    }

    pub fn is_fallback(&self) -> bool {
        !self.fallback.is_empty()
    }
}

/// Fit one run and resolve the outcome, logging the fallback branch.
pub fn fit_thermal_logged(
    run_name: &str,
    signals: &RunSignals,
    config: &ThermalConfig,
) -> (ThermalParams, FitResult<ThermalParams>) {
    let outcome = fit_thermal(signals, config);
    if let Err(d) = &outcome {
        debug!("run {}: thermal fit fell back ({})", run_name, d.reason);
    }
    (outcome.clone().resolve(), outcome)
}
