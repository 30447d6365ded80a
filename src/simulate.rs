//! Continuous-time state simulator
//!
//! Explicit Euler integration, one step per sample interval. A step whose
//! interval is non-finite or non-positive repeats the previous state.

use crate::config::BatteryConfig;
use crate::sample::{fill_forward_back, RunSignals};
use crate::thermal::ThermalParams;
use serde::{Deserialize, Serialize};

/// Simulated temperatures of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureTrajectory {
    /// Fast (or only) node.
    pub cpu_c: Vec<f64>,
    /// Slow node, two-state only.
    pub batt_c: Option<Vec<f64>>,
    /// Driver of the leakage feature.
    pub leak_c: Vec<f64>,
}

impl TemperatureTrajectory {
    pub fn len(&self) -> usize {
        self.cpu_c.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_c.is_empty()
    }
}

/// Integrate the thermal model over a run. `leak_temp_mix` weights the fast
/// node in the two-state leak temperature and is clamped to [0, 1].
pub fn simulate_temperature(
    signals: &RunSignals,
    params: &ThermalParams,
    leak_temp_mix: f64,
) -> TemperatureTrajectory {
    let n = signals.len();
    if n == 0 {
        return TemperatureTrajectory {
            cpu_c: Vec::new(),
            batt_c: None,
            leak_c: Vec::new(),
        };
    }
    let initial = |series: &Option<Vec<f64>>| {
        series
            .as_ref()
            .and_then(|s| s.first().copied())
            .unwrap_or_else(|| params.ambient_c())
    };

    match params {
        ThermalParams::OneState(p) => {
            let mut cpu = Vec::with_capacity(n);
            cpu.push(initial(&signals.temp_cpu_c));
            for i in 0..n - 1 {
                let t = cpu[i];
                let next = if signals.step_valid(i) {
                    let rate = p.a_per_s * (t - p.t_amb_c) + p.b_c_per_j * signals.heat_w[i];
                    t + rate * signals.dt_s[i]
                } else {
                    t
                };
                cpu.push(next);
            }
            TemperatureTrajectory {
                leak_c: cpu.clone(),
                cpu_c: cpu,
                batt_c: None,
            }
        }
        ThermalParams::TwoState(p) => {
            let w = if leak_temp_mix.is_finite() {
                leak_temp_mix.clamp(0.0, 1.0)
            } else {
                0.7
            };
            let mut cpu = Vec::with_capacity(n);
            let mut batt = Vec::with_capacity(n);
            cpu.push(initial(&signals.temp_cpu_c));
            batt.push(initial(&signals.temp_batt_c));
            for i in 0..n - 1 {
                let (tc, tb) = (cpu[i], batt[i]);
                if signals.step_valid(i) {
                    let dt = signals.dt_s[i];
                    let d_cpu = p.a_cpu_per_s * (tc - tb) + p.b_cpu_c_per_j * signals.heat_w[i];
                    let d_batt = p.a_batt_per_s * (tb - p.t_amb_c) + p.b_couple_per_s * (tc - tb);
                    cpu.push(tc + d_cpu * dt);
                    batt.push(tb + d_batt * dt);
                } else {
                    cpu.push(tc);
                    batt.push(tb);
                }
            }
            let leak_c = cpu
                .iter()
                .zip(&batt)
                .map(|(c, b)| w * c + (1.0 - w) * b)
                .collect();
            TemperatureTrajectory {
                cpu_c: cpu,
                batt_c: Some(batt),
                leak_c,
            }
        }
    }
}

/// Simulated SOC of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocTrajectory {
    /// SOC fraction per sample, within [0, 1].
    pub soc: Vec<f64>,
}

impl SocTrajectory {
    pub fn last(&self) -> Option<f64> {
        self.soc.last().copied()
    }
}

/// Coulomb-count SOC from a per-sample power prediction (mW):
/// `soc[i+1] = clamp(soc[i] - P[i] / (V[i] · 3600 · C_eff) · dt, 0, 1)`.
///
/// The initial SOC is the run's first valid reading, else the configured
/// fallback. Non-finite power entries are held from their neighbours.
pub fn simulate_soc(signals: &RunSignals, power_mw: &[f64], battery: &BatteryConfig) -> SocTrajectory {
    let n = signals.len();
    if n == 0 {
        return SocTrajectory { soc: Vec::new() };
    }
    let filled: Vec<Option<f64>> = power_mw.iter().map(|p| Some(*p)).collect();
    let power: Vec<f64> = fill_forward_back(&filled)
        .into_iter()
        .map(|p| p.unwrap_or(0.0))
        .collect();
    let denom = 3600.0 * battery.c_eff_mah;

    let soc0 = signals
        .initial_soc()
        .unwrap_or(battery.initial_soc_fallback)
        .clamp(0.0, 1.0);
    let mut soc = Vec::with_capacity(n);
    soc.push(soc0);
    for i in 0..n - 1 {
        let prev = soc[i];
        if !signals.step_valid(i) {
            soc.push(prev);
            continue;
        }
        let v = signals.voltage_v[i];
        let v = if v.is_finite() && v > 0.0 {
            v
        } else {
            battery.nominal_voltage_v
        };
        let p = power.get(i).copied().unwrap_or(0.0);
        let next = prev - p / (v * denom) * signals.dt_s[i];
        soc.push(next.clamp(0.0, 1.0));
    }
    SocTrajectory { soc }
}

/// RMSE between simulated and measured SOC, in percent points. NaN when the
/// run has no SOC readings.
pub fn soc_rmse_pct(signals: &RunSignals, trajectory: &SocTrajectory) -> f64 {
    let errs: Vec<f64> = signals
        .soc_meas
        .iter()
        .zip(&trajectory.soc)
        .filter_map(|(m, s)| m.map(|m| (s - m) * 100.0))
        .collect();
    crate::metrics::ErrorSummary::from_residuals(&errs).rmse
}

/// Mean absolute percentage error of simulated vs. measured SOC.
pub fn soc_mape_pct(signals: &RunSignals, trajectory: &SocTrajectory) -> f64 {
    let errs: Vec<f64> = signals
        .soc_meas
        .iter()
        .zip(&trajectory.soc)
        .filter_map(|(m, s)| m.map(|m| (s - m).abs() / m.abs().max(1e-6)))
        .collect();
    if errs.is_empty() {
        f64::NAN
    } else {
        errs.iter().sum::<f64>() / errs.len() as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Run, Sample};
    use crate::thermal::{OneStateParams, TwoStateParams};
    use approx::assert_relative_eq;

    fn run(n: usize, dt: f64) -> Run {
        let samples = (0..n)
            .map(|i| Sample {
                t_s: i as f64 * dt,
                dt_s: dt,
                soc_pct: Some(80.0),
                voltage_mv: Some(4000.0),
                temperature_cpu_c: Some(35.0),
                temperature_c: Some(30.0),
                power_cpu_mw: Some(1000.0),
                ..Default::default()
            })
            .collect();
        Run::new("r", "S1", samples)
    }

    #[test]
    fn test_soc_constant_drain() {
        let sig = RunSignals::from_run(&run(11, 10.0), 3.85);
        let battery = BatteryConfig::default();
        let p = vec![4000.0; 11];
        let traj = simulate_soc(&sig, &p, &battery);
        // 4 W at 4 V is 1 A: 100 s drains 100/3600 Ah.
        let expected = 0.8 - 100.0 / 3600.0 / 4.41;
        assert_relative_eq!(traj.soc[10], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_soc_zero_power_unchanged() {
        let sig = RunSignals::from_run(&run(20, 1.0), 3.85);
        let traj = simulate_soc(&sig, &vec![0.0; 20], &BatteryConfig::default());
        assert!(traj.soc.iter().all(|s| *s == 0.8));
    }

    #[test]
    fn test_soc_clamped() {
        let sig = RunSignals::from_run(&run(5, 3600.0), 3.85);
        let drain = simulate_soc(&sig, &vec![1e6; 5], &BatteryConfig::default());
        assert_eq!(drain.last(), Some(0.0));
        let charge = simulate_soc(&sig, &vec![-1e6; 5], &BatteryConfig::default());
        assert_eq!(charge.last(), Some(1.0));
    }

    #[test]
    fn test_invalid_dt_is_noop() {
        let mut r = run(4, 1.0).samples().to_vec();
        r[1].dt_s = f64::NAN;
        r[2].dt_s = -1.0;
        let sig = RunSignals::from_run(&Run::new("r", "S1", r), 3.85);
        let traj = simulate_soc(&sig, &vec![1e5; 4], &BatteryConfig::default());
        assert!(traj.soc[1] < traj.soc[0]);
        assert_eq!(traj.soc[2], traj.soc[1]);
        assert_eq!(traj.soc[3], traj.soc[2]);
    }

    #[test]
    fn test_soc_fallback_initial() {
        let samples = (0..3)
            .map(|i| Sample {
                t_s: i as f64,
                dt_s: 1.0,
                ..Default::default()
            })
            .collect();
        let sig = RunSignals::from_run(&Run::new("r", "S1", samples), 3.85);
        let traj = simulate_soc(&sig, &[0.0, 0.0, 0.0], &BatteryConfig::default());
        assert_eq!(traj.soc, vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_one_state_steady_at_ambient() {
        let sig = RunSignals::from_run(&run(10, 1.0), 3.85);
        let params = ThermalParams::OneState(OneStateParams {
            a_per_s: -0.01,
            b_c_per_j: 0.0,
            t_amb_c: 35.0,
        });
        let traj = simulate_temperature(&sig, &params, 0.7);
        assert!(traj.cpu_c.iter().all(|t| *t == 35.0));
        assert_eq!(traj.leak_c, traj.cpu_c);
        assert!(traj.batt_c.is_none());
    }

    #[test]
    fn test_two_state_leak_mix() {
        let sig = RunSignals::from_run(&run(5, 1.0), 3.85);
        let params = ThermalParams::TwoState(TwoStateParams {
            a_cpu_per_s: -0.1,
            b_cpu_c_per_j: 0.2,
            a_batt_per_s: -0.01,
            b_couple_per_s: 0.02,
            t_amb_c: 30.0,
        });
        let traj = simulate_temperature(&sig, &params, 0.7);
        let batt = traj.batt_c.as_ref().unwrap();
        assert_eq!(traj.cpu_c[0], 35.0);
        assert_eq!(batt[0], 30.0);
        // d_cpu = -0.1 * 5 + 0.2 * 1 = -0.3; d_batt = 0.02 * 5 = 0.1
        assert_relative_eq!(traj.cpu_c[1], 34.7, epsilon = 1e-12);
        assert_relative_eq!(batt[1], 30.1, epsilon = 1e-12);
        assert_relative_eq!(traj.leak_c[1], 0.7 * 34.7 + 0.3 * 30.1, epsilon = 1e-12);
    }

    #[test]
    fn test_soc_rmse() {
        let sig = RunSignals::from_run(&run(3, 1.0), 3.85);
        let traj = SocTrajectory {
            soc: vec![0.8, 0.79, 0.78],
        };
        let expected = ((0.0 + 1.0 + 4.0) / 3.0f64).sqrt();
        assert_relative_eq!(soc_rmse_pct(&sig, &traj), expected, epsilon = 1e-9);
        assert!(soc_mape_pct(&sig, &traj) > 0.0);
    }
}
