// MPower Testdata - Core generator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry synthesis.
//!
//! Every run is integrated with explicit Euler at a uniform interval: the
//! state at sample `i` and the interval `dt_s` produce sample `i + 1`, which
//! is the same discretization the library's simulator and thermal fitter use.
//! Noise is added to the reported values only, never to the state.

use crate::device::DeviceTruth;
use crate::patterns::PatternState;
use crate::scenario::RunSpec;
use mpower::power::PowerRow;
use mpower::{Dataset, Run, Sample, ThermalParams};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

/// Measurement noise, one standard deviation per reported signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub power_mw: f64,
    pub temp_c: f64,
    pub voltage_mv: f64,
}

impl NoiseConfig {
    /// No noise at all.
    pub fn none() -> Self {
        Self {
            power_mw: 0.0,
            temp_c: 0.0,
            voltage_mv: 0.0,
        }
    }
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            power_mw: 25.0,
            temp_c: 0.1,
            voltage_mv: 3.0,
        }
    }
}

/// Generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Random seed for reproducibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub device: DeviceTruth,
    pub noise: NoiseConfig,
    /// Reported SOC is rounded down to this step (percent); none reports
    /// the exact value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc_quantum_pct: Option<f64>,
    /// Probability that a reported power or temperature reading is missing.
    pub dropout: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: None,
            device: DeviceTruth::default(),
            noise: NoiseConfig::default(),
            soc_quantum_pct: Some(1.0),
            dropout: 0.0,
        }
    }
}

impl GeneratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_device(mut self, device: DeviceTruth) -> Self {
        self.device = device;
        self
    }

    pub fn with_noise(mut self, noise: NoiseConfig) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_soc_quantum(mut self, quantum_pct: Option<f64>) -> Self {
        self.soc_quantum_pct = quantum_pct;
        self
    }

    pub fn with_dropout(mut self, probability: f64) -> Self {
        self.dropout = probability.clamp(0.0, 1.0);
        self
    }

    /// Noise-free configuration reporting the exact SOC.
    pub fn exact(seed: u64) -> Self {
        Self::new()
            .with_seed(seed)
            .with_noise(NoiseConfig::none())
            .with_soc_quantum(None)
    }
}

/// Noise-free state of a generated run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTrace {
    pub soc: Vec<f64>,
    pub cpu_c: Vec<f64>,
    pub batt_c: Option<Vec<f64>>,
    /// True drawn power, including the resistive loss.
    pub power_mw: Vec<f64>,
    /// Resistive loss part of `power_mw`.
    pub loss_mw: Vec<f64>,
    pub voltage_v: Vec<f64>,
}

/// Stateful generator; runs share one random stream.
pub struct Generator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl Generator {
    pub fn new(config: GeneratorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Synthesize one run.
    pub fn generate_run(&mut self, spec: &RunSpec) -> Run {
        self.generate_run_with_trace(spec).0
    }

    /// Synthesize one run and return its noise-free state alongside.
    pub fn generate_run_with_trace(&mut self, spec: &RunSpec) -> (Run, RunTrace) {
        let device = self.config.device.clone();
        let noise = self.config.noise.clone();
        let n = spec.num_samples();
        let dt = spec.dt_s;
        let t0 = spec.t0_c.unwrap_or_else(|| device.ambient_c());

        let mut cpu_state = PatternState::new();
        let mut screen_state = PatternState::new();
        let mut trace = RunTrace {
            batt_c: match device.thermal {
                ThermalParams::TwoState(_) => Some(Vec::with_capacity(n)),
                ThermalParams::OneState(_) => None,
            },
            ..Default::default()
        };
        let mut samples = Vec::with_capacity(n);

        let (mut soc, mut tc, mut tb) = (spec.soc0.clamp(0.0, 1.0), t0, t0);
        for i in 0..n {
            let t_s = i as f64 * dt;
            let cpu_mw = cpu_state.evaluate(&spec.cpu, t_s, &mut self.rng);
            let screen_mw = screen_state.evaluate(&spec.screen, t_s, &mut self.rng);
            let batt = trace.batt_c.as_ref().map(|_| tb);

            let row = PowerRow {
                screen_mw,
                cpu_mw,
                leak_temp_c: device.leak_temp(tc, batt),
                gps_on: spec.gps_on,
                cellular_on: spec.cellular_on,
                measured_mw: None,
            };
            let model_mw = device.model_power(&row);
            let (voltage_v, loss_mw) = device.terminal(soc, model_mw);
            let power_mw = model_mw + loss_mw;

            samples.push(Sample {
                t_s,
                dt_s: dt,
                soc_pct: Some(self.report_soc(soc)),
                voltage_mv: Some(self.noisy(voltage_v * 1000.0, noise.voltage_mv)),
                temperature_c: batt.and_then(|b| self.reading(b, noise.temp_c)),
                temperature_cpu_c: self.reading(tc, noise.temp_c),
                power_total_mw: self.reading(power_mw, noise.power_mw),
                power_cpu_mw: Some(cpu_mw),
                power_screen_mw: Some(screen_mw),
                is_gps_on: Some(spec.gps_on),
                cellular_on: Some(spec.cellular_on),
            });
            trace.soc.push(soc);
            trace.cpu_c.push(tc);
            if let Some(b) = trace.batt_c.as_mut() {
                b.push(tb);
            }
            trace.power_mw.push(power_mw);
            trace.loss_mw.push(loss_mw);
            trace.voltage_v.push(voltage_v);

            // Advance the state to sample i + 1.
            let heat_w = cpu_mw.max(0.0) / 1000.0;
            match device.thermal {
                ThermalParams::OneState(p) => {
                    tc += dt * (p.a_per_s * (tc - p.t_amb_c) + p.b_c_per_j * heat_w);
                }
                ThermalParams::TwoState(p) => {
                    let d_cpu = p.a_cpu_per_s * (tc - tb) + p.b_cpu_c_per_j * heat_w;
                    let d_batt = p.a_batt_per_s * (tb - p.t_amb_c) + p.b_couple_per_s * (tc - tb);
                    tc += dt * d_cpu;
                    tb += dt * d_batt;
                }
            }
            let drain = power_mw / (voltage_v * 3600.0 * device.power.c_eff_mah) * dt;
            soc = (soc - drain).clamp(0.0, 1.0);
        }

        (Run::new(spec.run_name.clone(), spec.scenario.clone(), samples), trace)
    }

    /// Synthesize every run of a suite.
    pub fn generate(&mut self, specs: &[RunSpec]) -> Dataset {
        Dataset::new(specs.iter().map(|s| self.generate_run(s)).collect())
    }

    fn report_soc(&self, soc: f64) -> f64 {
        let pct = soc * 100.0;
        match self.config.soc_quantum_pct {
            Some(q) if q > 0.0 => (pct / q).floor() * q,
            _ => pct,
        }
    }

    /// A noisy reading, or none with the dropout probability.
    fn reading(&mut self, value: f64, std: f64) -> Option<f64> {
        if self.config.dropout > 0.0 && self.rng.gen_bool(self.config.dropout) {
            return None;
        }
        Some(self.noisy(value, std))
    }

    fn noisy(&mut self, value: f64, std: f64) -> f64 {
        if std <= 0.0 {
            return value;
        }
        match Normal::new(0.0, std) {
            Ok(noise) => value + noise.sample(&mut self.rng),
            Err(_) => value,
        }
    }
}

/// Generate a dataset for a suite in one call.
pub fn generate_dataset(config: &GeneratorConfig, specs: &[RunSpec]) -> Dataset {
    Generator::new(config.clone()).generate(specs)
}
