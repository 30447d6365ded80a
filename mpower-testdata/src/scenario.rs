// MPower Testdata - Run scenarios
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Run definitions and the standard experiment suite.
//!
//! Scenario labels follow the `<family>-<variant>` convention the offset
//! calibration relies on: `S4-off`/`S4-on` is a GPS pair and
//! `S5-off`/`S5-on` a cellular pair.

use crate::patterns::LoadPattern;
use mpower::{MpowerError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One run to synthesize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_name: String,
    pub scenario: String,
    pub duration_s: f64,
    pub dt_s: f64,
    /// Processor power proxy (mW).
    pub cpu: LoadPattern,
    /// Screen power proxy (mW).
    pub screen: LoadPattern,
    #[serde(default = "default_on")]
    pub gps_on: bool,
    #[serde(default = "default_on")]
    pub cellular_on: bool,
    /// Initial SOC fraction.
    #[serde(default = "default_soc0")]
    pub soc0: f64,
    /// Initial node temperatures; ambient when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t0_c: Option<f64>,
}

fn default_on() -> bool {
    true
}

fn default_soc0() -> f64 {
    0.9
}

impl RunSpec {
    pub fn new(run_name: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            scenario: scenario.into(),
            duration_s: 1800.0,
            dt_s: 5.0,
            cpu: LoadPattern::constant(150.0),
            screen: LoadPattern::constant(0.0),
            gps_on: true,
            cellular_on: true,
            soc0: default_soc0(),
            t0_c: None,
        }
    }

    pub fn with_duration(mut self, duration_s: f64, dt_s: f64) -> Self {
        self.duration_s = duration_s;
        self.dt_s = dt_s;
        self
    }

    pub fn with_cpu(mut self, cpu: LoadPattern) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_screen(mut self, screen: LoadPattern) -> Self {
        self.screen = screen;
        self
    }

    pub fn with_gps(mut self, on: bool) -> Self {
        self.gps_on = on;
        self
    }

    pub fn with_cellular(mut self, on: bool) -> Self {
        self.cellular_on = on;
        self
    }

    pub fn with_soc0(mut self, soc0: f64) -> Self {
        self.soc0 = soc0;
        self
    }

    /// Number of samples, at least one.
    pub fn num_samples(&self) -> usize {
        if self.dt_s > 0.0 && self.duration_s.is_finite() {
            ((self.duration_s / self.dt_s).floor() as usize).max(1)
        } else {
            1
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.dt_s.is_finite() && self.dt_s > 0.0) {
            return Err(MpowerError::InvalidConfig(format!(
                "run {}: dt_s must be positive",
                self.run_name
            )));
        }
        if !(0.0..=1.0).contains(&self.soc0) {
            return Err(MpowerError::InvalidConfig(format!(
                "run {}: soc0 must be within [0, 1]",
                self.run_name
            )));
        }
        Ok(())
    }
}

/// The standard experiment suite, `repeats` runs per scenario.
///
/// - `S1-idle`: screen off, light background CPU
/// - `S2-25`, `S2-50`, `S2-100`: screen brightness levels
/// - `S3-burst`: CPU square wave, heats the device
/// - `S3-walk`: wandering CPU load with a dim screen
/// - `S4-off`/`S4-on`: GPS pair
/// - `S5-off`/`S5-on`: cellular pair
pub fn standard_suite(repeats: usize) -> Vec<RunSpec> {
    let mut specs = Vec::new();
    for rep in 1..=repeats.max(1) {
        let name = |scenario: &str| format!("{}_r{}", scenario, rep);
        // Later repeats start a little lower so runs differ in start state.
        let soc0 = (0.95 - 0.07 * (rep - 1) as f64).max(0.3);

        specs.push(
            RunSpec::new(name("S1-idle"), "S1-idle")
                .with_cpu(LoadPattern::random_walk(120.0, 15.0, 60.0, 250.0))
                .with_soc0(soc0),
        );
        for level in [25u32, 50, 100] {
            let scenario = format!("S2-{}", level);
            specs.push(
                RunSpec::new(name(&scenario), scenario)
                    .with_cpu(LoadPattern::random_walk(200.0, 25.0, 80.0, 400.0))
                    .with_screen(LoadPattern::constant(6.0 * level as f64))
                    .with_soc0(soc0),
            );
        }
        specs.push(
            RunSpec::new(name("S3-burst"), "S3-burst")
                .with_cpu(LoadPattern::Square {
                    low: 200.0,
                    high: 2400.0,
                    period_s: 300.0,
                    duty: 0.5,
                })
                .with_screen(LoadPattern::constant(150.0))
                .with_soc0(soc0),
        );
        specs.push(
            RunSpec::new(name("S3-walk"), "S3-walk")
                .with_cpu(LoadPattern::random_walk(900.0, 120.0, 100.0, 2000.0))
                .with_screen(LoadPattern::Step {
                    levels: vec![(0.0, 80.0), (900.0, 240.0)],
                })
                .with_soc0(soc0),
        );
        for (family, gps) in [("S4", false), ("S5", true)] {
            for on in [false, true] {
                let scenario = format!("{}-{}", family, if on { "on" } else { "off" });
                let spec = RunSpec::new(name(&scenario), scenario)
                    .with_cpu(LoadPattern::random_walk(250.0, 30.0, 100.0, 500.0))
                    .with_screen(LoadPattern::constant(200.0))
                    .with_soc0(soc0);
                let spec = if gps { spec.with_cellular(on) } else { spec.with_gps(on) };
                specs.push(spec);
            }
        }
    }
    specs
}

/// Load a list of run specs from a JSON file.
pub fn load_suite(path: impl AsRef<Path>) -> Result<Vec<RunSpec>> {
    let json = fs::read_to_string(path)?;
    let specs: Vec<RunSpec> = serde_json::from_str(&json)?;
    for spec in &specs {
        spec.validate()?;
    }
    Ok(specs)
}

/// Save a list of run specs as pretty JSON.
pub fn save_suite(path: impl AsRef<Path>, specs: &[RunSpec]) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(specs)?)?;
    Ok(())
}
