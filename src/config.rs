// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Model configuration.
//!
//! Every option is a plain numeric or string value with a default matching the
//! reference analysis. Configurations load from JSON and are validated before
//! use.

use crate::error::{MpowerError, Result};
use crate::sample::Subsystem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Master configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Thermal state fitting.
    pub thermal: ThermalConfig,

    /// Additive power model fitting.
    pub power: PowerConfig,

    /// Battery constants used by the SOC integrator.
    pub battery: BatteryConfig,

    /// Cross-validation harness.
    pub eval: EvalConfig,

    /// Secondary correction-term experiments.
    pub correction: CorrectionConfig,
}

impl ModelConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values that make the fitters meaningless.
    pub fn validate(&self) -> Result<()> {
        if !(self.thermal.ridge >= 0.0) {
            return Err(MpowerError::InvalidConfig("thermal.ridge must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.thermal.leak_temp_mix) {
            return Err(MpowerError::InvalidConfig(
                "thermal.leak_temp_mix must be within [0, 1]".into(),
            ));
        }
        if let AmbientEstimator::Quantile(q) = self.thermal.ambient {
            if !(0.0..=1.0).contains(&q) {
                return Err(MpowerError::InvalidConfig(
                    "thermal.ambient quantile must be within [0, 1]".into(),
                ));
            }
        }
        if !(self.power.ridge >= 0.0) {
            return Err(MpowerError::InvalidConfig("power.ridge must be >= 0".into()));
        }
        if !(self.power.leak_doubling_c > 0.0) {
            return Err(MpowerError::InvalidConfig(
                "power.leak_doubling_c must be > 0".into(),
            ));
        }
        if !(self.power.huber.threshold > 0.0) || self.power.huber.max_iters == 0 {
            return Err(MpowerError::InvalidConfig(
                "power.huber needs threshold > 0 and max_iters > 0".into(),
            ));
        }
        if !(self.battery.c_eff_mah > 0.0) || !(self.battery.nominal_voltage_v > 0.0) {
            return Err(MpowerError::InvalidConfig(
                "battery capacity and nominal voltage must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.battery.initial_soc_fallback) {
            return Err(MpowerError::InvalidConfig(
                "battery.initial_soc_fallback must be within [0, 1]".into(),
            ));
        }
        let grid = &self.correction.gamma_grid;
        if grid.steps == 0 || grid.max < grid.min {
            return Err(MpowerError::InvalidConfig(
                "correction.gamma_grid needs steps > 0 and max >= min".into(),
            ));
        }
        if !(self.correction.clip_frac_of_meas >= 0.0) {
            return Err(MpowerError::InvalidConfig(
                "correction.clip_frac_of_meas must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Thermal model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalModelKind {
    /// Single lumped node driven by the processor temperature.
    OneState,
    /// Fast processor node coupled to a slow case/battery node.
    TwoState,
}

impl ThermalModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThermalModelKind::OneState => "1state",
            ThermalModelKind::TwoState => "2state",
        }
    }

    /// Parse the CLI spelling (`1state` / `2state`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1state" | "one_state" | "1" => Some(ThermalModelKind::OneState),
            "2state" | "two_state" | "2" => Some(ThermalModelKind::TwoState),
            _ => None,
        }
    }
}

/// How the ambient temperature of a run is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbientEstimator {
    /// Minimum observed temperature in the run.
    RunMinimum,
    /// A fixed, externally known ambient (°C).
    Fixed(f64),
    /// Lower quantile of the observed temperature (0 = minimum).
    Quantile(f64),
}

/// Thermal state fitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    /// 1-state or 2-state model.
    pub model: ThermalModelKind,

    /// Ridge strength of the closed-form solve.
    pub ridge: f64,

    /// Minimum finite-difference pairs before falling back to defaults.
    pub min_pairs: usize,

    /// Ambient temperature proxy.
    pub ambient: AmbientEstimator,

    /// Leak temperature = w * T_fast + (1 - w) * T_slow (2-state only).
    pub leak_temp_mix: f64,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            model: ThermalModelKind::OneState,
            ridge: 1e-3,
            min_pairs: 10,
            ambient: AmbientEstimator::RunMinimum,
            leak_temp_mix: 0.7,
        }
    }
}

/// Huber IRLS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HuberConfig {
    /// Standardized residual beyond which samples are down-weighted.
    pub threshold: f64,
    /// Iteration cap.
    pub max_iters: usize,
    /// Stop when the max coefficient change falls below this.
    pub tolerance: f64,
}

impl Default for HuberConfig {
    fn default() -> Self {
        Self {
            threshold: 1.5,
            max_iters: 30,
            tolerance: 1e-9,
        }
    }
}

/// An explicit OFF/ON run pair used to calibrate one subsystem offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationPair {
    pub subsystem: Subsystem,
    pub off_run: String,
    pub on_run: String,
}

/// Power model fitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Ridge strength of the base regression.
    pub ridge: f64,

    /// Leakage doubles every N °C (fixed prior, not fit).
    pub leak_doubling_c: f64,

    /// Robust loss settings.
    pub huber: HuberConfig,

    /// Explicit calibration pairs. Subsystems without one are discovered by
    /// scenario family.
    pub calibration: Vec<CalibrationPair>,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            ridge: 2000.0,
            leak_doubling_c: 10.0,
            huber: HuberConfig::default(),
            calibration: Vec::new(),
        }
    }
}

impl PowerConfig {
    /// Leakage rate γ = ln 2 / doubling temperature.
    pub fn leak_gamma_per_c(&self) -> f64 {
        std::f64::consts::LN_2 / self.leak_doubling_c
    }
}

/// Battery constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Effective capacity used by the SOC integrator.
    pub c_eff_mah: f64,
    /// Voltage used when a run never reports a valid one.
    pub nominal_voltage_v: f64,
    /// Initial SOC when a run never reports one.
    pub initial_soc_fallback: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            c_eff_mah: 4410.0,
            nominal_voltage_v: 3.85,
            initial_soc_fallback: 0.5,
        }
    }
}

/// Partitioning scheme of the evaluation harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    /// Hold out each scenario matching the holdout prefix in turn.
    ScenarioHoldout,
    /// Leave one run out.
    LeaveOneRunOut,
    /// Leave one scenario out.
    LeaveOneScenarioOut,
    /// All of the above.
    All,
}

impl EvalMode {
    /// Parse the CLI spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holdout" | "s2-holdout" | "scenario-holdout" => Some(EvalMode::ScenarioHoldout),
            "loro" | "looro" => Some(EvalMode::LeaveOneRunOut),
            "loso" => Some(EvalMode::LeaveOneScenarioOut),
            "all" => Some(EvalMode::All),
            _ => None,
        }
    }
}

/// Evaluation harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub mode: EvalMode,
    /// Scenario prefix iterated by the holdout mode.
    pub holdout_prefix: String,
    /// Runs with fewer measured samples are dropped.
    pub min_run_samples: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            mode: EvalMode::ScenarioHoldout,
            holdout_prefix: "S2".to_string(),
            min_run_samples: 30,
        }
    }
}

/// Physical correction terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionTerm {
    /// I²R conduction loss.
    I2r,
    /// Voltage-scaled leakage exponential.
    Leak,
    /// Constant background draw.
    Background,
}

impl CorrectionTerm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionTerm::I2r => "i2r",
            CorrectionTerm::Leak => "leak",
            CorrectionTerm::Background => "background",
        }
    }

    /// Parse a comma-separated term list (`i2r,leak,base`).
    pub fn parse_set(s: &str) -> Result<BTreeSet<CorrectionTerm>> {
        let mut out = BTreeSet::new();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let term = match token.to_ascii_lowercase().as_str() {
                "i2r" => CorrectionTerm::I2r,
                "leak" => CorrectionTerm::Leak,
                "base" | "background" | "bg" => CorrectionTerm::Background,
                other => {
                    return Err(MpowerError::InvalidConfig(format!(
                        "unknown correction term: {}",
                        other
                    )))
                }
            };
            out.insert(term);
        }
        Ok(out)
    }
}

/// Internal-resistance parameterisation of the I²R term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResistanceModel {
    /// Constant R0.
    R0,
    /// R0 + R1 * (1 - SOC).
    R0Rsoc,
    /// R0 + R1 * (1 - SOC) + R2 * max(0, T - Tref).
    R0RsocRtpos,
}

/// Which per-run temperature drives the correction features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempSource {
    /// First valid reading of the run.
    Start,
    /// Mean over the run.
    Mean,
}

/// Linear grid of leakage rates searched by the leak term.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GammaGrid {
    pub min: f64,
    pub max: f64,
    pub steps: usize,
}

impl Default for GammaGrid {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 0.06,
            steps: 31,
        }
    }
}

impl GammaGrid {
    /// Grid values, endpoints included.
    pub fn values(&self) -> Vec<f64> {
        if self.steps <= 1 {
            return vec![self.min];
        }
        let step = (self.max - self.min) / (self.steps - 1) as f64;
        (0..self.steps).map(|i| self.min + step * i as f64).collect()
    }
}

/// Secondary correction-term configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Terms included by the structured leak/background experiment.
    pub terms: BTreeSet<CorrectionTerm>,
    /// I²R parameterisation.
    pub resistance_model: ResistanceModel,
    /// Reference temperature of the loss features (°C).
    pub tref_c: f64,
    /// Ridge of the correction solves.
    pub ridge: f64,
    /// Fit a nonnegative rescale of the correction on the training fold.
    pub fit_scale: bool,
    /// Cap corrections at this fraction of measured power (0 disables).
    pub clip_frac_of_meas: f64,
    /// Leakage rate grid.
    pub gamma_grid: GammaGrid,
    /// Per-run temperature statistic.
    pub temp_source: TempSource,
    /// Ridge of the covariate residual correction.
    pub covariate_ridge: f64,
    /// Drop the first scenario dummy in ANCOVA fits.
    pub drop_first: bool,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        let mut terms = BTreeSet::new();
        terms.insert(CorrectionTerm::I2r);
        terms.insert(CorrectionTerm::Leak);
        terms.insert(CorrectionTerm::Background);
        Self {
            terms,
            resistance_model: ResistanceModel::R0RsocRtpos,
            tref_c: 40.0,
            ridge: 1e-6,
            fit_scale: false,
            clip_frac_of_meas: 0.0,
            gamma_grid: GammaGrid::default(),
            temp_source: TempSource::Mean,
            covariate_ridge: 1e-3,
            drop_first: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.thermal.model, ThermalModelKind::OneState);
        assert_eq!(config.thermal.min_pairs, 10);
        assert_eq!(config.battery.c_eff_mah, 4410.0);
        assert_eq!(config.eval.min_run_samples, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ModelConfig::default();
        let json = config.to_json().unwrap();
        let parsed: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.power.ridge, config.power.ridge);
        assert_eq!(parsed.correction.terms, config.correction.terms);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let parsed: ModelConfig =
            serde_json::from_str(r#"{"thermal": {"model": "two_state"}}"#).unwrap();
        assert_eq!(parsed.thermal.model, ThermalModelKind::TwoState);
        assert_eq!(parsed.thermal.min_pairs, 10);
        assert_eq!(parsed.power.huber.max_iters, 30);
    }

    #[test]
    fn test_leak_gamma_doubles() {
        let power = PowerConfig::default();
        let gamma = power.leak_gamma_per_c();
        assert!(((gamma * 10.0).exp() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_mix_rejected() {
        let mut config = ModelConfig::default();
        config.thermal.leak_temp_mix = 1.5;
        assert!(matches!(config.validate(), Err(MpowerError::InvalidConfig(_))));
    }

    #[test]
    fn test_gamma_grid_endpoints() {
        let values = GammaGrid::default().values();
        assert_eq!(values.len(), 31);
        assert_eq!(values[0], 0.0);
        assert!((values[30] - 0.06).abs() < 1e-12);
    }

    #[test]
    fn test_parse_term_set() {
        let set = CorrectionTerm::parse_set("i2r, base").unwrap();
        assert!(set.contains(&CorrectionTerm::I2r));
        assert!(set.contains(&CorrectionTerm::Background));
        assert!(!set.contains(&CorrectionTerm::Leak));
        assert!(CorrectionTerm::parse_set("i2r,bogus").is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(EvalMode::parse("looro"), Some(EvalMode::LeaveOneRunOut));
        assert_eq!(EvalMode::parse("LOSO"), Some(EvalMode::LeaveOneScenarioOut));
        assert_eq!(ThermalModelKind::parse("2state"), Some(ThermalModelKind::TwoState));
        assert_eq!(EvalMode::parse("nope"), None);
    }
}
