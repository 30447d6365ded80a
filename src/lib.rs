//! # MPower - Device power and thermal modeling
//!
//! Fits a lumped thermal model and an additive power model to field
//! telemetry, integrates battery state of charge from the predicted power,
//! and cross-validates the whole chain on held-out runs and scenarios.
//!
//! ## Key Features
//!
//! - **Thermal fit**: 1-state or 2-state lumped ODE per run, closed-form ridge
//!   on finite differences, with documented fallbacks
//! - **Power model**: screen, CPU and a temperature-driven leakage term fit by
//!   Huber IRLS; GPS/cellular OFF offsets calibrated from paired runs
//! - **Simulation**: Euler integration of temperature and coulomb-counted SOC
//! - **Evaluation**: scenario holdout, leave-one-run-out, leave-one-scenario-out
//! - **Corrections**: I²R, leakage/background, ANCOVA and covariate residual
//!   experiments scored leave-one-scenario-out
//!
//! ## Quick Start
//!
//! ```rust
//! use mpower::{fit_power_model, simulate_soc, Dataset, ModelConfig, Run, Sample};
//!
//! let samples: Vec<Sample> = (0..60)
//!     .map(|i| {
//!         let cpu = ((i % 5) * 200) as f64;
//!         let screen = ((i % 3) * 100) as f64;
//!         Sample {
//!             t_s: i as f64,
//!             dt_s: 1.0,
//!             soc_pct: Some(80.0),
//!             voltage_mv: Some(3900.0),
//!             temperature_cpu_c: Some(35.0),
//!             power_cpu_mw: Some(cpu),
//!             power_screen_mw: Some(screen),
//!             power_total_mw: Some(600.0 + cpu + 2.0 * screen),
//!             is_gps_on: Some(true),
//!             cellular_on: Some(true),
//!             ..Default::default()
//!         }
//!     })
//!     .collect();
//! let dataset = Dataset::new(vec![Run::new("run_1", "S1", samples)]);
//!
//! let config = ModelConfig::default();
//! let fit = fit_power_model(&dataset, &config)?;
//! let params = fit.params();
//!
//! let run = &fit.runs[0];
//! let soc = simulate_soc(&run.signals, &run.predict(&params), &config.battery);
//! assert!(soc.soc.iter().all(|s| (0.0..=1.0).contains(s)));
//! # Ok::<(), mpower::MpowerError>(())
//! ```
//!
//! ## Modules
//!
//! - [`sample`]: samples, runs, datasets and the per-run fill policy
//! - [`thermal`]: thermal state fitter
//! - [`simulate`]: temperature and SOC simulator
//! - [`power`]: power model fitter and subsystem offset calibration
//! - [`eval`]: cross-validation harness and full-data validation
//! - [`correction`]: secondary correction-term experiments
//! - [`regression`]: ridge / Huber IRLS core shared by every fitter
//! - [`artifact`]: flat parameter artifacts
//! - [`table`]: CSV input and result tables

// Modules
pub mod artifact;
pub mod config;
pub mod correction;
pub mod error;
pub mod eval;
pub mod features;
pub mod metrics;
pub mod power;
pub mod regression;
pub mod sample;
pub mod simulate;
pub mod table;
pub mod thermal;

// Re-exports for convenient access
pub use artifact::{FlatParams, ModelArtifact, ParamRecord};
pub use config::{
    AmbientEstimator, BatteryConfig, CorrectionConfig, CorrectionTerm, EvalConfig, EvalMode,
    ModelConfig, PowerConfig, ResistanceModel, TempSource, ThermalConfig, ThermalModelKind,
};
pub use correction::{
    evaluate_loso, run_records, CorrectionModel, CorrectionReport, CorrectionVariant, RunRecord,
};
pub use error::{DegenerateFit, DegenerateReason, FitOutcome, FitResult, MpowerError, Result};
pub use eval::{evaluate, partition, validate, Evaluation, FoldSpec, RunMetrics, RunValidation};
pub use metrics::{pearson, CovariateCorrelation, ErrorSummary};
pub use power::{fit_power_model, PowerFit, PowerModelParams, PreparedRun};
pub use sample::{Dataset, Run, RunSignals, Sample, Subsystem};
pub use simulate::{simulate_soc, simulate_temperature, SocTrajectory, TemperatureTrajectory};
pub use table::{read_dataset, write_dataset};
pub use thermal::{fit_thermal, ThermalParams, ThermalReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_artifact_replay_is_bit_exact() {
        let samples: Vec<Sample> = (0..50)
            .map(|i| Sample {
                t_s: i as f64 * 2.0,
                dt_s: 2.0,
                soc_pct: Some(90.0),
                voltage_mv: Some(4100.0 - i as f64),
                temperature_cpu_c: Some(30.0 + (i as f64 * 0.3).sin()),
                power_cpu_mw: Some(((i % 4) * 300) as f64),
                power_screen_mw: Some(200.0),
                power_total_mw: Some(700.0 + ((i % 4) * 280) as f64),
                is_gps_on: Some(true),
                cellular_on: Some(true),
                ..Default::default()
            })
            .collect();
        let run = Run::new("r", "S1", samples);
        let dataset = Dataset::new(vec![run.clone()]);
        let config = ModelConfig::default();
        let fit = fit_power_model(&dataset, &config).unwrap();
        let params = fit.params();
        let soc = simulate_soc(&fit.runs[0].signals, &fit.runs[0].predict(&params), &config.battery);

        let artifact = ModelArtifact::from_fit(&fit, &config);
        let json = serde_json::to_string(&artifact).unwrap();
        let loaded: ModelArtifact = serde_json::from_str(&json).unwrap();
        let thermal = loaded.thermal_params("r").unwrap().unwrap();
        let replay = PreparedRun::with_thermal(&power::fitting_view(&run), thermal, &config);
        let replay_soc = simulate_soc(
            &replay.signals,
            &replay.predict(&loaded.power_params().unwrap()),
            &config.battery,
        );
        assert_eq!(soc, replay_soc);
    }
}
