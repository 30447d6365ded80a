// MPower Testdata - Synthetic device telemetry generator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # MPower Testdata
//!
//! Synthetic telemetry with a known ground truth, for exercising the MPower
//! fitters end to end.
//!
//! - **Device truth**: thermal and power parameters in the library's own
//!   types, plus an internal resistance the power model does not capture
//! - **Load patterns**: constant, square, piecewise steps, bounded random walk
//! - **Scenario suite**: idle, brightness levels, CPU load, and the GPS and
//!   cellular OFF/ON calibration pairs
//!
//! ## Quick Start
//!
//! ```rust
//! use mpower_testdata::{generate_dataset, standard_suite, GeneratorConfig};
//!
//! let config = GeneratorConfig::new().with_seed(42);
//! let dataset = generate_dataset(&config, &standard_suite(1));
//! assert_eq!(dataset.len(), 10);
//! ```

pub mod device;
pub mod generator;
pub mod patterns;
pub mod scenario;

pub use device::DeviceTruth;
pub use generator::{generate_dataset, Generator, GeneratorConfig, NoiseConfig, RunTrace};
pub use patterns::{LoadPattern, PatternState};
pub use scenario::{load_suite, save_suite, standard_suite, RunSpec};

/// Generate the standard suite and write it as a model input table.
pub fn write_standard_dataset(
    path: impl AsRef<std::path::Path>,
    config: &GeneratorConfig,
    repeats: usize,
) -> mpower::Result<mpower::Dataset> {
    let dataset = generate_dataset(config, &standard_suite(repeats));
    mpower::write_dataset(path, &dataset)?;
    Ok(dataset)
}
