// MPower CLI - Batch runner for device power and thermal models
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # MPower CLI
//!
//! Batch commands over the model input table.
//!
//! ## Usage
//!
//! ```bash
//! # Synthesize a dataset, fit it and cross-validate
//! mpower generate --out data.csv --seed 42 --repeats 3
//! mpower fit --input data.csv --out-dir results/
//! mpower eval --input data.csv --out-dir results/ --mode all
//!
//! # Replay a saved model on new data
//! mpower simulate --input new.csv --artifact results/model.json --out sim.csv
//!
//! # Correction-term experiments and adjusted means
//! mpower correct --input data.csv --out-dir results/ --variant all --fit-scale
//! mpower adjust --input data.csv --out-dir results/ --reference soc0_pct=80
//! ```

mod commands;
mod error;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// MPower device power and thermal modeling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON model configuration; defaults apply when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fit on the whole dataset, validate in-sample and save the model artifact
    Fit(FitArgs),
    /// Replay a saved model artifact on a dataset
    Simulate(SimulateArgs),
    /// Cross-validate the thermal and power fit
    Eval(EvalArgs),
    /// Score correction-term variants leave-one-scenario-out
    Correct(CorrectArgs),
    /// Covariate-adjusted scenario means
    Adjust(AdjustArgs),
    /// Write a synthetic dataset
    Generate(GenerateArgs),
}

/// Model overrides shared by the fitting commands.
#[derive(Args, Debug, Clone, Default)]
pub struct ModelArgs {
    /// Thermal model variant (1state, 2state)
    #[arg(long)]
    pub thermal_model: Option<String>,

    /// Ridge strength of the power model regression
    #[arg(long)]
    pub ridge: Option<f64>,

    /// Leakage doubling temperature (°C)
    #[arg(long)]
    pub leak_doubling_c: Option<f64>,

    /// Effective battery capacity (mAh)
    #[arg(long)]
    pub c_eff_mah: Option<f64>,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    /// Model input table (CSV)
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "results")]
    pub out_dir: PathBuf,

    /// Skip the per-sample prediction dump
    #[arg(long)]
    pub no_samples: bool,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(short, long)]
    pub input: PathBuf,

    /// Model artifact written by `fit`
    #[arg(short, long)]
    pub artifact: PathBuf,

    /// Per-sample output table
    #[arg(long, default_value = "simulation.csv")]
    pub out: PathBuf,
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    #[arg(short, long)]
    pub input: PathBuf,

    #[arg(short, long, default_value = "results")]
    pub out_dir: PathBuf,

    /// Partitioning (holdout, loro, loso, all)
    #[arg(long)]
    pub mode: Option<String>,

    /// Scenario prefix iterated by the holdout mode
    #[arg(long)]
    pub holdout_prefix: Option<String>,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Args, Debug)]
pub struct CorrectArgs {
    #[arg(short, long)]
    pub input: PathBuf,

    #[arg(short, long, default_value = "results")]
    pub out_dir: PathBuf,

    /// Variant (i2r, leak_bg, ancova, covariate, all)
    #[arg(long, default_value = "all")]
    pub variant: String,

    /// Comma-separated term set of the leak/background variant (i2r, leak, base)
    #[arg(long)]
    pub terms: Option<String>,

    /// Fit a non-negative scale on the training fold
    #[arg(long)]
    pub fit_scale: bool,

    /// Cap each correction at this fraction of measured power (0 disables)
    #[arg(long)]
    pub clip_frac: Option<f64>,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Args, Debug)]
pub struct AdjustArgs {
    #[arg(short, long)]
    pub input: PathBuf,

    #[arg(short, long, default_value = "results")]
    pub out_dir: PathBuf,

    /// Reference covariate value, `name=value`; repeatable
    #[arg(long = "reference")]
    pub references: Vec<String>,

    /// Keep every scenario dummy instead of dropping the first
    #[arg(long)]
    pub keep_first: bool,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Output table (CSV)
    #[arg(long, default_value = "synthetic.csv")]
    pub out: PathBuf,

    /// Random seed
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Runs per scenario of the standard suite
    #[arg(long, default_value = "2")]
    pub repeats: usize,

    /// JSON list of run specs replacing the standard suite
    #[arg(long)]
    pub suite: Option<PathBuf>,

    /// Disable measurement noise and SOC quantization
    #[arg(long)]
    pub exact: bool,

    /// Single-node thermal device
    #[arg(long)]
    pub one_state: bool,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    info!("MPower v{}", mpower::VERSION);

    match commands::run(&cli.command, cli.config.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
