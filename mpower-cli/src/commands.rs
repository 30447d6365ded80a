// MPower CLI - Command implementations
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

use crate::error::{CliError, Result};
use crate::{
    AdjustArgs, Command, CorrectArgs, EvalArgs, FitArgs, GenerateArgs, ModelArgs, SimulateArgs,
};
use mpower::correction::ancova::adjusted_means;
use mpower::eval::RunPrediction;
use mpower::power::{fitting_view, PreparedRun};
use mpower::simulate::soc_rmse_pct;
use mpower::table::write_rows;
use mpower::{
    evaluate, evaluate_loso, read_dataset, run_records, validate, CorrectionTerm, CorrectionVariant,
    Dataset, EvalMode, ModelArtifact, ModelConfig, RunRecord, ThermalModelKind,
};
use mpower_testdata::{
    generate_dataset, load_suite, standard_suite, DeviceTruth, GeneratorConfig,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub fn run(command: &Command, config_path: Option<&Path>) -> Result<()> {
    let base = match config_path {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            ModelConfig::from_json_file(path)?
        }
        None => ModelConfig::default(),
    };
    match command {
        Command::Fit(args) => fit(args, base),
        Command::Simulate(args) => simulate(args, base),
        Command::Eval(args) => eval(args, base),
        Command::Correct(args) => correct(args, base),
        Command::Adjust(args) => adjust(args, base),
        Command::Generate(args) => generate(args),
    }
}

/// Overlay command-line model flags and validate the result.
fn apply_model_args(mut config: ModelConfig, args: &ModelArgs) -> Result<ModelConfig> {
    if let Some(s) = &args.thermal_model {
        config.thermal.model = ThermalModelKind::parse(s)
            .ok_or_else(|| CliError::invalid("--thermal-model", format!("unknown model {}", s)))?;
    }
    if let Some(r) = args.ridge {
        config.power.ridge = r;
    }
    if let Some(d) = args.leak_doubling_c {
        config.power.leak_doubling_c = d;
    }
    if let Some(c) = args.c_eff_mah {
        config.battery.c_eff_mah = c;
    }
    config.validate()?;
    Ok(config)
}

fn load(input: &Path) -> Result<Dataset> {
    let dataset = read_dataset(input)?;
    info!(
        "read {} samples in {} runs from {}",
        dataset.sample_count(),
        dataset.len(),
        input.display()
    );
    Ok(dataset)
}

/// Headline numbers of a full-data fit.
#[derive(Debug, Serialize)]
struct FitSummary {
    n_runs: usize,
    n_rows: usize,
    n_base_rows: usize,
    irls_iterations: usize,
    irls_converged: bool,
    degenerate: Option<String>,
    thermal_fallbacks: usize,
}

fn fit(args: &FitArgs, config: ModelConfig) -> Result<()> {
    let config = apply_model_args(config, &args.model)?;
    let dataset = load(&args.input)?;
    fs::create_dir_all(&args.out_dir)?;

    let validation = validate(&dataset, &config)?;
    let fit = &validation.fit;
    let reports = validation.thermal_reports(&config);

    ModelArtifact::from_fit(fit, &config).save(args.out_dir.join("model.json"))?;
    write_rows(args.out_dir.join("thermal_fits.csv"), &reports)?;
    write_rows(args.out_dir.join("offsets.csv"), &fit.calibrations)?;
    write_rows(args.out_dir.join("validation.csv"), &validation.runs)?;
    if !args.no_samples {
        write_rows(args.out_dir.join("samples.csv"), &validation.sample_rows())?;
    }

    let summary = FitSummary {
        n_runs: fit.runs.len(),
        n_rows: fit.n_rows,
        n_base_rows: fit.n_base_rows,
        irls_iterations: fit.irls_iterations,
        irls_converged: fit.irls_converged,
        degenerate: fit.outcome.as_ref().err().map(|d| d.reason.to_string()),
        thermal_fallbacks: reports.iter().filter(|r| r.is_fallback()).count(),
    };
    fs::write(
        args.out_dir.join("fit_summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    if let Some(reason) = &summary.degenerate {
        warn!("power model fell back to its default: {}", reason);
    }
    for run in &validation.runs {
        info!(
            "{}: SOC final meas {:.1}% sim {:.1}% rmse {:.2}pp",
            run.run_name, run.soc_final_meas_pct, run.soc_final_sim_pct, run.rmse_soc_pct
        );
    }
    info!("fit written to {}", args.out_dir.display());
    Ok(())
}

fn simulate(args: &SimulateArgs, mut config: ModelConfig) -> Result<()> {
    let artifact = ModelArtifact::load(&args.artifact)?;
    config.thermal.leak_temp_mix = artifact.leak_temp_mix;
    if let Some(kind) = ThermalModelKind::parse(&artifact.thermal_model) {
        config.thermal.model = kind;
    }
    let params = artifact.power_params()?;
    let dataset = load(&args.input)?;

    let mut rows = Vec::new();
    for run in dataset.runs() {
        let view = fitting_view(run);
        if view.is_empty() {
            warn!("run {} has no usable samples; skipped", run.name());
            continue;
        }
        let prepared = match artifact.thermal_params(run.name())? {
            Some(thermal) => PreparedRun::with_thermal(&view, thermal, &config),
            None => {
                info!("run {} not in artifact; fitting its thermal model", run.name());
                PreparedRun::new(&view, &config)
            }
        };
        let prediction = RunPrediction::new(prepared, &params, &config.battery);
        info!(
            "{}: final SOC {:.1}%, SOC rmse {:.2}pp",
            run.name(),
            prediction.soc.last().unwrap_or(f64::NAN) * 100.0,
            soc_rmse_pct(&prediction.prepared.signals, &prediction.soc)
        );
        rows.extend(prediction.sample_rows());
    }
    write_rows(&args.out, &rows)?;
    info!("simulation written to {}", args.out.display());
    Ok(())
}

fn eval(args: &EvalArgs, config: ModelConfig) -> Result<()> {
    let mut config = apply_model_args(config, &args.model)?;
    if let Some(m) = &args.mode {
        config.eval.mode =
            EvalMode::parse(m).ok_or_else(|| CliError::invalid("--mode", format!("unknown mode {}", m)))?;
    }
    if let Some(prefix) = &args.holdout_prefix {
        config.eval.holdout_prefix = prefix.clone();
    }
    let dataset = load(&args.input)?;
    fs::create_dir_all(&args.out_dir)?;

    let evaluation = evaluate(&dataset, &config)?;
    evaluation.write_summary(args.out_dir.join("eval_summary.csv"))?;
    evaluation.write_run_metrics(args.out_dir.join("eval_runs.csv"))?;
    for fold in &evaluation.folds {
        info!(
            "{}: {} test runs, power MAE {:.1} mW{}",
            fold.summary.split,
            fold.summary.n_test_runs,
            fold.summary.power_sample_mae_mw,
            if fold.summary.degenerate { " (degenerate)" } else { "" }
        );
    }
    info!("{} folds written to {}", evaluation.folds.len(), args.out_dir.display());
    Ok(())
}

/// Held-out run records: every run scored leave-one-scenario-out.
fn heldout_records(dataset: &Dataset, config: &ModelConfig) -> Result<Vec<RunRecord>> {
    let mut loso = config.clone();
    loso.eval.mode = EvalMode::LeaveOneScenarioOut;
    let evaluation = evaluate(dataset, &loso)?;
    Ok(run_records(dataset, &evaluation.run_metrics(), config))
}

fn correct(args: &CorrectArgs, config: ModelConfig) -> Result<()> {
    let mut config = apply_model_args(config, &args.model)?;
    if let Some(terms) = &args.terms {
        config.correction.terms = CorrectionTerm::parse_set(terms)?;
    }
    if args.fit_scale {
        config.correction.fit_scale = true;
    }
    if let Some(clip) = args.clip_frac {
        config.correction.clip_frac_of_meas = clip;
    }
    config.validate()?;

    let variants = if args.variant.eq_ignore_ascii_case("all") {
        CorrectionVariant::ALL.to_vec()
    } else {
        vec![CorrectionVariant::parse(&args.variant)
            .ok_or_else(|| CliError::invalid("--variant", format!("unknown variant {}", args.variant)))?]
    };

    let dataset = load(&args.input)?;
    fs::create_dir_all(&args.out_dir)?;
    let records = heldout_records(&dataset, &config)?;
    write_rows(args.out_dir.join("run_records.csv"), &records)?;

    for variant in variants {
        let model = variant.build(&config.correction, &records);
        let report = evaluate_loso(model.as_ref(), &records, config.correction.clip_frac_of_meas);
        info!("{}", report.base.report("base"));
        info!("{}", report.corrected.report(&format!("{} corrected", report.variant)));
        report.write_all(&args.out_dir)?;
    }
    info!("correction reports written to {}", args.out_dir.display());
    Ok(())
}

fn parse_reference(s: &str) -> Result<(String, f64)> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| CliError::invalid("--reference", format!("expected name=value, got {}", s)))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| CliError::invalid("--reference", format!("not a number: {}", value)))?;
    Ok((name.trim().to_string(), value))
}

fn adjust(args: &AdjustArgs, config: ModelConfig) -> Result<()> {
    let mut config = apply_model_args(config, &args.model)?;
    if args.keep_first {
        config.correction.drop_first = false;
    }
    let overrides: BTreeMap<String, f64> = args
        .references
        .iter()
        .map(|s| parse_reference(s))
        .collect::<Result<_>>()?;

    let dataset = load(&args.input)?;
    fs::create_dir_all(&args.out_dir)?;

    let validation = validate(&dataset, &config)?;
    let records: Vec<RunRecord> = validation
        .predictions
        .iter()
        .filter_map(|p| {
            let run = dataset.get(&p.prepared.name)?;
            Some(RunRecord::from_run(
                run,
                p.measured_mean_mw(),
                p.predicted_mean_mw(),
                config.correction.temp_source,
                config.battery.nominal_voltage_v,
            ))
        })
        .collect();

    let adjusted = adjusted_means(&records, &config.correction, &config.power.huber, &overrides)?;
    adjusted.write_scenarios(args.out_dir.join("ancova_scenarios.csv"))?;
    adjusted.write_coefficients(args.out_dir.join("ancova_coefficients.csv"))?;
    for s in &adjusted.scenarios {
        info!(
            "{}: raw {:.1} mW, adjusted {:.1} mW (delta {:+.1})",
            s.scenario, s.raw_mean, s.adjusted_mean, s.adjustment_delta
        );
    }
    Ok(())
}

fn generate(args: &GenerateArgs) -> Result<()> {
    let specs = match &args.suite {
        Some(path) => load_suite(path)?,
        None => standard_suite(args.repeats),
    };
    let mut config = if args.exact {
        GeneratorConfig::exact(args.seed)
    } else {
        GeneratorConfig::new().with_seed(args.seed)
    };
    if args.one_state {
        config = config.with_device(DeviceTruth::one_state());
    }
    let dataset = generate_dataset(&config, &specs);
    mpower::write_dataset(&args.out, &dataset)?;
    info!(
        "wrote {} runs ({} samples) to {}",
        dataset.len(),
        dataset.sample_count(),
        args.out.display()
    );
    Ok(())
}
