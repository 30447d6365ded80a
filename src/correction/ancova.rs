//! ANCOVA-style scenario adjustment
//!
//! Two uses of the same design, `intercept + scenario dummies + covariates`:
//!
//! - [`AncovaCorrection`] fits the positive residual leave-one-scenario-out.
//!   A held-out scenario has no dummy of its own and takes the mean fitted
//!   scenario effect of the training scenarios.
//! - [`adjusted_means`] fits measured mean power on all runs with Huber IRLS
//!   and reports each scenario's mean at a common reference state.

use super::{solve_fold, CorrectionModel, Covariate, FoldModel, RunRecord, SolveOptions, Target};
use crate::config::{CorrectionConfig, HuberConfig};
use crate::error::{MpowerError, Result};
use crate::features::FeatureSet;
use crate::regression::HuberIrls;
use crate::sample::median;
use crate::table::write_rows;
use log::info;
use nalgebra::DVector;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

fn dummy_name(scenario: &str) -> String {
    format!("scen_{}", scenario)
}

/// Design over the given scenarios. With `drop_first` the first (sorted)
/// scenario is the baseline and has no dummy.
pub fn ancova_features(
    scenarios: &BTreeSet<String>,
    covariates: &[Covariate],
    drop_first: bool,
) -> FeatureSet<'static, RunRecord> {
    let mut features = FeatureSet::new().with_intercept();
    for scenario in scenarios.iter().skip(usize::from(drop_first)) {
        let s = scenario.clone();
        features = features.with(dummy_name(scenario), move |r: &RunRecord| {
            if r.scenario == s {
                1.0
            } else {
                0.0
            }
        });
    }
    for &c in covariates {
        features = features.with(c.name(), move |r: &RunRecord| c.value(r));
    }
    features
}

#[derive(Debug, Clone)]
pub struct AncovaCorrection {
    pub covariates: Vec<Covariate>,
    pub ridge: f64,
    pub drop_first: bool,
    pub fit_scale: bool,
}

impl AncovaCorrection {
    /// Covariates are the start-state ones available for every record.
    pub fn new(config: &CorrectionConfig, records: &[RunRecord]) -> Self {
        Self {
            covariates: Covariate::available(records, &Covariate::START_STATE),
            ridge: config.ridge,
            drop_first: config.drop_first,
            fit_scale: config.fit_scale,
        }
    }
}

impl CorrectionModel for AncovaCorrection {
    fn name(&self) -> &'static str {
        "ancova"
    }

    fn usable(&self, r: &RunRecord) -> bool {
        r.resid_mw().is_finite() && self.covariates.iter().all(|c| c.value(r).is_finite())
    }

    /// Coefficients are not clamped, so ANCOVA corrections are signed.
    fn fit_fold(&self, train: &[&RunRecord]) -> Option<FoldModel> {
        let scenarios: BTreeSet<String> = train.iter().map(|r| r.scenario.clone()).collect();
        let features = ancova_features(&scenarios, &self.covariates, self.drop_first);
        let dummies: Vec<String> = scenarios.iter().map(|s| dummy_name(s)).collect();
        let fold = solve_fold(
            features,
            train,
            Target::PositiveResidualW,
            SolveOptions {
                ridge: self.ridge,
                loss_terms: false,
                fit_scale: self.fit_scale,
            },
        )?;

        // Dropped baseline contributes an effect of zero.
        let coefs: BTreeMap<String, f64> = fold.coefficients().into_iter().collect();
        let effects: Vec<f64> = dummies
            .iter()
            .map(|d| coefs.get(d).copied().unwrap_or(0.0))
            .collect();
        let mean_effect = effects.iter().sum::<f64>() / effects.len().max(1) as f64;
        Some(fold.with_offset(mean_effect))
    }
}

/// Raw and adjusted mean of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioAdjustment {
    pub scenario: String,
    pub n: usize,
    pub raw_mean: f64,
    pub raw_std: f64,
    pub raw_min: f64,
    pub raw_max: f64,
    pub raw_cv: f64,
    pub raw_ratio_max_min: f64,
    pub adjusted_mean: f64,
    pub adjustment_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct CoefficientRow<'a> {
    term: &'a str,
    coef: f64,
}

/// Full-data adjusted-means report.
#[derive(Debug, Clone)]
pub struct AdjustedMeans {
    pub scenarios: Vec<ScenarioAdjustment>,
    pub coefficients: Vec<(String, f64)>,
    pub baseline_scenario: Option<String>,
    pub reference: BTreeMap<String, f64>,
    pub n_fit: usize,
    pub p: usize,
}

impl AdjustedMeans {
    pub fn write_scenarios(&self, path: impl AsRef<Path>) -> Result<()> {
        write_rows(path, &self.scenarios)
    }

    pub fn write_coefficients(&self, path: impl AsRef<Path>) -> Result<()> {
        let rows: Vec<CoefficientRow<'_>> = self
            .coefficients
            .iter()
            .map(|(term, coef)| CoefficientRow { term, coef: *coef })
            .collect();
        write_rows(path, &rows)
    }
}

/// Per-scenario sample statistics of the finite values.
fn raw_stats(values: &[f64]) -> (usize, f64, f64, f64, f64) {
    let v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    let n = v.len();
    if n == 0 {
        return (0, f64::NAN, f64::NAN, f64::NAN, f64::NAN);
    }
    let mean = v.iter().sum::<f64>() / n as f64;
    let std = if n > 1 {
        (v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        f64::NAN
    };
    let min = v.iter().copied().fold(f64::INFINITY, f64::min);
    let max = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (n, mean, std, min, max)
}

/// Fit `p_meas_mean ~ scenario + covariates` with Huber IRLS and evaluate
/// each scenario at the reference covariates: the median of each covariate
/// unless `reference_overrides` names it.
pub fn adjusted_means(
    records: &[RunRecord],
    config: &CorrectionConfig,
    huber: &HuberConfig,
    reference_overrides: &BTreeMap<String, f64>,
) -> Result<AdjustedMeans> {
    let covariates = Covariate::available(records, &Covariate::START_STATE);
    let rows: Vec<&RunRecord> = records
        .iter()
        .filter(|r| r.p_meas_mean_mw.is_finite())
        .collect();
    let scenarios: BTreeSet<String> = rows.iter().map(|r| r.scenario.clone()).collect();
    let features = ancova_features(&scenarios, &covariates, config.drop_first);
    let p = features.len();
    if rows.len() < p + 1 {
        return Err(MpowerError::Underdetermined {
            rows: rows.len(),
            params: p,
        });
    }

    let x = features.design(rows.iter().copied());
    let y = DVector::from_iterator(rows.len(), rows.iter().map(|r| r.p_meas_mean_mw));
    let fit = HuberIrls::new(huber, config.ridge).fit(&x, &y)?;

    let mut reference = BTreeMap::new();
    for c in &covariates {
        let values: Vec<f64> = rows.iter().map(|r| c.value(r)).collect();
        let value = reference_overrides
            .get(c.name())
            .copied()
            .filter(|v| v.is_finite())
            .or_else(|| median(&values))
            .unwrap_or(f64::NAN);
        reference.insert(c.name().to_string(), value);
    }

    let baseline_scenario = if config.drop_first {
        scenarios.iter().next().cloned()
    } else {
        None
    };
    let coefficients: Vec<(String, f64)> = features
        .names()
        .into_iter()
        .map(str::to_string)
        .zip(fit.beta.iter().copied())
        .collect();
    let coef = |name: &str| {
        features
            .index_of(name)
            .map_or(0.0, |i| fit.beta[i])
    };

    let adjustments = scenarios
        .iter()
        .map(|scenario| {
            let mut adjusted = coef("intercept") + coef(&dummy_name(scenario));
            for c in &covariates {
                adjusted += coef(c.name()) * reference[c.name()];
            }
            let values: Vec<f64> = rows
                .iter()
                .filter(|r| &r.scenario == scenario)
                .map(|r| r.p_meas_mean_mw)
                .collect();
            let (n, mean, std, min, max) = raw_stats(&values);
            ScenarioAdjustment {
                scenario: scenario.clone(),
                n,
                raw_mean: mean,
                raw_std: std,
                raw_min: min,
                raw_max: max,
                raw_cv: std / mean,
                raw_ratio_max_min: max / min,
                adjusted_mean: adjusted,
                adjustment_delta: mean - adjusted,
            }
        })
        .collect();

    info!(
        "adjusted means over {} scenarios: n_fit={} p={} baseline={:?}",
        scenarios.len(),
        rows.len(),
        p,
        baseline_scenario
    );

    Ok(AdjustedMeans {
        scenarios: adjustments,
        coefficients,
        baseline_scenario,
        reference,
        n_fit: rows.len(),
        p,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::evaluate_loso;
    use crate::correction::tests::record;
    use approx::assert_relative_eq;

    /// Scenario effect plus a SOC slope of 10 mW per SOC point.
    fn records() -> Vec<RunRecord> {
        let mut out = Vec::new();
        for (s, effect) in [("S1", 0.0), ("S2", 200.0), ("S3", 500.0)] {
            for (k, soc) in [0.5, 0.7, 0.9].iter().enumerate() {
                let mut r = record(&format!("{}_{}", s, k), s, 0.0, 1000.0, 0.5);
                r.soc0 = *soc;
                r.temp_batt_c = f64::NAN;
                r.p_meas_mean_mw = 1000.0 + effect + 10.0 * soc * 100.0;
                out.push(r);
            }
        }
        out
    }

    fn config() -> CorrectionConfig {
        CorrectionConfig::default()
    }

    #[test]
    fn test_adjusted_means_at_reference() {
        let adj = adjusted_means(&records(), &config(), &HuberConfig::default(), &BTreeMap::new()).unwrap();
        assert_eq!(adj.baseline_scenario.as_deref(), Some("S1"));
        // Voltage and CPU temperature are constant and collinear with the
        // intercept; only the scenario differences are identified.
        let s1 = adj.scenarios[0].adjusted_mean;
        assert_relative_eq!(adj.scenarios[1].adjusted_mean - s1, 200.0, epsilon = 1e-3);
        assert_relative_eq!(adj.scenarios[2].adjusted_mean - s1, 500.0, epsilon = 1e-3);
        assert_eq!(adj.reference["soc0_pct"], 70.0);
        assert!(!adj.reference.contains_key("thermal_batt_C"));
        assert_relative_eq!(adj.scenarios[0].raw_mean, 1700.0, epsilon = 1e-9);
        assert_eq!(adj.scenarios[0].n, 3);
        assert_relative_eq!(adj.scenarios[0].raw_ratio_max_min, 1900.0 / 1500.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reference_override() {
        let mut over = BTreeMap::new();
        over.insert("soc0_pct".to_string(), 50.0);
        let adj = adjusted_means(&records(), &config(), &HuberConfig::default(), &over).unwrap();
        assert_eq!(adj.reference["soc0_pct"], 50.0);
        assert_relative_eq!(adj.scenarios[0].adjusted_mean, 1500.0, epsilon = 1e-2);
        assert_relative_eq!(adj.scenarios[0].adjustment_delta, 200.0, epsilon = 1e-2);
    }

    #[test]
    fn test_too_few_rows() {
        let recs: Vec<RunRecord> = records().into_iter().take(2).collect();
        assert!(matches!(
            adjusted_means(&recs, &config(), &HuberConfig::default(), &BTreeMap::new()),
            Err(MpowerError::Underdetermined { .. })
        ));
    }

    #[test]
    fn test_loso_uses_mean_training_effect() {
        // Residual is a pure scenario effect; held-out runs get the mean of
        // the training effects on top of the intercept.
        let mut recs = Vec::new();
        for (s, resid) in [("S1", 100.0), ("S2", 300.0), ("S3", 500.0)] {
            for k in 0..3 {
                recs.push(record(&format!("{}_{}", s, k), s, 1000.0 + resid, 1000.0, 0.5));
            }
        }
        let c = CorrectionConfig {
            ridge: 1e-9,
            ..CorrectionConfig::default()
        };
        let model = AncovaCorrection {
            covariates: Vec::new(),
            ..AncovaCorrection::new(&c, &recs)
        };
        let report = evaluate_loso(&model, &recs, 0.0);
        // Held-out S1 trains on S2 (baseline, 300) and S3 (+200): 300 + 100.
        assert_relative_eq!(report.runs[0].correction_mw, 400.0, epsilon = 1e-3);
        // Held-out S3 trains on S1 (100) and S2 (+200): 100 + 100.
        assert_relative_eq!(report.runs[8].correction_mw, 200.0, epsilon = 1e-3);
    }

    #[test]
    fn test_loso_correction_can_be_negative() {
        // Residual falls 10 mW per SOC point; a fuller held-out run extrapolates
        // below zero and keeps the sign.
        let mut recs = Vec::new();
        for s in ["S1", "S2"] {
            for (k, soc) in [0.5, 0.7, 0.9].iter().enumerate() {
                let mut r = record(&format!("{}_{}", s, k), s, 0.0, 1000.0, 0.5);
                r.soc0 = *soc;
                r.p_meas_mean_mw = 1000.0 + 400.0 - 1000.0 * (soc - 0.5);
                recs.push(r);
            }
        }
        for k in 0..3 {
            let mut r = record(&format!("S3_{}", k), "S3", 1000.0, 1000.0, 0.5);
            r.soc0 = 1.0;
            recs.push(r);
        }
        let c = CorrectionConfig {
            ridge: 1e-9,
            fit_scale: false,
            ..CorrectionConfig::default()
        };
        let model = AncovaCorrection {
            covariates: vec![Covariate::SocPct],
            ..AncovaCorrection::new(&c, &recs)
        };
        let report = evaluate_loso(&model, &recs, 0.0);
        for run in &report.runs[6..] {
            assert_relative_eq!(run.correction_mw, -100.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_feature_names() {
        let scen: BTreeSet<String> = ["S1", "S2"].iter().map(|s| s.to_string()).collect();
        let f = ancova_features(&scen, &[Covariate::SocPct], true);
        assert_eq!(f.names(), vec!["intercept", "scen_S2", "soc0_pct"]);
        let f = ancova_features(&scen, &[], false);
        assert_eq!(f.names(), vec!["intercept", "scen_S1", "scen_S2"]);
    }
}
