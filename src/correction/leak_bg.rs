//! Structured leakage and background correction
//!
//! Additive terms chosen from the configured set:
//!
//! - `i2r`: the three conduction-loss columns of [`super::i2r`]
//! - `leak`: `a · V · exp(γ (T - Tref))`, with γ picked from a grid by
//!   training error
//! - `background`: constant draw
//!
//! These are weakly identifiable against each other and against the base
//! model, so the clip fraction is the usual guard against over-correction.

use super::i2r::i2r_features;
use super::{solve_fold, CorrectionModel, FoldModel, RunRecord, SolveOptions, Target};
use crate::config::{CorrectionConfig, CorrectionTerm, ResistanceModel};
use crate::features::FeatureSet;
use std::collections::BTreeSet;

/// Features of the selected terms at leakage rate `gamma`.
pub fn leak_bg_features(
    terms: &BTreeSet<CorrectionTerm>,
    gamma: f64,
    tref_c: f64,
) -> FeatureSet<'static, RunRecord> {
    let mut features = if terms.contains(&CorrectionTerm::I2r) {
        i2r_features(ResistanceModel::R0RsocRtpos, tref_c)
    } else {
        FeatureSet::new()
    };
    if terms.contains(&CorrectionTerm::Leak) {
        features = features.with("leak_v_exp", move |r: &RunRecord| {
            r.voltage_mean_v * (gamma * (r.temp_cpu_c - tref_c)).exp()
        });
    }
    if terms.contains(&CorrectionTerm::Background) {
        features = features.with("background", |_| 1.0);
    }
    features
}

#[derive(Debug, Clone)]
pub struct LeakBackgroundCorrection {
    pub terms: BTreeSet<CorrectionTerm>,
    pub gammas: Vec<f64>,
    pub tref_c: f64,
    pub ridge: f64,
    pub fit_scale: bool,
}

impl LeakBackgroundCorrection {
    pub fn new(config: &CorrectionConfig) -> Self {
        // γ only matters when the leak column is present.
        let gammas = if config.terms.contains(&CorrectionTerm::Leak) {
            config.gamma_grid.values()
        } else {
            vec![0.0]
        };
        Self {
            terms: config.terms.clone(),
            gammas,
            tref_c: config.tref_c,
            ridge: config.ridge,
            fit_scale: config.fit_scale,
        }
    }
}

impl CorrectionModel for LeakBackgroundCorrection {
    fn name(&self) -> &'static str {
        "leak_bg"
    }

    fn usable(&self, r: &RunRecord) -> bool {
        r.discharging()
            && r.voltage_mean_v.is_finite()
            && r.soc0.is_finite()
            && r.temp_cpu_c.is_finite()
    }

    fn fit_fold(&self, train: &[&RunRecord]) -> Option<FoldModel> {
        let options = SolveOptions {
            ridge: self.ridge,
            loss_terms: true,
            fit_scale: self.fit_scale,
        };
        let mut best: Option<FoldModel> = None;
        for &gamma in &self.gammas {
            let features = leak_bg_features(&self.terms, gamma, self.tref_c);
            let Some(fold) = solve_fold(features, train, Target::PositiveResidualW, options) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| fold.train_rmse_mw < b.train_rmse_mw) {
                best = Some(fold.with_gamma(gamma));
            }
        }
        best
    }
}
