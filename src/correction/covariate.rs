//! Covariate residual correction
//!
//! Ridge regression of the signed residual on `intercept + start-state
//! covariates`. Unlike the loss terms this may lower a prediction.

use super::{solve_fold, CorrectionModel, Covariate, FoldModel, RunRecord, SolveOptions, Target};
use crate::config::CorrectionConfig;
use crate::features::FeatureSet;

pub fn covariate_features(covariates: &[Covariate]) -> FeatureSet<'static, RunRecord> {
    let mut features = FeatureSet::new().with_intercept();
    for &c in covariates {
        features = features.with(c.name(), move |r: &RunRecord| c.value(r));
    }
    features
}

#[derive(Debug, Clone)]
pub struct CovariateCorrection {
    pub covariates: Vec<Covariate>,
    pub ridge: f64,
}

impl CovariateCorrection {
    pub fn new(config: &CorrectionConfig, records: &[RunRecord]) -> Self {
        Self {
            covariates: Covariate::available(records, &Covariate::START_STATE),
            ridge: config.covariate_ridge,
        }
    }
}

impl CorrectionModel for CovariateCorrection {
    fn name(&self) -> &'static str {
        "covariate"
    }

    fn usable(&self, r: &RunRecord) -> bool {
        r.resid_mw().is_finite() && self.covariates.iter().all(|c| c.value(r).is_finite())
    }

    fn fit_fold(&self, train: &[&RunRecord]) -> Option<FoldModel> {
        solve_fold(
            covariate_features(&self.covariates),
            train,
            Target::ResidualMw,
            SolveOptions {
                ridge: self.ridge,
                loss_terms: false,
                fit_scale: false,
            },
        )
    }
}
