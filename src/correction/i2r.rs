//! I²R conduction-loss correction
//!
//! `P_loss = I² · R_int` with `R_int = R0 [+ R1·(1 - SOC)] [+ R2·max(0, T - Tref)]`.
//! Resistances are clamped nonnegative; the loss only adds power.

use super::{solve_fold, CorrectionModel, FoldModel, RunRecord, SolveOptions, Target};
use crate::config::{CorrectionConfig, ResistanceModel};
use crate::features::FeatureSet;

/// Loss features of a resistance parameterisation.
pub fn i2r_features(model: ResistanceModel, tref_c: f64) -> FeatureSet<'static, RunRecord> {
    let mut features = FeatureSet::new().with("i2", |r: &RunRecord| r.current_sq());
    if matches!(model, ResistanceModel::R0Rsoc | ResistanceModel::R0RsocRtpos) {
        features = features.with("i2_1m_soc", |r: &RunRecord| r.current_sq() * (1.0 - r.soc0));
    }
    if model == ResistanceModel::R0RsocRtpos {
        features = features.with("i2_dt_pos", move |r: &RunRecord| {
            r.current_sq() * (r.temp_cpu_c - tref_c).max(0.0)
        });
    }
    features
}

#[derive(Debug, Clone)]
pub struct I2rCorrection {
    pub model: ResistanceModel,
    pub tref_c: f64,
    pub ridge: f64,
    pub fit_scale: bool,
}

impl I2rCorrection {
    pub fn new(config: &CorrectionConfig) -> Self {
        Self {
            model: config.resistance_model,
            tref_c: config.tref_c,
            ridge: config.ridge,
            fit_scale: config.fit_scale,
        }
    }
}

impl CorrectionModel for I2rCorrection {
    fn name(&self) -> &'static str {
        "i2r"
    }

    fn usable(&self, r: &RunRecord) -> bool {
        r.discharging() && i2r_features(self.model, self.tref_c).is_complete(r)
    }

    fn fit_fold(&self, train: &[&RunRecord]) -> Option<FoldModel> {
        solve_fold(
            i2r_features(self.model, self.tref_c),
            train,
            Target::PositiveResidualW,
            SolveOptions {
                ridge: self.ridge,
                loss_terms: true,
                fit_scale: self.fit_scale,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::evaluate_loso;
    use crate::correction::tests::record;
    use approx::assert_relative_eq;

    fn config(model: ResistanceModel) -> CorrectionConfig {
        CorrectionConfig {
            resistance_model: model,
            ..CorrectionConfig::default()
        }
    }

    #[test]
    fn test_feature_columns() {
        assert_eq!(i2r_features(ResistanceModel::R0, 40.0).names(), vec!["i2"]);
        let full = i2r_features(ResistanceModel::R0RsocRtpos, 40.0);
        assert_eq!(full.names(), vec!["i2", "i2_1m_soc", "i2_dt_pos"]);
        let r = record("a", "S1", 0.0, 0.0, 2.0);
        // soc0 0.8, T 45
        assert_relative_eq!(full.row(&r)[1], 4.0 * 0.2, epsilon = 1e-12);
        assert_relative_eq!(full.row(&r)[2], 4.0 * 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_recovers_constant_resistance() {
        // 0.1 Ω loss on top of the base prediction.
        let records: Vec<RunRecord> = [0.4, 0.6, 0.8, 1.0, 1.2]
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let loss_mw = a * a * 0.1 * 1000.0;
                record(&format!("r{}", i), &format!("S{}", i), 1000.0 + loss_mw, 1000.0, *a)
            })
            .collect();
        let report = evaluate_loso(&I2rCorrection::new(&config(ResistanceModel::R0)), &records, 0.0);
        for run in &report.runs {
            assert_relative_eq!(run.resid_corr_mw, 0.0, epsilon = 1e-3);
        }
        assert!(report.corrected.mae < report.base.mae);
    }

    #[test]
    fn test_coefficients_nonnegative() {
        // Residual falls with current: an unconstrained fit would be negative.
        let records: Vec<RunRecord> = [0.4, 0.6, 0.8, 1.0]
            .iter()
            .enumerate()
            .map(|(i, a)| record(&format!("r{}", i), &format!("S{}", i), 1500.0 - 300.0 * a, 1000.0, *a))
            .collect();
        let model = I2rCorrection::new(&config(ResistanceModel::R0RsocRtpos));
        let train: Vec<&RunRecord> = records.iter().collect();
        let fold = model.fit_fold(&train).unwrap();
        assert!(fold.coefficients().iter().all(|(_, b)| *b >= 0.0));
        let report = evaluate_loso(&model, &records, 0.0);
        assert!(report.runs.iter().all(|r| r.correction_mw >= 0.0));
    }

    #[test]
    fn test_not_discharging_excluded() {
        let model = I2rCorrection::new(&config(ResistanceModel::R0));
        assert!(!model.usable(&record("a", "S1", 1.0, 0.0, 0.0)));
        assert!(model.usable(&record("a", "S1", 1.0, 0.0, 0.5)));
    }

    #[test]
    fn test_too_few_rows_predicts_zero() {
        let records = vec![
            record("a", "S1", 1500.0, 1000.0, 1.0),
            record("b", "S2", 1500.0, 1000.0, 1.0),
        ];
        let model = I2rCorrection::new(&config(ResistanceModel::R0RsocRtpos));
        let report = evaluate_loso(&model, &records, 0.0);
        assert!(report.runs.iter().all(|r| r.correction_mw == 0.0));
        assert!(report.folds.iter().all(|f| !f.fitted));
    }

    #[test]
    fn test_fit_scale_never_negative() {
        let records: Vec<RunRecord> = [0.5, 0.7, 0.9, 1.1]
            .iter()
            .enumerate()
            .map(|(i, a)| record(&format!("r{}", i), &format!("S{}", i), 1000.0 + 200.0 * a * a, 1000.0, *a))
            .collect();
        let mut c = config(ResistanceModel::R0);
        c.fit_scale = true;
        let train: Vec<&RunRecord> = records.iter().collect();
        let fold = I2rCorrection::new(&c).fit_fold(&train).unwrap();
        assert!(fold.scale() >= 0.0);
        assert_relative_eq!(fold.scale(), 1.0, epsilon = 1e-4);
    }
}
