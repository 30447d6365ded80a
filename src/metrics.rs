//! Error metrics for model evaluation
//!
//! This module provides the summaries shared by the evaluation harness and
//! the correction-term experiments: MAE/RMSE/bias of residuals, SOC RMSE,
//! and Pearson correlation of residuals against covariates.

use serde::{Deserialize, Serialize};

/// Summary of a residual series (measured - predicted).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Number of finite residuals
    pub n: usize,
    /// Mean absolute error
    pub mae: f64,
    /// Root mean squared error
    pub rmse: f64,
    /// Mean residual
    pub bias: f64,
}

impl ErrorSummary {
    /// Summarize the finite entries of `residuals`. Empty input gives NaN
    /// statistics with `n = 0`.
    pub fn from_residuals(residuals: &[f64]) -> Self {
        let finite: Vec<f64> = residuals.iter().copied().filter(|r| r.is_finite()).collect();
        if finite.is_empty() {
            return Self {
                n: 0,
                mae: f64::NAN,
                rmse: f64::NAN,
                bias: f64::NAN,
            };
        }
        let n = finite.len() as f64;
        Self {
            n: finite.len(),
            mae: finite.iter().map(|r| r.abs()).sum::<f64>() / n,
            rmse: (finite.iter().map(|r| r * r).sum::<f64>() / n).sqrt(),
            bias: finite.iter().sum::<f64>() / n,
        }
    }

    /// Human-readable one-liner.
    pub fn report(&self, label: &str) -> String {
        format!(
            "{}: n={} mae={:.2} rmse={:.2} bias={:.2}",
            label, self.n, self.mae, self.rmse, self.bias
        )
    }
}

/// Mean of the finite values; NaN when there are none.
pub fn finite_mean(values: &[f64]) -> f64 {
    let (sum, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Pearson correlation over finite pairs. NaN with fewer than three pairs or
/// zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect();
    if pairs.len() < 3 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in &pairs {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    let den = (sxx * syy).sqrt();
    if den > 0.0 {
        sxy / den
    } else {
        f64::NAN
    }
}

/// Residual-covariate correlation before and after a correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateCorrelation {
    pub covariate: String,
    pub r_before: f64,
    pub r_after: f64,
    /// Absolute correlation dropped; false when either side is NaN.
    pub improved: bool,
}

impl CovariateCorrelation {
    pub fn compute(name: &str, covariate: &[f64], before: &[f64], after: &[f64]) -> Self {
        let r_before = pearson(covariate, before);
        let r_after = pearson(covariate, after);
        Self {
            covariate: name.to_string(),
            r_before,
            r_after,
            improved: r_after.abs() < r_before.abs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_summary() {
        let s = ErrorSummary::from_residuals(&[1.0, -1.0, 3.0, f64::NAN]);
        assert_eq!(s.n, 3);
        assert!((s.mae - 5.0 / 3.0).abs() < 1e-12);
        assert!((s.rmse - (11.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((s.bias - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_error_summary_empty() {
        let s = ErrorSummary::from_residuals(&[]);
        assert_eq!(s.n, 0);
        assert!(s.mae.is_nan());
    }

    #[test]
    fn test_pearson_perfect() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&x, &y) - 1.0).abs() < 1e-12);
        let neg: Vec<f64> = y.iter().map(|v| -v).collect();
        assert!((pearson(&x, &neg) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_degenerate() {
        assert!(pearson(&[1.0, 2.0], &[1.0, 2.0]).is_nan());
        assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_nan());
    }

    #[test]
    fn test_correlation_improved() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let before = [-2.0, -4.0, -6.0, -8.0];
        let after = [0.5, -0.5, -0.5, 0.5];
        let c = CovariateCorrelation::compute("soc", &x, &before, &after);
        assert!((c.r_before + 1.0).abs() < 1e-12);
        assert!(c.improved);

        let worse = CovariateCorrelation::compute("soc", &x, &after, &before);
        assert!(!worse.improved);

        let flat = CovariateCorrelation::compute("soc", &[1.0, 1.0, 1.0, 1.0], &before, &after);
        assert!(!flat.improved);
    }

    #[test]
    fn test_finite_mean() {
        assert_eq!(finite_mean(&[1.0, f64::NAN, 3.0]), 2.0);
        assert!(finite_mean(&[]).is_nan());
    }
}
