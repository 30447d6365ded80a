// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Shared regression core.
//!
//! Every fitter in the crate reduces to the ridge-regularized normal
//! equations `(XᵀWX + λI) β = XᵀWy`. They are solved by Cholesky with an LU
//! fallback; when both fail the ridge is escalated a bounded number of times
//! before giving up with [`MpowerError::Singular`].

use crate::config::HuberConfig;
use crate::error::{MpowerError, Result};
use crate::sample::median;
use log::debug;
use nalgebra::{DMatrix, DVector};

/// Consistency constant making the MAD a standard-deviation estimate under
/// normal errors.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Ridge used when the caller's ridge is zero and the system is singular.
const MIN_ESCALATION_RIDGE: f64 = 1e-10;
const MAX_ESCALATIONS: usize = 8;

/// Solve `(XᵀX + λI) β = Xᵀy`.
pub fn ridge_solve(x: &DMatrix<f64>, y: &DVector<f64>, ridge: f64) -> Result<DVector<f64>> {
    let xt = x.transpose();
    solve_normal(xt.clone() * x, xt * y, ridge, x.nrows())
}

/// Solve `(XᵀWX + λI) β = XᵀWy` with per-row weights `w`.
pub fn weighted_ridge_solve(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    w: &DVector<f64>,
    ridge: f64,
) -> Result<DVector<f64>> {
    let mut xw = x.clone();
    for (mut row, wi) in xw.row_iter_mut().zip(w.iter()) {
        row *= *wi;
    }
    let xwt = xw.transpose();
    let a = xwt.clone() * x;
    let b = xwt * y;
    solve_normal(a, b, ridge, x.nrows())
}

fn solve_normal(a: DMatrix<f64>, b: DVector<f64>, ridge: f64, rows: usize) -> Result<DVector<f64>> {
    let p = a.ncols();
    if p == 0 {
        return Ok(DVector::zeros(0));
    }
    let mut lambda = ridge.max(0.0);
    for attempt in 0..=MAX_ESCALATIONS {
        let reg = &a + DMatrix::<f64>::identity(p, p) * lambda;
        let solved = match reg.clone().cholesky() {
            Some(chol) => Some(chol.solve(&b)),
            None => reg.lu().solve(&b),
        };
        if let Some(beta) = solved.filter(|beta| beta.iter().all(|v| v.is_finite())) {
            if attempt > 0 {
                debug!("normal equations solved after ridge escalation to {:e}", lambda);
            }
            return Ok(beta);
        }
        lambda = (lambda * 10.0).max(MIN_ESCALATION_RIDGE);
    }
    Err(MpowerError::Singular { rows, cols: p })
}

/// Robust residual scale: `1.4826 · MAD`, falling back to the standard
/// deviation and then to 1.
pub fn robust_scale(residuals: &[f64]) -> f64 {
    let med = match median(residuals) {
        Some(m) => m,
        None => return 1.0,
    };
    let abs_dev: Vec<f64> = residuals.iter().map(|r| (r - med).abs()).collect();
    let mad = median(&abs_dev).unwrap_or(0.0);
    if mad > 0.0 {
        return MAD_TO_SIGMA * mad;
    }
    let finite: Vec<f64> = residuals.iter().copied().filter(|r| r.is_finite()).collect();
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let std = (finite.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std > 0.0 {
        std
    } else {
        1.0
    }
}

/// Huber weights of standardized residuals.
pub fn huber_weights(standardized: &[f64], threshold: f64) -> Vec<f64> {
    standardized
        .iter()
        .map(|u| {
            let a = u.abs();
            if a > threshold {
                threshold / a
            } else {
                1.0
            }
        })
        .collect()
}

/// Result of a Huber IRLS fit.
#[derive(Debug, Clone)]
pub struct IrlsFit {
    pub beta: DVector<f64>,
    /// Final per-row weights.
    pub weights: DVector<f64>,
    /// Residual scale of the last iteration.
    pub scale: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Huber-weighted iteratively reweighted least squares.
#[derive(Debug, Clone)]
pub struct HuberIrls {
    threshold: f64,
    max_iters: usize,
    tolerance: f64,
    ridge: f64,
}

impl HuberIrls {
    pub fn new(config: &HuberConfig, ridge: f64) -> Self {
        Self {
            threshold: config.threshold,
            max_iters: config.max_iters,
            tolerance: config.tolerance,
            ridge,
        }
    }

    /// Fit `y ~ X`. The initial solve is unweighted; each iteration rescales
    /// residuals by the robust scale, reweights and re-solves until the max
    /// coefficient change drops below the tolerance.
    pub fn fit(&self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<IrlsFit> {
        let mut beta = ridge_solve(x, y, self.ridge)?;
        let mut weights = DVector::from_element(x.nrows(), 1.0);
        let mut scale = 1.0;
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iters {
            iterations += 1;
            let resid = y - x * &beta;
            scale = robust_scale(resid.as_slice());
            let u: Vec<f64> = resid.iter().map(|r| r / scale).collect();
            weights = DVector::from_vec(huber_weights(&u, self.threshold));

            let next = weighted_ridge_solve(x, y, &weights, self.ridge)?;
            let delta = (&next - &beta).amax();
            beta = next;
            if delta < self.tolerance {
                converged = true;
                break;
            }
        }

        debug!(
            "huber irls: {} iterations, converged={}, scale={:.4}",
            iterations, converged, scale
        );
        Ok(IrlsFit {
            beta,
            weights,
            scale,
            iterations,
            converged,
        })
    }
}

/// Clamp every coefficient to be nonnegative; non-finite values become 0.
pub fn clamp_nonnegative(beta: &mut DVector<f64>) {
    for b in beta.iter_mut() {
        if !b.is_finite() || *b < 0.0 {
            *b = 0.0;
        }
    }
}

/// `argmin_{s ≥ 0} ||target - s · pred||²` = `max(0, <pred, target> / <pred, pred>)`.
/// Zero when the prediction is identically zero.
pub fn fit_nonnegative_scale(pred: &[f64], target: &[f64]) -> f64 {
    let (num, den) = pred
        .iter()
        .zip(target)
        .filter(|(p, t)| p.is_finite() && t.is_finite())
        .fold((0.0, 0.0), |(n, d), (p, t)| (n + p * t, d + p * p));
    if den > 0.0 {
        (num / den).max(0.0)
    } else {
        0.0
    }
}
