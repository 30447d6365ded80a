//! Named feature sets
//!
//! A design matrix is the stacked evaluation of a statically declared list of
//! `(name, evaluate(row) -> f64)` pairs. Model variants declare their feature
//! set once; fitting, prediction and the parameter artifact all read the
//! same names.

use nalgebra::{DMatrix, DVector};
use std::fmt;

/// One named feature over rows of type `R`.
pub struct Feature<'a, R> {
    name: String,
    eval: Box<dyn Fn(&R) -> f64 + 'a>,
}

impl<'a, R> Feature<'a, R> {
    pub fn new(name: impl Into<String>, eval: impl Fn(&R) -> f64 + 'a) -> Self {
        Self {
            name: name.into(),
            eval: Box::new(eval),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, row: &R) -> f64 {
        (self.eval)(row)
    }
}

impl<R> fmt::Debug for Feature<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature").field("name", &self.name).finish()
    }
}

/// An ordered feature list.
#[derive(Debug)]
pub struct FeatureSet<'a, R> {
    features: Vec<Feature<'a, R>>,
}

impl<R> Default for FeatureSet<'_, R> {
    fn default() -> Self {
        Self {
            features: Vec::new(),
        }
    }
}

impl<'a, R> FeatureSet<'a, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, name: impl Into<String>, eval: impl Fn(&R) -> f64 + 'a) -> Self {
        self.push(Feature::new(name, eval));
        self
    }

    pub fn push(&mut self, feature: Feature<'a, R>) {
        self.features.push(feature);
    }

    /// Constant column named `intercept`.
    pub fn with_intercept(self) -> Self {
        self.with("intercept", |_| 1.0)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(Feature::name).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|f| f.name == name)
    }

    /// Evaluate one row.
    pub fn row(&self, row: &R) -> Vec<f64> {
        self.features.iter().map(|f| f.evaluate(row)).collect()
    }

    /// Stack the evaluation of every row into a design matrix.
    pub fn design<'r>(&self, rows: impl IntoIterator<Item = &'r R>) -> DMatrix<f64>
    where
        R: 'r,
    {
        let mut data = Vec::new();
        let mut n = 0;
        for r in rows {
            data.extend(self.row(r));
            n += 1;
        }
        DMatrix::from_row_slice(n, self.len(), &data)
    }

    /// Linear prediction `x(row) · beta`.
    pub fn predict(&self, row: &R, beta: &DVector<f64>) -> f64 {
        self.features
            .iter()
            .zip(beta.iter())
            .map(|(f, b)| f.evaluate(row) * b)
            .sum()
    }

    /// True when every feature of the row is finite.
    pub fn is_complete(&self, row: &R) -> bool {
        self.features.iter().all(|f| f.evaluate(row).is_finite())
    }
}
