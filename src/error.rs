//! Error types for MPower
//!
//! This module defines the I/O and configuration errors of the library, and
//! the [`DegenerateFit`] branch returned by numeric fitters. Numeric fitters
//! never fail hard: a degenerate fit still carries the fallback parameters
//! the caller should use.

use std::fmt;
use thiserror::Error;

/// Result type alias for MPower operations
pub type Result<T> = std::result::Result<T, MpowerError>;

/// Main error type for MPower operations
#[derive(Error, Debug)]
pub enum MpowerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Required column absent from the input table
    #[error("Missing column: {0}")]
    MissingColumn(String),

    /// Malformed input row
    #[error("Invalid row {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    /// No usable runs/samples
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parameter artifact lacks a required key
    #[error("Artifact missing key: {0}")]
    ArtifactKey(String),

    /// Linear system could not be solved even after ridge escalation
    #[error("Singular system: {rows}x{cols} design")]
    Singular { rows: usize, cols: usize },

    /// Fewer complete rows than a report-only fit needs
    #[error("Not enough rows to fit: n={rows} p={params}")]
    Underdetermined { rows: usize, params: usize },
}

/// Why a fit fell back to its default parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum DegenerateReason {
    /// Fewer usable rows than the closed-form solve needs.
    InsufficientData { usable: usize, required: usize },
    /// The observed signal is missing for the whole run.
    MissingSignal(&'static str),
    /// Normal equations were singular.
    Singular,
    /// Unconstrained coefficients violated a physical sign constraint.
    SignViolation(&'static str),
}

impl fmt::Display for DegenerateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegenerateReason::InsufficientData { usable, required } => {
                write!(f, "insufficient data: {} usable, {} required", usable, required)
            }
            DegenerateReason::MissingSignal(name) => write!(f, "missing signal: {}", name),
            DegenerateReason::Singular => write!(f, "singular normal equations"),
            DegenerateReason::SignViolation(name) => write!(f, "sign constraint violated: {}", name),
        }
    }
}

/// A degenerate fit together with the fallback value to use instead.
#[derive(Debug, Clone, PartialEq)]
pub struct DegenerateFit<P> {
    pub reason: DegenerateReason,
    pub fallback: P,
}

impl<P> DegenerateFit<P> {
    pub fn new(reason: DegenerateReason, fallback: P) -> Self {
        Self { reason, fallback }
    }
}

impl<P: fmt::Debug> fmt::Display for DegenerateFit<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (fallback: {:?})", self.reason, self.fallback)
    }
}

/// Outcome of a numeric fit: fitted parameters or a documented fallback.
pub type FitResult<P> = std::result::Result<P, DegenerateFit<P>>;

/// Collapse a [`FitResult`] into the parameters actually used.
pub trait FitOutcome<P> {
    /// Parameters to use downstream, fitted or fallback.
    fn resolve(self) -> P;

    /// True when the fallback branch was taken.
    fn is_degenerate(&self) -> bool;
}

impl<P> FitOutcome<P> for FitResult<P> {
    fn resolve(self) -> P {
        match self {
            Ok(p) => p,
            Err(d) => d.fallback,
        }
    }

    fn is_degenerate(&self) -> bool {
        self.is_err()
    }
}
