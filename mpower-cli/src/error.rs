// MPower CLI - Error types
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Model(#[from] mpower::MpowerError),

    #[error("Invalid argument {flag}: {reason}")]
    InvalidArgument { flag: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

impl CliError {
    pub fn invalid(flag: &'static str, reason: impl Into<String>) -> Self {
        CliError::InvalidArgument {
            flag,
            reason: reason.into(),
        }
    }
}
