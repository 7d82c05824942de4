use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by structure handling, potentials and property engines.
#[derive(Error, Debug)]
pub enum CalcError {
    // --- Input ---
    #[error("Failed to parse {format} input '{source_name}': {reason}")]
    Parse {
        format: String,
        source_name: String,
        reason: String,
    },

    #[error("Failed to access '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // --- Setup ---
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    // --- Runtime ---
    #[error("Potential '{potential}' cannot evaluate structure: {reason}")]
    Evaluation { potential: String, reason: String },

    #[error("Numerical failure: {0}")]
    Numerical(String),
}

impl CalcError {
    pub fn parse(format: &str, source_name: &str, reason: impl Into<String>) -> Self {
        CalcError::Parse {
            format: format.to_string(),
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn evaluation(potential: &str, reason: impl Into<String>) -> Self {
        CalcError::Evaluation {
            potential: potential.to_string(),
            reason: reason.into(),
        }
    }

    /// Parse and configuration problems abort a run; everything else is
    /// attributed to the structure being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CalcError::Parse { .. } | CalcError::Configuration(_) | CalcError::Io { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CalcError>;

/// Non-fatal report that an iterative stage stopped on its step budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceWarning {
    /// Which stage gave up (e.g. "relaxation", "phonon pre-relaxation").
    pub stage: String,
    pub iterations: usize,
    pub max_force: f64,
    pub max_stress: Option<f64>,
}

impl std::fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} not converged after {} steps (max force {:.4} eV/Å",
            self.stage, self.iterations, self.max_force
        )?;
        if let Some(s) = self.max_stress {
            write!(f, ", max stress {:.5} eV/Å³", s)?;
        }
        write!(f, ")")
    }
}
