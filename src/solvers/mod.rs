use serde::{Deserialize, Serialize};

use crate::core::domain::Structure;
use crate::engine::potential::Potential;
use crate::error::{ConvergenceWarning, Result};

/// Summary of one finished batch item.
/// Used for progress reporting and the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub index: usize,
    pub label: String,
    pub success: bool,
    /// False when the item succeeded but an iterative stage hit its step budget.
    pub converged: bool,
    pub elapsed_secs: f64,
    /// Error or convergence warning text, if any.
    pub message: Option<String>,
}

/// Events emitted by the batch executor to whoever is listening.
#[derive(Debug, Clone)]
pub enum CalcEvent {
    /// Diagnostic log message.
    Log(String),

    /// A worker picked up an item.
    ItemStarted { index: usize, label: String },

    /// An item finished, successfully or not.
    ItemFinished(ItemSummary),

    /// The whole batch is done.
    Finished {
        succeeded: usize,
        failed: usize,
        elapsed_secs: f64,
    },
}

/// Result payload of a property engine.
pub trait CalculationOutput {
    /// True when every iterative stage met its tolerance.
    fn converged(&self) -> bool;

    /// Convergence problems encountered along the way, never hidden.
    fn warnings(&self) -> Vec<ConvergenceWarning>;
}

/// A property engine that can be applied to one structure at a time.
///
/// Engines hold only configuration; the potential is passed per call so a
/// batch can give every worker its own instance.
pub trait PropertyCalculator: Send + Sync {
    type Output: CalculationOutput + Send;

    /// Short name used in logs and reports (e.g., "elasticity").
    fn name(&self) -> &'static str;

    fn calculate(&self, structure: &Structure, potential: &dyn Potential) -> Result<Self::Output>;
}

pub mod batch;
pub mod elasticity;
pub mod phonon;
pub mod relax;
pub mod surface;
